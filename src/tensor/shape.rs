//! Shape arithmetic: brick-group rounding, NHWCB/FCAF byte sizes, stripe
//! counting, rescale multiplier/shift derivation and the stride-interleave
//! channel remap.
//!
//! Every function that multiplies tensor dimensions together uses checked
//! arithmetic and fails with [`CompilerError::InternalError`] (tagged
//! `ShapeOverflow` in spirit) rather than silently wrapping, since a
//! wrapped 32-bit product here would silently corrupt a downstream SRAM
//! offset or DMA size.

use crate::errors::{CResult, CompilerError};
use crate::tensor::TensorShape;

/// The hardware's native tile shape: `(1, BrickH, BrickW, BrickC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrickGroup {
    pub h: u32,
    pub w: u32,
    pub c: u32,
}

pub const BRICK_GROUP: BrickGroup = BrickGroup { h: 8, w: 8, c: 16 };

impl BrickGroup {
    pub fn volume(self) -> u64 {
        self.h as u64 * self.w as u64 * self.c as u64
    }
}

pub fn brick_group_volume() -> u64 {
    BRICK_GROUP.volume()
}

/// `(1, 8, 4)` H x W, used for PLE patch costing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchShape {
    pub h: u32,
    pub w: u32,
}

pub const PATCH_SHAPE: PatchShape = PatchShape { h: 8, w: 4 };

fn shape_overflow(what: &str) -> CompilerError {
    CompilerError::InternalError(format!("ShapeOverflow: {what}"))
}

/// `N*H*W*C`, fails if the product would overflow a 32-bit quantity (the
/// representation every downstream size field uses).
pub fn volume(shape: &TensorShape) -> u64 {
    shape.iter().map(|&d| d as u64).product()
}

fn checked_volume_u32(dims: [u32; 4], what: &str) -> CResult<u32> {
    let mut acc: u64 = 1;
    for d in dims {
        acc = acc
            .checked_mul(d as u64)
            .ok_or_else(|| shape_overflow(what))?;
        if acc > u32::MAX as u64 {
            return Err(shape_overflow(what));
        }
    }
    Ok(acc as u32)
}

fn round_up(value: u32, multiple: u32) -> CResult<u32> {
    if multiple == 0 {
        return Err(shape_overflow("round_up by zero"));
    }
    let rem = value % multiple;
    if rem == 0 {
        Ok(value)
    } else {
        value
            .checked_add(multiple - rem)
            .ok_or_else(|| shape_overflow("round_up overflow"))
    }
}

/// Rounds `[N,H,W,C]` up to whole brick-group multiples in H, W and C (N is
/// left untouched — contracts require `N==1`).
pub fn round_up_to_brick_group(shape: TensorShape) -> CResult<TensorShape> {
    Ok([
        shape[0],
        round_up(shape[1], BRICK_GROUP.h)?,
        round_up(shape[2], BRICK_GROUP.w)?,
        round_up(shape[3], BRICK_GROUP.c)?,
    ])
}

/// Byte size of a tensor laid out in NHWCB (brick-grouped NHWC).
pub fn byte_size_nhwcb(shape: TensorShape) -> CResult<u32> {
    let rounded = round_up_to_brick_group(shape)?;
    checked_volume_u32(rounded, "byte_size_nhwcb")
}

/// FCAF-wide: compresses along W in blocks of 8, keeping H/C brick-group
/// rounded. Matches the "wide" activation-compression block shape.
pub fn byte_size_fcaf_wide(shape: TensorShape) -> CResult<u32> {
    let rounded = round_up_to_brick_group(shape)?;
    let w = round_up(rounded[2], 8)?;
    checked_volume_u32([rounded[0], rounded[1], w, rounded[3]], "byte_size_fcaf_wide")
}

/// FCAF-deep: compresses along C in blocks of 32 instead of the brick
/// group's native 16.
pub fn byte_size_fcaf_deep(shape: TensorShape) -> CResult<u32> {
    let rounded = round_up_to_brick_group(shape)?;
    let c = round_up(rounded[3], 32)?;
    checked_volume_u32([rounded[0], rounded[1], rounded[2], c], "byte_size_fcaf_deep")
}

/// Number of stripes needed per axis (H, W, C) and in total, given a full
/// tensor shape and a candidate stripe shape. `N` is assumed 1 throughout.
pub fn num_stripes(shape: TensorShape, stripe_shape: TensorShape) -> CResult<(u32, u32, u32, u32)> {
    if stripe_shape[1] == 0 || stripe_shape[2] == 0 || stripe_shape[3] == 0 {
        return Err(shape_overflow("zero-sized stripe"));
    }
    let h = (shape[1] + stripe_shape[1] - 1) / stripe_shape[1];
    let w = (shape[2] + stripe_shape[2] - 1) / stripe_shape[2];
    let c = (shape[3] + stripe_shape[3] - 1) / stripe_shape[3];
    let total = checked_volume_u32([1, h, w, c], "num_stripes total")?;
    Ok((h, w, c, total))
}

/// Derives a 16-bit fixed-point multiplier and a `0..=31` right-shift from a
/// floating-point rescale ratio, i.e. finds `(m, s)` such that
/// `ratio ~= m / 2^s` with `m` normalised into the top half of the 16-bit
/// range for maximum precision.
pub fn rescale_multiplier_and_shift(ratio: f32) -> CResult<(u16, u8)> {
    if !(ratio.is_finite()) || ratio <= 0.0 {
        return Err(CompilerError::InternalError(format!(
            "rescale ratio must be finite and positive, got {ratio}"
        )));
    }

    let mut value = ratio;
    let mut exponent: i32 = 0;
    while value >= 1.0 {
        value /= 2.0;
        exponent += 1;
    }
    while value < 0.5 {
        value *= 2.0;
        exponent -= 1;
    }
    // value is now in [0.5, 1.0); scale into a 16-bit mantissa.
    let mantissa = (value * 65536.0).round().min(65535.0).max(0.0) as u32;
    let multiplier = mantissa.min(u16::MAX as u32) as u16;
    let shift = (16 - exponent).clamp(0, 31) as u8;
    Ok((multiplier, shift))
}

/// Computes the channel-wise remap table needed to process a strided IFM as
/// if it were unstrided: each output slot is the original channel a
/// particular `(x_phase, y_phase)` sub-sampling reads from, repeated (and
/// zero-extended by repetition, never by fabricating data) until there are
/// at least `num_srams` slots so every SRAM lane has a source channel.
pub fn channel_remap_for_stride(input_c: u32, stride_x: u32, stride_y: u32, num_srams: u32) -> CResult<Vec<u32>> {
    if input_c == 0 || stride_x == 0 || stride_y == 0 || num_srams == 0 {
        return Err(shape_overflow("channel_remap_for_stride: zero argument"));
    }
    let natural = checked_volume_u32([1, 1, stride_x * stride_y, input_c], "channel_remap_for_stride")?;
    let total = natural.max(num_srams);
    Ok((0..total).map(|i| i % input_c).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_aligns_all_three_spatial_axes() {
        let shape = round_up_to_brick_group([1, 9, 1, 1]).unwrap();
        assert_eq!(shape, [1, 16, 8, 16]);
    }

    #[test]
    fn nhwcb_byte_size_matches_scenario_one() {
        // Identity Reshape scenario from spec: (1,8,32,16) NHWCB -> 4096 bytes.
        let size = byte_size_nhwcb([1, 8, 32, 16]).unwrap();
        assert_eq!(size, 4096);
    }

    #[test]
    fn num_stripes_rounds_up_per_axis() {
        let (h, w, c, total) = num_stripes([1, 17, 8, 16], [1, 8, 8, 16]).unwrap();
        assert_eq!((h, w, c), (3, 1, 1));
        assert_eq!(total, 3);
    }

    #[test]
    fn rescale_multiplier_round_trips_to_within_one_lsb() {
        for &ratio in &[0.001_f32, 0.5, 1.0, 2.3, 100.0] {
            let (m, s) = rescale_multiplier_and_shift(ratio).unwrap();
            let reconstructed = m as f64 / (1u64 << s) as f64;
            assert!(
                (reconstructed - ratio as f64).abs() < ratio as f64 * 0.001 + 1e-6,
                "ratio {ratio} reconstructed as {reconstructed} (m={m}, s={s})"
            );
        }
    }

    #[test]
    fn channel_remap_expands_unit_channel_stride_two_to_num_srams() {
        let remap = channel_remap_for_stride(1, 2, 2, 4).unwrap();
        assert_eq!(remap.len(), 4);
        assert!(remap.iter().all(|&c| c == 0));
    }

    #[test]
    fn volume_overflow_is_rejected() {
        let huge = [1, u32::MAX, u32::MAX, 2];
        assert!(round_up_to_brick_group(huge).is_err() || byte_size_nhwcb(huge).is_err());
    }
}
