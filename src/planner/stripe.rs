//! Stripe-shape candidate enumeration and the per-axis derivations the
//! planner needs (§4.F): MCE input stripe (stride + kernel halo), weight
//! stripe, PLE input/output stripe, and in-flight tile depth.
//!
//! Grounded on `original_source/.../cascading/McePart.cpp`'s stripe-config
//! generation (split H/W/C by powers of two, largest first) and
//! `nonCascading/PlePass.cpp` for the "PLE reuses MCE output shape" rule.

use crate::ir::node::Stride;
use crate::tensor::{round_up_to_brick_group, TensorShape};

/// Splits along an axis tried in order, largest stripe (i.e. fewest splits)
/// first, matching "enumerates high-priority plans first".
const SPLIT_FACTORS: [u32; 5] = [1, 2, 4, 8, 16];

/// Candidate output stripe shapes for `full_shape`, largest-stripe-first.
/// Each axis is split independently by a factor from [`SPLIT_FACTORS`] and
/// the result rounded up to a brick-group multiple; degenerate splits that
/// round back up to the full axis size are skipped once already seen.
pub fn candidate_output_stripes(full_shape: TensorShape) -> Vec<TensorShape> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for &fc in &SPLIT_FACTORS {
        for &fh in &SPLIT_FACTORS {
            for &fw in &SPLIT_FACTORS {
                let stripe = [
                    full_shape[0],
                    split_axis(full_shape[1], fh),
                    split_axis(full_shape[2], fw),
                    split_axis(full_shape[3], fc),
                ];
                let Ok(rounded) = round_up_to_brick_group(stripe) else { continue };
                let clamped = [
                    rounded[0],
                    rounded[1].min(full_shape[1]),
                    rounded[2].min(full_shape[2]),
                    rounded[3].min(full_shape[3]),
                ];
                if seen.insert(clamped) {
                    out.push(clamped);
                }
            }
        }
    }
    // Largest volume (fewest, biggest stripes) first.
    out.sort_by(|a, b| {
        let va: u64 = a.iter().map(|&d| d as u64).product();
        let vb: u64 = b.iter().map(|&d| d as u64).product();
        vb.cmp(&va)
    });
    out
}

fn split_axis(full: u32, factor: u32) -> u32 {
    if factor == 0 {
        return full;
    }
    (full + factor - 1) / factor
}

/// MCE input stripe for a given output stripe: unchanged in channels, scaled
/// by stride in H/W, with a `(kernel - 1)` halo added only on axes actually
/// split (a full-axis stripe never needs neighbour halo).
pub fn mce_input_stripe(
    full_output_shape: TensorShape,
    output_stripe: TensorShape,
    ifm_channels: u32,
    kernel_h: u32,
    kernel_w: u32,
    stride: Stride,
) -> TensorShape {
    let h_split = output_stripe[1] < full_output_shape[1];
    let w_split = output_stripe[2] < full_output_shape[2];
    let halo_h = if h_split { kernel_h.saturating_sub(1) } else { 0 };
    let halo_w = if w_split { kernel_w.saturating_sub(1) } else { 0 };
    [
        output_stripe[0],
        output_stripe[1] * stride.y.max(1) + halo_h,
        output_stripe[2] * stride.x.max(1) + halo_w,
        ifm_channels,
    ]
}

/// Weight stripe shape in `[kernel_h, kernel_w, ifm_or_1, ofm_stripe_c]`
/// order (HWIO/HWIM — see [`crate::tensor::CompilerDataFormat`]).
pub fn weight_stripe(output_stripe_c: u32, ifm_channels_or_multiplier: u32, kernel_h: u32, kernel_w: u32) -> TensorShape {
    [kernel_h, kernel_w, ifm_channels_or_multiplier, output_stripe_c]
}

/// PLE input/output stripe: an identity PLE reuses the MCE's output stripe
/// scaled by `shape_multiplier` (upsample-driven PLE kernels only; most
/// kernels use multiplier `(1,1,1)`).
pub fn ple_stripe(mce_output_stripe: TensorShape, shape_multiplier: (u32, u32, u32)) -> TensorShape {
    [
        mce_output_stripe[0],
        mce_output_stripe[1] * shape_multiplier.0.max(1),
        mce_output_stripe[2] * shape_multiplier.1.max(1),
        mce_output_stripe[3] * shape_multiplier.2.max(1),
    ]
}

/// Number of stripes to keep resident in SRAM at once for a tile streamed
/// `total_stripes` times along a halo-bearing axis: 1 if there's only one
/// stripe total, 2 for simple double-buffering, 3 only when the consumer
/// needs both the before-neighbour and after-neighbour stripe resident
/// alongside the current one (a non-unit kernel with more than two stripes
/// along the split axis).
pub fn num_stripes_in_tile(total_stripes: u32, needs_halo: bool) -> u32 {
    if total_stripes <= 1 {
        1
    } else if needs_halo && total_stripes > 2 {
        3
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_tensor_stripe_is_enumerated_first() {
        let full = [1, 32, 32, 64];
        let candidates = candidate_output_stripes(full);
        assert_eq!(candidates[0], full);
    }

    #[test]
    fn smaller_stripes_appear_after_larger_ones() {
        let candidates = candidate_output_stripes([1, 32, 32, 64]);
        for w in candidates.windows(2) {
            let va: u64 = w[0].iter().map(|&d| d as u64).product();
            let vb: u64 = w[1].iter().map(|&d| d as u64).product();
            assert!(va >= vb);
        }
    }

    #[test]
    fn full_axis_stripe_needs_no_halo() {
        let full = [1, 16, 16, 16];
        let stripe = mce_input_stripe(full, full, 16, 3, 3, Stride { x: 1, y: 1 });
        assert_eq!(stripe, [1, 16, 16, 16]);
    }

    #[test]
    fn split_axis_stripe_gains_kernel_halo() {
        let full = [1, 32, 32, 16];
        let output_stripe = [1, 8, 32, 16];
        let stripe = mce_input_stripe(full, output_stripe, 16, 3, 3, Stride { x: 1, y: 1 });
        assert_eq!(stripe, [1, 8 + 2, 32, 16]);
    }

    #[test]
    fn tile_depth_escalates_to_three_only_with_halo_and_enough_stripes() {
        assert_eq!(num_stripes_in_tile(1, true), 1);
        assert_eq!(num_stripes_in_tile(2, true), 2);
        assert_eq!(num_stripes_in_tile(3, true), 3);
        assert_eq!(num_stripes_in_tile(3, false), 2);
    }
}
