//! Tensor shape and quantisation primitives (module A).
//!
//! Everything here is pure arithmetic over `[N, H, W, C]` shapes and
//! quantisation metadata; no heap allocation beyond the vectors callers ask
//! for, and nothing here depends on the IR graph.

mod shape;

pub use shape::{
    brick_group_volume, byte_size_fcaf_deep, byte_size_fcaf_wide, byte_size_nhwcb,
    channel_remap_for_stride, num_stripes, rescale_multiplier_and_shift, round_up_to_brick_group,
    BrickGroup, PatchShape, BRICK_GROUP, PATCH_SHAPE,
};

use serde::{Deserialize, Serialize};

/// `[N, H, W, C]`. Most contracts in this crate require `n == 1`.
pub type TensorShape = [u32; 4];

/// Element datatype carried by a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I8,
    I32,
}

impl DataType {
    pub fn size_bytes(self) -> u32 {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::I32 => 4,
        }
    }

    pub fn zero_point_in_range(self, zero_point: i32) -> bool {
        match self {
            DataType::U8 => (0..=255).contains(&zero_point),
            DataType::I8 => (-128..=127).contains(&zero_point),
            DataType::I32 => true,
        }
    }
}

/// The compiler-internal data format a buffer's bytes are laid out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompilerDataFormat {
    Nhwc,
    Nhwcb,
    Nchw,
    /// `[H, W, I, O]` — weights for CONV / FULLY_CONNECTED.
    Hwio,
    /// `[H, W, I, M]` — weights for DEPTHWISE (M = channel multiplier).
    Hwim,
    /// Not yet placed into any Pass.
    None,
}

/// `(zero_point, scales)`. `scales` is length 1 (per-tensor) or equal to the
/// channel count (per-axis); operations that multiply quantisations
/// broadcast the singleton against a vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub zero_point: i32,
    pub scales: Vec<f32>,
}

impl QuantizationInfo {
    pub fn per_tensor(zero_point: i32, scale: f32) -> Self {
        Self {
            zero_point,
            scales: vec![scale],
        }
    }

    pub fn per_axis(zero_point: i32, scales: Vec<f32>) -> Self {
        Self { zero_point, scales }
    }

    pub fn is_per_axis(&self) -> bool {
        self.scales.len() > 1
    }

    /// Resolves the scale for channel `c`, broadcasting a per-tensor scalar.
    pub fn scale_for_channel(&self, c: usize) -> f32 {
        if self.scales.len() == 1 {
            self.scales[0]
        } else {
            self.scales[c]
        }
    }

    /// Multiplies two quantisation scale vectors, broadcasting a singleton
    /// against a per-axis vector as described in §3.
    pub fn multiply_scales(a: &QuantizationInfo, b: &QuantizationInfo, num_channels: usize) -> Vec<f32> {
        (0..num_channels)
            .map(|c| a.scale_for_channel(c.min(a.scales.len().saturating_sub(1))) * b.scale_for_channel(c.min(b.scales.len().saturating_sub(1))))
            .collect()
    }
}

/// Full type/shape/quant/format contract for a tensor flowing through the
/// network (the external-interface schema described in §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dims: TensorShape,
    pub data_type: DataType,
    pub format: CompilerDataFormat,
    pub quant: QuantizationInfo,
}

impl TensorInfo {
    pub fn volume(&self) -> u64 {
        shape::volume(&self.dims)
    }
}
