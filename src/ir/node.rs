//! Module C: node taxonomy. `NodeKind` is a tagged sum type standing in for
//! the deep `Node` subclass hierarchy in the source driver — the common
//! "is_prepared / fix_graph / generate / estimate" contract is dispatched
//! by pattern match in [`crate::ir::contract`] rather than virtual calls.

use crate::buffer_manager::BufferLocation;
use crate::ir::NodeId;
use crate::tensor::{CompilerDataFormat, DataType, QuantizationInfo, TensorShape};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PassId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MceOpKind {
    Conv,
    Depthwise,
    FullyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    Direct,
    Winograd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsampleType {
    Off,
    Nearest,
    Bilinear,
    Transpose,
}

/// PLE kernel identifiers. `TransposeXy` is singled out in §4.C's fix-graph
/// rule (it cannot be processed multi-stripe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PleKernel {
    Passthrough,
    Relu,
    LeakyRelu,
    Sigmoid,
    MaxPool,
    AvgPool,
    Add,
    TransposeXy,
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionHint {
    None,
    RequiredUncompressed,
    PreferCompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationHint {
    None,
    PreferDram,
    PreferSram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stride {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsAttr {
    pub data: Arc<Vec<u8>>,
    pub shape: TensorShape,
    pub format: CompilerDataFormat, // Hwio (CONV/FC) or Hwim (DEPTHWISE)
    pub quant: QuantizationInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasAttr {
    pub data: Arc<Vec<i32>>,
    pub scale: f32,
}

/// The taxonomy of IR node kinds (§4.C). Each variant carries exactly the
/// fields that differentiate it; shared attributes (id, output shape/dtype/
/// quant/format, buffer location, pass assignment) live on [`Node`] itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeKind {
    Input,
    Output {
        source_operation_output_index: u32,
    },
    Constant {
        data: Arc<Vec<u8>>,
    },
    MceOperation {
        weights: WeightsAttr,
        bias: BiasAttr,
        stride: Stride,
        pad_top: u32,
        pad_left: u32,
        upscale_factor: u32,
        upsample_type: UpsampleType,
        op: MceOpKind,
        algorithm: Option<Algorithm>,
        uninterleaved_input_shape: TensorShape,
    },
    McePostProcess {
        lower_bound: i16,
        upper_bound: i16,
    },
    FuseOnlyPle {
        kernel: PleKernel,
        shape_multiplier: (u32, u32, u32),
        leaky_alpha: Option<f32>,
        insert_identity_hint: bool,
    },
    StandalonePle {
        kernel: PleKernel,
    },
    FormatConversion {
        from: CompilerDataFormat,
        to: CompilerDataFormat,
    },
    Reinterpret,
    Concat {
        axis: u32,
    },
    ExtractSubtensor {
        supertensor_offset: TensorShape,
    },
    Copy,
    Requantize,
    SpaceToDepth {
        block_size: u32,
    },
    EstimateOnly {
        reason: String,
    },
}

impl NodeKind {
    /// §4.C: `get_effective_algorithm(caps, winograd_enabled)` — Winograd
    /// only for stride-1, non-upsampled CONV whose kernel shape has a
    /// profitable block size in the capability table; Direct otherwise.
    /// Returns `None` for non-`MceOperation` kinds.
    pub fn get_effective_algorithm(
        &self,
        caps: &crate::capabilities::HardwareCapabilities,
        winograd_enabled: bool,
    ) -> Option<Algorithm> {
        match self {
            NodeKind::MceOperation { op, stride, upsample_type, weights, .. } => {
                let (kh, kw) = (weights.shape[0], weights.shape[1]);
                let profitable_block = match (kh, kw) {
                    (1, 1) => caps.winograd_block_sizes.one_by_one,
                    (1, 3) => caps.winograd_block_sizes.one_by_three,
                    (3, 1) => caps.winograd_block_sizes.three_by_one,
                    (3, 3) => caps.winograd_block_sizes.three_by_three,
                    _ => 0,
                };
                let use_winograd = winograd_enabled
                    && *op == MceOpKind::Conv
                    && stride.x == 1
                    && stride.y == 1
                    && *upsample_type == UpsampleType::Off
                    && profitable_block > 0;
                Some(if use_winograd { Algorithm::Winograd } else { Algorithm::Direct })
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Input => "Input",
            NodeKind::Output { .. } => "Output",
            NodeKind::Constant { .. } => "Constant",
            NodeKind::MceOperation { .. } => "MceOperation",
            NodeKind::McePostProcess { .. } => "McePostProcess",
            NodeKind::FuseOnlyPle { .. } => "FuseOnlyPle",
            NodeKind::StandalonePle { .. } => "StandalonePle",
            NodeKind::FormatConversion { .. } => "FormatConversion",
            NodeKind::Reinterpret => "Reinterpret",
            NodeKind::Concat { .. } => "Concat",
            NodeKind::ExtractSubtensor { .. } => "ExtractSubtensor",
            NodeKind::Copy => "Copy",
            NodeKind::Requantize => "Requantize",
            NodeKind::SpaceToDepth { .. } => "SpaceToDepth",
            NodeKind::EstimateOnly { .. } => "EstimateOnly",
        }
    }
}

/// Common node fields shared by every taxonomy variant (§3's `Node` entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub corresponding_operation_ids: Vec<u32>,
    pub output_shape: TensorShape,
    pub output_dtype: DataType,
    pub output_quant: QuantizationInfo,
    pub format: CompilerDataFormat,
    pub location: BufferLocation,
    pub compression_hint: CompressionHint,
    pub location_hint: LocationHint,
    pub assigned_pass: Option<PassId>,
    /// Buffer id this node's output is registered under once `generate` has
    /// run (None beforehand).
    pub buffer_id: Option<u32>,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            corresponding_operation_ids: Vec::new(),
            output_shape: [1, 0, 0, 0],
            output_dtype: DataType::U8,
            output_quant: QuantizationInfo::per_tensor(0, 1.0),
            format: CompilerDataFormat::None,
            location: BufferLocation::None,
            compression_hint: CompressionHint::None,
            location_hint: LocationHint::None,
            assigned_pass: None,
            buffer_id: None,
        }
    }

    pub fn with_output(mut self, shape: TensorShape, dtype: DataType, quant: QuantizationInfo, format: CompilerDataFormat) -> Self {
        self.output_shape = shape;
        self.output_dtype = dtype;
        self.output_quant = quant;
        self.format = format;
        self
    }
}
