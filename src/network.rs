//! §6 input: the external `Network` schema — a sequence of operator
//! records with fixed shapes, as handed to the compiler by the (excluded)
//! graph-construction API wrapper. Building this crate's IR [`Graph`] from
//! a `Network` is in scope (§1's subsystem 1, "IR and graph transformation
//! — construction"); the fluent builder API callers use to *assemble* a
//! `Network` is the excluded collaborator.
//!
//! Grounded on `original_source/.../Network.hpp`'s operator record schema;
//! the arena-of-records-plus-operand-references shape follows the
//! teacher's `src/graph/mod.rs` `Node`/`NodeId` idiom, generalised from a
//! single-input-per-op autograd DAG to the multi-input operator records a
//! CNN graph needs.

use crate::ir::node::{BiasAttr, MceOpKind, PleKernel, Stride, UpsampleType, WeightsAttr};
use crate::tensor::{CompilerDataFormat, QuantizationInfo, TensorInfo, TensorShape};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub u32);

/// A reference to one specific output of a previously-declared operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub operator: OperatorId,
    pub output_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperatorKind {
    Input,
    Output,
    Constant {
        data: Arc<Vec<u8>>,
    },
    Convolution {
        weights: WeightsAttr,
        bias: BiasAttr,
        stride: Stride,
        pad_top: u32,
        pad_left: u32,
        upscale_factor: u32,
        upsample_type: UpsampleType,
    },
    DepthwiseConvolution {
        weights: WeightsAttr,
        bias: BiasAttr,
        stride: Stride,
        pad_top: u32,
        pad_left: u32,
    },
    FullyConnected {
        weights: WeightsAttr,
        bias: BiasAttr,
    },
    Relu {
        lower_bound: i16,
        upper_bound: i16,
    },
    PleElementwise {
        kernel: PleKernel,
        leaky_alpha: Option<f32>,
    },
    Pooling {
        kernel: PleKernel, // MaxPool | AvgPool
        shape_multiplier: (u32, u32, u32),
    },
    Reshape,
    FormatConversion {
        from: CompilerDataFormat,
        to: CompilerDataFormat,
    },
    Concatenation {
        axis: u32,
    },
    ExtractSubtensor {
        supertensor_offset: TensorShape,
    },
    Requantize,
    SpaceToDepth {
        block_size: u32,
    },
    /// An operator this compiler's taxonomy has no mapping for; carries the
    /// human-readable reason so `EstimatePerformance` can still annotate it.
    Unsupported {
        reason: String,
    },
}

/// One record in the `Network`: a unique id, its operand inputs (in
/// declared order), its kind-specific parameters, and the declared output
/// tensor info (dims/dtype/format/quant) every operator must carry per §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub id: OperatorId,
    pub inputs: Vec<Operand>,
    pub kind: OperatorKind,
    pub output: TensorInfo,
}

/// A typed Network: §6's "sequence of operator records with fixed
/// schemas". Operators must be declared in an order where every operand
/// reference points at an earlier id — the same acyclic-by-construction
/// discipline the IR `Graph` enforces structurally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    operators: Vec<OperatorRecord>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operator, validating that every operand it references
    /// names an already-declared operator (batch-size and zero-point
    /// envelope checks are deferred to `fail_early_checks`, which needs the
    /// full network assembled to also check Reinterpret shape volumes).
    pub fn add_operator(
        &mut self,
        inputs: Vec<Operand>,
        kind: OperatorKind,
        output: TensorInfo,
    ) -> Result<OperatorId, crate::errors::CompilerError> {
        let id = OperatorId(self.operators.len() as u32);
        for operand in &inputs {
            if operand.operator.0 >= id.0 {
                return Err(crate::errors::CompilerError::internal(format!(
                    "operator {:?} references undeclared operand {:?}",
                    id, operand.operator
                )));
            }
        }
        self.operators.push(OperatorRecord { id, inputs, kind, output });
        Ok(id)
    }

    pub fn operators(&self) -> &[OperatorRecord] {
        &self.operators
    }

    pub fn operator(&self, id: OperatorId) -> Option<&OperatorRecord> {
        self.operators.get(id.0 as usize)
    }

    /// §7 "fail-early capability checks": batch size > 1, zero-points
    /// outside the declared dtype's range. Run once before graph
    /// construction so these surface as a single `NotSupported` with every
    /// failing op id, rather than one at a time during IR construction.
    pub fn fail_early_checks(&self) -> Result<(), crate::errors::CompilerError> {
        let mut failing = Vec::new();
        for op in &self.operators {
            let bad_batch = op.output.dims[0] != 1;
            let bad_zero_point = !op.output.data_type.zero_point_in_range(op.output.quant.zero_point);
            if bad_batch || bad_zero_point {
                failing.push(op.id.0);
            }
        }
        if failing.is_empty() {
            Ok(())
        } else {
            Err(crate::errors::CompilerError::not_supported_ops(
                "batch size must be 1 and zero-points must lie within the tensor's dtype range",
                failing,
            ))
        }
    }
}

/// Convenience constructor mirroring how a caller typically declares a
/// tensor info, kept here (rather than on `TensorInfo` itself) since it's
/// network-construction-specific sugar, not a shape-arithmetic primitive.
pub fn tensor_info(dims: TensorShape, data_type: crate::tensor::DataType, format: CompilerDataFormat, zero_point: i32, scale: f32) -> TensorInfo {
    TensorInfo {
        dims,
        data_type,
        format,
        quant: QuantizationInfo::per_tensor(zero_point, scale),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DataType;

    #[test]
    fn add_operator_rejects_forward_references() {
        let mut net = Network::new();
        let future = Operand { operator: OperatorId(5), output_index: 0 };
        let result = net.add_operator(
            vec![future],
            OperatorKind::Reshape,
            tensor_info([1, 1, 1, 1], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn fail_early_rejects_batch_greater_than_one() {
        let mut net = Network::new();
        net.add_operator(
            vec![],
            OperatorKind::Input,
            tensor_info([2, 4, 4, 4], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0),
        )
        .unwrap();
        let err = net.fail_early_checks().unwrap_err();
        assert!(matches!(err, crate::errors::CompilerError::NotSupported { .. }));
    }
}
