//! Module G: the parallel low-level `Op`/`Buffer` model (§4.G), used by the
//! cascading combiner and costed uniformly with the legacy `Pass` model via
//! [`crate::planner::pass_to_plan`].
//!
//! Grounded on `original_source/.../NetworkToGraphOfPartsConverter.hpp` /
//! `cascading/McePart.hpp` for the `Plan`/`PartInputMapping`/
//! `PartOutputMapping` shape; the arena-plus-edge-maps idiom itself follows
//! the teacher's `src/graph/mod.rs` `Graph`.

use crate::command_stream::OperandDescriptor;
use crate::errors::{CResult, CompilerError};
use crate::ir::node::{Algorithm, MceOpKind, PleKernel, Stride, UpsampleType};
use crate::tensor::{CompilerDataFormat, TensorShape};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferLocationTag {
    Dram,
    Sram,
}

/// SRAM-only metadata (§4.G: "for SRAM `{stripe_shape, num_stripes,
/// num_loads, packed_boundary, tile_size, format}`").
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SramMetadata {
    pub stripe_shape: TensorShape,
    pub num_stripes: u32,
    pub num_loads: u32,
    pub packed_boundary: bool,
    pub tile_size: u32,
    pub format: CompilerDataFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buffer {
    pub id: BufferId,
    pub location: BufferLocationTag,
    pub shape: TensorShape,
    pub sram: Option<SramMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    DmaOp {
        format: CompilerDataFormat,
    },
    MceOp {
        op: MceOpKind,
        algo: Algorithm,
        block_config: (u32, u32),
        stride: Stride,
        pad: (u32, u32),
        clamp: (i16, i16),
        upsample: UpsampleType,
        uninterleaved_shape: TensorShape,
    },
    PleOp {
        kernel: PleKernel,
        block_config: (u32, u32),
        inputs: Vec<BufferId>,
        output: BufferId,
        output_type: CompilerDataFormat,
        is_identity: bool,
    },
}

/// A DAG of `Op`s and `Buffer`s: one producer per buffer, producer/consumer
/// bookkeeping kept as two maps exactly as §4.G specifies (`Op -> Buffer`,
/// `Buffer -> [(Op, slot)]`), mirroring the IR `Graph`'s separate
/// `outgoing`/`incoming` maps rather than storing edges inline on the nodes.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OpGraph {
    ops: Vec<Option<Op>>,
    buffers: Vec<Option<Buffer>>,
    producer_of: HashMap<usize, usize>, // buffer idx -> op idx
    consumers_of: HashMap<usize, Vec<(usize, u32)>>, // buffer idx -> [(op idx, input slot)]
    op_inputs: HashMap<usize, Vec<BufferId>>, // op idx -> ordered input buffers
}

impl OpGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_buffer(&mut self, location: BufferLocationTag, shape: TensorShape, sram: Option<SramMetadata>) -> BufferId {
        let id = BufferId(self.buffers.len());
        self.buffers.push(Some(Buffer { id, location, shape, sram }));
        id
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.0).and_then(|b| b.as_ref())
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> Option<&mut Buffer> {
        self.buffers.get_mut(id.0).and_then(|b| b.as_mut())
    }

    /// Adds `op`, wiring `inputs[i]` as its input slot `i` and registering
    /// it as the sole producer of `output` (fails if `output` already has a
    /// producer — "exactly one producer per buffer").
    pub fn add_op(&mut self, op: Op, inputs: Vec<BufferId>, output: BufferId) -> CResult<OpId> {
        if self.producer_of.contains_key(&output.0) {
            return Err(CompilerError::internal(format!(
                "OpGraph: buffer {:?} already has a producer",
                output
            )));
        }
        let id = OpId(self.ops.len());
        self.ops.push(Some(op));
        self.op_inputs.insert(id.0, inputs.clone());
        self.producer_of.insert(output.0, id.0);
        for (slot, input) in inputs.iter().enumerate() {
            self.consumers_of.entry(input.0).or_default().push((id.0, slot as u32));
        }
        Ok(id)
    }

    pub fn op(&self, id: OpId) -> Option<&Op> {
        self.ops.get(id.0).and_then(|o| o.as_ref())
    }

    pub fn producer_of(&self, buffer: BufferId) -> Option<OpId> {
        self.producer_of.get(&buffer.0).map(|&i| OpId(i))
    }

    pub fn consumers_of(&self, buffer: BufferId) -> Vec<(OpId, u32)> {
        self.consumers_of
            .get(&buffer.0)
            .map(|v| v.iter().map(|&(op, slot)| (OpId(op), slot)).collect())
            .unwrap_or_default()
    }

    pub fn inputs_of(&self, op: OpId) -> &[BufferId] {
        self.op_inputs.get(&op.0).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Deterministic topological order over ops, by buffer dependency.
    pub fn topological_sort(&self) -> CResult<Vec<OpId>> {
        let op_ids: Vec<usize> = self.ops.iter().enumerate().filter_map(|(i, o)| o.as_ref().map(|_| i)).collect();
        let mut in_degree: HashMap<usize, usize> = HashMap::new();
        for &i in &op_ids {
            let deps = self
                .op_inputs
                .get(&i)
                .map(|inputs| inputs.iter().filter(|b| self.producer_of.contains_key(&b.0)).count())
                .unwrap_or(0);
            in_degree.insert(i, deps);
        }
        let mut ready: std::collections::VecDeque<usize> = op_ids.iter().copied().filter(|i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(op_ids.len());
        while let Some(i) = ready.pop_front() {
            order.push(OpId(i));
            // every buffer this op produces can unblock its consumers
            for (&buf, &producer) in &self.producer_of {
                if producer != i {
                    continue;
                }
                for &(consumer, _) in self.consumers_of.get(&buf).into_iter().flatten() {
                    let d = in_degree.get_mut(&consumer).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(consumer);
                    }
                }
            }
        }
        if order.len() != op_ids.len() {
            return Err(CompilerError::internal("OpGraph::topological_sort: cycle detected"));
        }
        Ok(order)
    }
}

/// Maps a `Part`'s externally-visible input slot to the `OpGraph` buffer
/// that fulfils it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartInputMapping {
    pub input_index: u32,
    pub buffer: BufferId,
}

/// Maps a `Part`'s externally-visible output slot to the `OpGraph` buffer
/// that produces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartOutputMapping {
    pub output_index: u32,
    pub buffer: BufferId,
}

/// Wraps one `OpGraph` with the input/output mappings the cascading
/// combiner needs to glue it to neighbouring plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub op_graph: OpGraph,
    pub inputs: Vec<PartInputMapping>,
    pub outputs: Vec<PartOutputMapping>,
}

impl Plan {
    pub fn new(op_graph: OpGraph, inputs: Vec<PartInputMapping>, outputs: Vec<PartOutputMapping>) -> Self {
        Self { op_graph, inputs, outputs }
    }

    /// Buffers tagged as DRAM external I/O at the plan's boundary, for
    /// feeding to the performance estimator's DRAM-traffic accounting.
    pub fn boundary_descriptor(&self, buffer: BufferId) -> Option<OperandDescriptor> {
        let b = self.op_graph.buffer(buffer)?;
        Some(OperandDescriptor {
            buffer_id: buffer.0 as u32,
            tensor_shape: b.shape,
            stripe_shape: b.sram.map(|s| s.stripe_shape).unwrap_or(b.shape),
            sram_offset: 0,
            dram_offset: 0,
            tile_size: b.sram.map(|s| s.tile_size).unwrap_or(0),
            zero_point: 0,
        })
    }
}

// Compatible with `#[derive(..., Copy, ...)]` deriving not available on
// `OpGraph` itself (it's impl Clone only where SramMetadata/Op allow);
// SramMetadata's derive(Copy) lets it flow by value into Buffer freely.
impl Clone for OpGraph {
    fn clone(&self) -> Self {
        Self {
            ops: self.ops.clone(),
            buffers: self.buffers.clone(),
            producer_of: self.producer_of.clone(),
            consumers_of: self.consumers_of.clone(),
            op_inputs: self.op_inputs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_op_rejects_a_second_producer_for_the_same_buffer() {
        let mut g = OpGraph::new();
        let buf = g.add_buffer(BufferLocationTag::Dram, [1, 8, 8, 16], None);
        g.add_op(Op::DmaOp { format: CompilerDataFormat::Nhwcb }, vec![], buf).unwrap();
        let err = g.add_op(Op::DmaOp { format: CompilerDataFormat::Nhwc }, vec![], buf).unwrap_err();
        assert!(matches!(err, CompilerError::InternalError(_)));
    }

    #[test]
    fn topological_sort_orders_producer_before_consumer() {
        let mut g = OpGraph::new();
        let a = g.add_buffer(BufferLocationTag::Dram, [1, 8, 8, 16], None);
        let b = g.add_buffer(BufferLocationTag::Dram, [1, 8, 8, 16], None);
        let op_a = g.add_op(Op::DmaOp { format: CompilerDataFormat::Nhwcb }, vec![], a).unwrap();
        let op_b = g.add_op(Op::DmaOp { format: CompilerDataFormat::Nhwc }, vec![a], b).unwrap();
        let order = g.topological_sort().unwrap();
        let pos_a = order.iter().position(|&o| o == op_a).unwrap();
        let pos_b = order.iter().position(|&o| o == op_b).unwrap();
        assert!(pos_a < pos_b);
    }
}
