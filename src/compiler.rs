//! Top-level `Compile`/`EstimatePerformance` entry points (§6/§7).
//!
//! Grounded on `original_source/.../Compiler.cpp`'s flow: build the IR from
//! the `Network`, run the node-type-aware repair loop to a fixed point,
//! sweep the optimiser, walk the prepared graph forming Passes and
//! encoding weights, then hand everything to the buffer manager for DRAM
//! offset assignment and serialise the §6 compiled blob. `tracing` spans
//! mark each stage, mirroring the teacher's `#[tracing::instrument]` idiom
//! in `backend/cpu.rs`.

use crate::buffer_manager::{BufferLocation, BufferManager, BufferType};
use crate::capabilities::HardwareCapabilities;
use crate::command_stream::{Command, CommandStream, MceCommandData, OperandDescriptor};
use crate::errors::{CResult, CompilerError};
use crate::ir::contract::{self, FixGraphSeverity};
use crate::ir::node::{Algorithm, NodeKind, PleKernel};
use crate::ir::{Graph, NodeId};
use crate::network::{Network, OperatorKind, OperatorRecord};
use crate::options::CompilationOptions;
use crate::perf_estimator::{PerformanceReport, StreamEntry};
use crate::planner::{self, PassRequest};
use crate::sram_allocator::SramAllocator;
use crate::tensor::TensorShape;
use crate::weight_encoder::{WeightEncodeRequest, WeightEncoderCache};
use std::collections::{HashMap, HashSet};

pub const COMPILED_BLOB_TAG: [u8; 4] = *b"ENCN";
pub const COMPILED_BLOB_VERSION: (u32, u32, u32) = (1, 0, 0);

/// Builds the IR graph from a `Network`'s operator records (§1 subsystem 1:
/// "construction"). One `NodeId` per `OperatorId`; operand references
/// become edges at the declared input slot.
///
/// Every node's `location` starts out `Dram`: a freshly lowered op's output
/// naturally lands in DRAM until a Pass claims it for SRAM, and the
/// fix-graph contract's location-sensitive rules (`Output`, `Concat`,
/// `StandalonePle`) need a producer's location decided before preparation
/// runs, not after — `generate` only runs once preparation has already
/// converged. `compile_mce_chain`/`compile_standalone_ple` keep this
/// invariant for the nodes they synthesize.
pub fn network_to_graph(network: &Network) -> CResult<(Graph, HashMap<u32, NodeId>)> {
    let mut graph = Graph::new();
    let mut map: HashMap<u32, NodeId> = HashMap::new();

    for op in network.operators() {
        let kind = node_kind_for(network, op)?;
        let id = graph.create_node(kind);
        {
            let node = graph.node_mut(id).unwrap();
            node.output_shape = op.output.dims;
            node.output_dtype = op.output.data_type;
            node.output_quant = op.output.quant.clone();
            node.format = op.output.format;
            node.corresponding_operation_ids = vec![op.id.0];
            node.location = BufferLocation::Dram;
        }
        map.insert(op.id.0, id);
    }

    for op in network.operators() {
        let dst = map[&op.id.0];
        for (slot, operand) in op.inputs.iter().enumerate() {
            let src = map[&operand.operator.0];
            graph.connect(src, dst, slot as u32)?;
        }
    }

    Ok((graph, map))
}

fn node_kind_for(network: &Network, op: &OperatorRecord) -> CResult<NodeKind> {
    let input_shape = |i: usize| -> TensorShape {
        op.inputs
            .get(i)
            .and_then(|operand| network.operator(operand.operator))
            .map(|src| src.output.dims)
            .unwrap_or([1, 0, 0, 0])
    };
    Ok(match &op.kind {
        OperatorKind::Input => NodeKind::Input,
        OperatorKind::Output => NodeKind::Output { source_operation_output_index: 0 },
        OperatorKind::Constant { data } => NodeKind::Constant { data: data.clone() },
        OperatorKind::Convolution { weights, bias, stride, pad_top, pad_left, upscale_factor, upsample_type } => {
            NodeKind::MceOperation {
                weights: weights.clone(),
                bias: bias.clone(),
                stride: *stride,
                pad_top: *pad_top,
                pad_left: *pad_left,
                upscale_factor: *upscale_factor,
                upsample_type: *upsample_type,
                op: crate::ir::node::MceOpKind::Conv,
                algorithm: None,
                uninterleaved_input_shape: input_shape(0),
            }
        }
        OperatorKind::DepthwiseConvolution { weights, bias, stride, pad_top, pad_left } => NodeKind::MceOperation {
            weights: weights.clone(),
            bias: bias.clone(),
            stride: *stride,
            pad_top: *pad_top,
            pad_left: *pad_left,
            upscale_factor: 1,
            upsample_type: crate::ir::node::UpsampleType::Off,
            op: crate::ir::node::MceOpKind::Depthwise,
            algorithm: None,
            uninterleaved_input_shape: input_shape(0),
        },
        OperatorKind::FullyConnected { weights, bias } => NodeKind::MceOperation {
            weights: weights.clone(),
            bias: bias.clone(),
            stride: crate::ir::node::Stride { x: 1, y: 1 },
            pad_top: 0,
            pad_left: 0,
            upscale_factor: 1,
            upsample_type: crate::ir::node::UpsampleType::Off,
            op: crate::ir::node::MceOpKind::FullyConnected,
            algorithm: None,
            uninterleaved_input_shape: input_shape(0),
        },
        OperatorKind::Relu { lower_bound, upper_bound } => {
            NodeKind::McePostProcess { lower_bound: *lower_bound, upper_bound: *upper_bound }
        }
        OperatorKind::PleElementwise { kernel, leaky_alpha } => {
            if op.inputs.len() > 1 {
                NodeKind::StandalonePle { kernel: *kernel }
            } else {
                NodeKind::FuseOnlyPle {
                    kernel: *kernel,
                    shape_multiplier: (1, 1, 1),
                    leaky_alpha: *leaky_alpha,
                    insert_identity_hint: true,
                }
            }
        }
        OperatorKind::Pooling { kernel, shape_multiplier } => NodeKind::FuseOnlyPle {
            kernel: *kernel,
            shape_multiplier: *shape_multiplier,
            leaky_alpha: None,
            insert_identity_hint: true,
        },
        OperatorKind::Reshape => NodeKind::Reinterpret,
        OperatorKind::FormatConversion { from, to } => NodeKind::FormatConversion { from: *from, to: *to },
        OperatorKind::Concatenation { axis } => NodeKind::Concat { axis: *axis },
        OperatorKind::ExtractSubtensor { supertensor_offset } => NodeKind::ExtractSubtensor { supertensor_offset: *supertensor_offset },
        OperatorKind::Requantize => NodeKind::Requantize,
        OperatorKind::SpaceToDepth { block_size } => NodeKind::SpaceToDepth { block_size: *block_size },
        OperatorKind::Unsupported { reason } => NodeKind::EstimateOnly { reason: reason.clone() },
    })
}

/// Node-type-aware repair loop (§4.C contract, §9 "could loop forever"
/// design note): tries every severity low-to-high per node each sweep,
/// restarting the sweep as soon as anything changes, capped at
/// `10 * initial_node_count` sweeps.
#[tracing::instrument(skip(graph), name = "fix_graph_loop")]
pub fn run_fix_graph_loop(graph: &mut Graph) -> CResult<()> {
    let initial_node_count = graph.node_ids().count().max(1);
    let max_iterations = 10 * initial_node_count;

    for _ in 0..max_iterations {
        let mut changed = false;
        for id in graph.topological_sort()? {
            if matches!(graph.node(id).map(|n| &n.kind), Some(NodeKind::EstimateOnly { .. })) {
                continue; // never prepared by construction; not this loop's job
            }
            for severity in FixGraphSeverity::ALL {
                if contract::fix_graph(graph, id, severity)? {
                    changed = true;
                    break;
                }
            }
        }
        if !changed {
            return Ok(());
        }
    }

    let failing_op_ids: Vec<u32> = graph
        .node_ids()
        .filter(|&id| !contract::is_prepared(graph, id) && !matches!(graph.node(id).map(|n| &n.kind), Some(NodeKind::EstimateOnly { .. })))
        .filter_map(|id| graph.node(id).and_then(|n| n.corresponding_operation_ids.first().copied()))
        .collect();
    Err(CompilerError::not_supported_ops(
        format!("Unable to prepare graph after {max_iterations} iterations"),
        failing_op_ids,
    ))
}

struct CompileCtx<'a> {
    caps: &'a HardwareCapabilities,
    options: &'a CompilationOptions,
    buffers: BufferManager,
    cmd_stream: CommandStream,
    sram: SramAllocator,
    encoder: WeightEncoderCache,
    handled: HashSet<NodeId>,
    pass_counter: u32,
    report: PerformanceReport,
}

impl<'a> CompileCtx<'a> {
    fn new(caps: &'a HardwareCapabilities, options: &'a CompilationOptions) -> CResult<Self> {
        Ok(Self {
            caps,
            options,
            buffers: BufferManager::new(),
            cmd_stream: CommandStream::new(),
            sram: SramAllocator::new(caps.sram_bytes_per_lane()),
            encoder: WeightEncoderCache::new(options.thread_count)?,
            handled: HashSet::new(),
            pass_counter: 0,
            report: PerformanceReport::default(),
        })
    }
}

/// Walks every node once in topological order, either compiling it for real
/// or (when `tolerate_estimate_only` is set) recording an `EstimateOnly`
/// reason as an issue and skipping it rather than failing the whole walk.
fn walk_graph(graph: &mut Graph, ctx: &mut CompileCtx, tolerate_estimate_only: bool) -> CResult<()> {
    for id in graph.topological_sort()? {
        if ctx.handled.contains(&id) {
            continue;
        }
        let kind = graph.node(id).map(|n| n.kind.clone());
        match kind {
            Some(NodeKind::EstimateOnly { reason }) => {
                let op_id = graph.node(id).and_then(|n| n.corresponding_operation_ids.first().copied()).unwrap_or(id.0 as u32);
                if tolerate_estimate_only {
                    ctx.report.issues.insert(op_id, reason);
                    ctx.handled.insert(id);
                } else {
                    return Err(CompilerError::not_supported_ops("EstimateOnly node cannot be compiled", vec![op_id]));
                }
            }
            Some(NodeKind::MceOperation { .. }) => compile_mce_chain(graph, ctx, id)?,
            Some(NodeKind::StandalonePle { kernel }) => compile_standalone_ple(graph, ctx, id, kernel)?,
            Some(_) => {
                contract::generate(graph, id, &mut ctx.buffers, &mut ctx.cmd_stream)?;
                ctx.handled.insert(id);
            }
            None => {}
        }
    }
    Ok(())
}

/// Absorbs a trailing `McePostProcess` and/or `FuseOnlyPle` into the MCE
/// node they fuse with (§4.C), forms one `Pass` for the whole chain, and
/// emits its weights + command.
fn compile_mce_chain(graph: &mut Graph, ctx: &mut CompileCtx, mce_id: NodeId) -> CResult<()> {
    let mut chain = vec![mce_id];
    let mut clamp: (i16, i16) = (i16::MIN, i16::MAX);
    let mut ple_kernel: Option<PleKernel> = None;
    let mut ple_mult = (1u32, 1u32, 1u32);
    let mut tail = mce_id;

    if graph.fan_out(tail) == 1 {
        let next = graph.consumers_of(tail)[0].0;
        if let Some(NodeKind::McePostProcess { lower_bound, upper_bound }) = graph.node(next).map(|n| n.kind.clone()) {
            clamp = (lower_bound, upper_bound);
            chain.push(next);
            tail = next;
        }
    }
    if graph.fan_out(tail) == 1 {
        let next = graph.consumers_of(tail)[0].0;
        if let Some(NodeKind::FuseOnlyPle { kernel, shape_multiplier, .. }) = graph.node(next).map(|n| n.kind.clone()) {
            ple_kernel = Some(kernel);
            ple_mult = shape_multiplier;
            chain.push(next);
            tail = next;
        }
    }

    let (weights, bias, stride, op, mce_output_shape) = match graph.node(mce_id).map(|n| n.kind.clone()) {
        Some(NodeKind::MceOperation { weights, bias, stride, op, .. }) => {
            (weights, bias, stride, op, graph.node(mce_id).unwrap().output_shape)
        }
        _ => return Err(CompilerError::internal("compile_mce_chain: not an MceOperation")),
    };
    let tail_node = graph.node(tail).unwrap().clone();
    let input_shape = graph
        .producers_of(mce_id)
        .first()
        .and_then(|&p| graph.node(p))
        .map(|n| n.output_shape)
        .unwrap_or(mce_output_shape);
    let ifm_channels = input_shape[3];
    let kernel_h = weights.shape[0];
    let kernel_w = weights.shape[1];

    let req = PassRequest {
        output_shape: tail_node.output_shape,
        ifm_channels,
        kernel_h,
        kernel_w,
        stride,
        op,
        ple_kernel,
        ple_shape_multiplier: ple_mult,
        input_location: BufferLocation::Sram,
        input_locations: vec![BufferLocation::Sram],
        input_shapes: vec![input_shape],
        format: tail_node.format,
        weight_bytes_per_element: 1,
    };

    let op_ids: Vec<u32> = chain
        .iter()
        .flat_map(|&n| graph.node(n).map(|n| n.corresponding_operation_ids.clone()).unwrap_or_default())
        .collect();

    let pass = planner::plan_pass(ctx.pass_counter, &req, ctx.caps, &mut ctx.sram, ctx.options)?
        .ok_or_else(|| CompilerError::not_supported_ops("no feasible stripe plan found for this MCE unit", op_ids.clone()))?;

    let encoded = encode_weights(ctx, &weights, &bias, &pass, &op)?;
    let weights_buf = ctx.buffers.add_dram_constant(BufferType::ConstantDma, encoded.bytes);
    let output_buf = ctx.buffers.add_dram(BufferType::Intermediate, crate::tensor::byte_size_nhwcb(tail_node.output_shape)?);

    let weight_descriptor = OperandDescriptor {
        buffer_id: weights_buf,
        tensor_shape: weights.shape,
        stripe_shape: weights.shape,
        sram_offset: 0,
        dram_offset: 0,
        tile_size: pass.weight_tile.total_bytes(),
        zero_point: weights.quant.zero_point,
    };
    let input_descriptor = OperandDescriptor {
        buffer_id: graph.producers_of(mce_id).first().and_then(|&p| graph.node(p).and_then(|n| n.buffer_id)).unwrap_or(0),
        tensor_shape: input_shape,
        stripe_shape: input_shape,
        sram_offset: 0,
        dram_offset: 0,
        tile_size: pass.input_tile.total_bytes(),
        zero_point: 0,
    };
    let output_descriptor = OperandDescriptor {
        buffer_id: output_buf,
        tensor_shape: tail_node.output_shape,
        stripe_shape: pass.output_stripe_shape,
        sram_offset: 0,
        dram_offset: 0,
        tile_size: pass.output_tile.total_bytes(),
        zero_point: tail_node.output_quant.zero_point,
    };
    ctx.cmd_stream.push(Command::McePle {
        input: input_descriptor,
        output: output_descriptor,
        mce: MceCommandData {
            op,
            algorithm_is_winograd: matches!(pass.algorithm, Algorithm::Winograd),
            block_config: pass.block_config,
            stride: (stride.x, stride.y),
            pad_top: 0,
            pad_left: 0,
            clamp_lo: clamp.0,
            clamp_hi: clamp.1,
            weights: weight_descriptor,
        },
        ple_kernel: ple_kernel.unwrap_or(PleKernel::Passthrough),
    });

    graph.node_mut(tail).unwrap().buffer_id = Some(output_buf);
    graph.node_mut(tail).unwrap().location = BufferLocation::Dram;
    ctx.report.stream.push(StreamEntry {
        operation_ids: op_ids,
        parent_ids: Vec::new(),
        input: pass.performance.input,
        output: pass.performance.output,
        weights: pass.performance.weights,
        mce: pass.performance.mce,
        ple: pass.performance.ple,
    });
    for &n in &chain {
        ctx.handled.insert(n);
    }
    ctx.pass_counter += 1;
    Ok(())
}

/// Simplified PLE-only Pass: gathers every input's buffer, emits one
/// `PleOnly` command into a fresh DRAM output buffer.
fn compile_standalone_ple(graph: &mut Graph, ctx: &mut CompileCtx, id: NodeId, kernel: PleKernel) -> CResult<()> {
    let node = graph.node(id).unwrap().clone();
    let producers = graph.producers_of(id);
    let inputs: Vec<OperandDescriptor> = producers
        .iter()
        .filter_map(|&p| graph.node(p))
        .map(|n| OperandDescriptor {
            buffer_id: n.buffer_id.unwrap_or(0),
            tensor_shape: n.output_shape,
            stripe_shape: n.output_shape,
            sram_offset: 0,
            dram_offset: 0,
            tile_size: 0,
            zero_point: n.output_quant.zero_point,
        })
        .collect();
    let output_buf = ctx.buffers.add_dram(BufferType::Intermediate, crate::tensor::byte_size_nhwcb(node.output_shape)?);
    let output = OperandDescriptor {
        buffer_id: output_buf,
        tensor_shape: node.output_shape,
        stripe_shape: node.output_shape,
        sram_offset: 0,
        dram_offset: 0,
        tile_size: 0,
        zero_point: node.output_quant.zero_point,
    };
    ctx.cmd_stream.push(Command::PleOnly { inputs, output, kernel });
    graph.node_mut(id).unwrap().buffer_id = Some(output_buf);
    graph.node_mut(id).unwrap().location = BufferLocation::Dram;
    ctx.handled.insert(id);
    Ok(())
}

/// Slices the weight tensor into per-OFM chunks, converts to the signed
/// symbol domain the encoder expects, and runs the blocking `encode` call.
/// A `WeightsTooLarge` here surfaces directly as `NotSupported`: the
/// planner already picked its smallest feasible stripe, so there is no
/// further fallback to retry (documented in DESIGN.md as a deliberate
/// simplification of §7's retry contract).
fn encode_weights(
    ctx: &mut CompileCtx,
    weights: &crate::ir::node::WeightsAttr,
    bias: &crate::ir::node::BiasAttr,
    pass: &planner::Pass,
    op: &crate::ir::node::MceOpKind,
) -> CResult<crate::weight_encoder::EncodedStream> {
    let num_ofm = match op {
        crate::ir::node::MceOpKind::Depthwise => (weights.shape[2] * weights.shape[3]).max(1) as usize,
        _ => weights.shape[3].max(1) as usize,
    };
    let per_ofm_len = (weights.data.len() / num_ofm.max(1)).max(1);
    let zero_point = weights.quant.zero_point;
    let per_ofm_weights: Vec<Vec<i16>> = weights
        .data
        .chunks(per_ofm_len)
        .map(|chunk| chunk.iter().map(|&b| b as i16 - zero_point as i16).collect())
        .collect();
    let biases: Vec<i32> = if bias.data.len() >= per_ofm_weights.len() {
        bias.data[..per_ofm_weights.len()].to_vec()
    } else {
        vec![0; per_ofm_weights.len()]
    };

    let req = WeightEncodeRequest::from_weights(
        &per_ofm_weights.concat(),
        &biases,
        pass.output_tile.stripe_bytes,
        pass.input_tile.stripe_bytes,
        (1, 1),
        (0, 0),
        *op,
        pass.algorithm,
        zero_point,
    );
    let budget = pass.weight_tile.total_bytes().max(1) as usize;
    ctx.encoder.encode(req, per_ofm_weights, biases, budget)
}

/// §6 compiled blob: `ENCN`, `{major, minor, patch}`, then the
/// length-prefixed buffer-info arrays in the declared order.
fn serialize_compiled_blob(buffers: &BufferManager) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&COMPILED_BLOB_TAG);
    out.extend_from_slice(&COMPILED_BLOB_VERSION.0.to_le_bytes());
    out.extend_from_slice(&COMPILED_BLOB_VERSION.1.to_le_bytes());
    out.extend_from_slice(&COMPILED_BLOB_VERSION.2.to_le_bytes());

    write_byte_array(&mut out, buffers.constant_dma_data());
    write_byte_array(&mut out, buffers.constant_control_unit_data());

    write_buffer_infos(&mut out, buffers, BufferType::Input);
    write_buffer_infos(&mut out, buffers, BufferType::Output);
    write_buffer_infos(&mut out, buffers, BufferType::ConstantControlUnit);
    write_buffer_infos(&mut out, buffers, BufferType::ConstantDma);
    write_buffer_infos(&mut out, buffers, BufferType::Intermediate);
    out
}

fn write_byte_array(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_buffer_infos(out: &mut Vec<u8>, buffers: &BufferManager, ty: BufferType) {
    let matching: Vec<_> = buffers.buffers().values().filter(|b| b.buffer_type == ty).collect();
    out.extend_from_slice(&(matching.len() as u32).to_le_bytes());
    for b in matching {
        out.extend_from_slice(&b.id.to_le_bytes());
        out.extend_from_slice(&b.offset.to_le_bytes());
        out.extend_from_slice(&b.size.to_le_bytes());
    }
}

/// Everything `compile` produces before it gets flattened into the §6 blob:
/// the buffer registry (offsets, sizes, per-type listings) and the emitted
/// command stream. `compile` itself only needs the serialized bytes, but
/// tests and tooling that want to assert on individual commands (command
/// kind, clamp bounds, chosen algorithm, intermediate buffer count) need
/// this richer, pre-serialization view.
pub struct CompiledNetwork {
    pub buffers: BufferManager,
    pub commands: CommandStream,
}

fn compile_to_artifacts(network: &Network, caps: &HardwareCapabilities, options: &CompilationOptions) -> CResult<CompiledNetwork> {
    network.fail_early_checks()?;
    let (mut graph, _) = network_to_graph(network)?;
    run_fix_graph_loop(&mut graph)?;
    crate::optimizer::optimize(&mut graph)?;
    run_fix_graph_loop(&mut graph)?;

    let mut ctx = CompileCtx::new(caps, options)?;
    walk_graph(&mut graph, &mut ctx, false)?;

    let commands = ctx.cmd_stream.clone();
    let cmd_bytes = std::mem::take(&mut ctx.cmd_stream).into_bytes();
    ctx.buffers.add_command_stream(cmd_bytes);
    ctx.buffers.allocate()?;

    Ok(CompiledNetwork { buffers: ctx.buffers, commands })
}

/// §6/§7 top-level entry point: compiles `network` into the bit-exact
/// command blob, or raises `NotSupported` (including when preparation
/// hits the fix-graph iteration cap, or the graph contains an
/// `EstimateOnly` node).
#[tracing::instrument(skip(network, caps, options), name = "compile")]
pub fn compile(network: &Network, caps: &HardwareCapabilities, options: &CompilationOptions) -> CResult<Vec<u8>> {
    let artifacts = compile_to_artifacts(network, caps, options)?;
    Ok(serialize_compiled_blob(&artifacts.buffers))
}

/// Like `compile`, but returns the pre-serialization [`CompiledNetwork`]
/// instead of the flattened blob.
pub fn compile_for_inspection(network: &Network, caps: &HardwareCapabilities, options: &CompilationOptions) -> CResult<CompiledNetwork> {
    compile_to_artifacts(network, caps, options)
}

/// §6/§7: like `compile`, but tolerant of `EstimateOnly` nodes (annotated
/// into `PerformanceReport::issues` instead of aborting) and non-fatal over
/// preparation shortfalls — logged as a warning rather than raised, so a
/// network with one unsupported branch can still report performance for
/// the rest.
#[tracing::instrument(skip(network, caps, options), name = "estimate_performance")]
pub fn estimate_performance(network: &Network, caps: &HardwareCapabilities, options: &CompilationOptions) -> CResult<PerformanceReport> {
    network.fail_early_checks()?;
    let (mut graph, _) = network_to_graph(network)?;
    if let Err(e) = run_fix_graph_loop(&mut graph) {
        tracing::warn!(error = %e, "estimate_performance: repair loop did not reach a fixed point");
    }
    crate::optimizer::optimize(&mut graph)?;

    let mut ctx = CompileCtx::new(caps, options)?;
    walk_graph(&mut graph, &mut ctx, true)?;
    Ok(ctx.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::tensor_info;
    use crate::tensor::{CompilerDataFormat, DataType};

    fn reshape_network() -> Network {
        let mut net = Network::new();
        let input = net
            .add_operator(vec![], OperatorKind::Input, tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0))
            .unwrap();
        let reshaped = net
            .add_operator(
                vec![crate::network::Operand { operator: input, output_index: 0 }],
                OperatorKind::Reshape,
                tensor_info([1, 8, 32, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
            )
            .unwrap();
        net.add_operator(
            vec![crate::network::Operand { operator: reshaped, output_index: 0 }],
            OperatorKind::Output,
            tensor_info([1, 8, 32, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
        net
    }

    #[test]
    fn identity_reshape_compiles_to_a_blob_tagged_encn() {
        let net = reshape_network();
        let caps = HardwareCapabilities::reference();
        let options = CompilationOptions::default();
        let blob = compile(&net, &caps, &options).unwrap();
        assert_eq!(&blob[0..4], &COMPILED_BLOB_TAG);
    }

    #[test]
    fn estimate_only_branch_fails_compile_but_succeeds_estimate() {
        let mut net = Network::new();
        net.add_operator(
            vec![],
            OperatorKind::Unsupported { reason: "dynamic shape".into() },
            tensor_info([1, 4, 4, 4], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0),
        )
        .unwrap();
        let caps = HardwareCapabilities::reference();
        let options = CompilationOptions::default();
        assert!(compile(&net, &caps, &options).is_err());
        let report = estimate_performance(&net, &caps, &options).unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues.get(&0).map(String::as_str), Some("dynamic shape"));
    }
}
