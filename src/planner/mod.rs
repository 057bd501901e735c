//! Module F: the stripe/tile planner. Turns one fusable MCE(+PLE) unit
//! (already identified by the caller walking the prepared IR graph) into a
//! feasible, performance-ranked [`Pass`], then cascades adjacent Passes that
//! never touch DRAM between them into [`Section`]s.
//!
//! Grounded on `original_source/.../cascading/McePart.cpp` and
//! `nonCascading/PlePass.cpp`/`ConversionPass.cpp` for candidate-shape and
//! block-config selection; the tile-lifetime-as-liveness framing follows the
//! teacher's `src/graph/memory_planner.rs` greedy allocation idiom.

pub mod stripe;

use crate::buffer_manager::BufferLocation;
use crate::capabilities::HardwareCapabilities;
use crate::errors::{CResult, CompilerError};
use crate::ir::node::{Algorithm, MceOpKind, PleKernel, Stride};
use crate::ir::NodeId;
use crate::opgraph::{BufferLocationTag, Op, OpGraph, PartInputMapping, PartOutputMapping, Plan, SramMetadata};
use crate::options::CompilationOptions;
use crate::perf_estimator::{dram_stats, mce_cycles, ple_num_patches, weight_reload_count, DramStats, PassPerformance, PleStats, WeightsStats};
use crate::sram_allocator::{Preference, SramAllocator};
use crate::tensor::{byte_size_nhwcb, num_stripes, CompilerDataFormat, TensorShape};
use serde::{Deserialize, Serialize};

/// One memory's in-flight tile sizing: `num_stripes_in_tile * stripe_bytes`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TileSize {
    pub num_stripes_in_tile: u32,
    pub stripe_bytes: u32,
}

impl TileSize {
    pub fn total_bytes(&self) -> u32 {
        self.num_stripes_in_tile * self.stripe_bytes
    }
}

/// Everything the planner needs to evaluate candidates for one fusable
/// MCE(+PLE) unit. Built by the caller from the taxonomy nodes being fused
/// together (§4.C: an `MceOperation` plus an optional `McePostProcess` /
/// `FuseOnlyPle`).
#[derive(Debug, Clone)]
pub struct PassRequest {
    pub output_shape: TensorShape,
    pub ifm_channels: u32,
    pub kernel_h: u32,
    pub kernel_w: u32,
    pub stride: Stride,
    pub op: MceOpKind,
    pub ple_kernel: Option<PleKernel>,
    pub ple_shape_multiplier: (u32, u32, u32),
    pub input_location: BufferLocation,
    pub input_locations: Vec<BufferLocation>,
    pub input_shapes: Vec<TensorShape>,
    pub format: CompilerDataFormat,
    pub weight_bytes_per_element: u32,
}

#[derive(Debug, Clone)]
pub struct Pass {
    pub id: u32,
    pub input_nodes: Vec<NodeId>,
    pub output_node: NodeId,
    pub output_stripe_shape: TensorShape,
    pub input_tile: TileSize,
    pub weight_tile: TileSize,
    pub output_tile: TileSize,
    pub ple_input_tile: Option<TileSize>,
    pub algorithm: Algorithm,
    pub block_config: (u32, u32),
    pub performance: PassPerformance,
}

/// `SectionType` for a cascade of Passes whose outputs feed the next Pass's
/// inputs without ever landing in DRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionType {
    Siso,
    Miso,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub section_type: SectionType,
    pub pass_ids: Vec<u32>,
}

const FC_BLOCK_CONFIG: (u32, u32) = (8, 8);
const FC_INPUT_TILE_ALIGNMENT: u32 = 1024;

fn round_up_u32(value: u32, multiple: u32) -> u32 {
    if multiple == 0 {
        return value;
    }
    let rem = value % multiple;
    if rem == 0 {
        value
    } else {
        value + (multiple - rem)
    }
}

/// Candidate block configs to try, narrowed to the fixed `8x8` for
/// fully-connected (§4.F special rule) and otherwise filtered by the
/// capability record's supported list and the options' enable mask.
fn candidate_block_configs(req: &PassRequest, caps: &HardwareCapabilities, options: &CompilationOptions) -> Vec<(u32, u32)> {
    if req.op == MceOpKind::FullyConnected {
        return vec![FC_BLOCK_CONFIG];
    }
    caps.supported_block_configs
        .iter()
        .enumerate()
        .filter(|&(i, _)| options.block_config_mask & (1 << i) != 0)
        .map(|(_, &cfg)| cfg)
        .collect()
}

/// Tries to place `regions` (size, debug tag) into `allocator` in order,
/// rolling back every region already placed as soon as one fails. `user_base
/// + i` is used as the owning id for region `i` — callers pick a `user_base`
/// unique to this trial so concurrent probes (if ever run) can't collide.
fn try_fit(allocator: &mut SramAllocator, user_base: u32, regions: &[(u32, &str)]) -> Option<Vec<u32>> {
    let mut offsets = Vec::with_capacity(regions.len());
    for (i, &(size, tag)) in regions.iter().enumerate() {
        match allocator.allocate(user_base + i as u32, size, Preference::Start, tag) {
            Some(off) => offsets.push(off),
            None => {
                for (j, &off) in offsets.iter().enumerate() {
                    allocator.free(user_base + j as u32, off);
                }
                return None;
            }
        }
    }
    Some(offsets)
}

fn free_fit(allocator: &mut SramAllocator, user_base: u32, offsets: &[u32]) {
    for (i, &off) in offsets.iter().enumerate() {
        allocator.free(user_base + i as u32, off);
    }
}

struct Candidate {
    output_stripe: TensorShape,
    block_config: (u32, u32),
    algorithm: Algorithm,
    input_tile: TileSize,
    weight_tile: TileSize,
    output_tile: TileSize,
    ple_input_tile: Option<TileSize>,
    performance: PassPerformance,
}

/// §4.F: enumerates stripe/block-config candidates largest-stripe-first,
/// keeps every one that fits the SRAM allocator simultaneously, and returns
/// the best by the tie-break order (larger stripes, fewer weight reloads,
/// lower estimated metric — `candidate_output_stripes` and the stable sort
/// below already guarantee the first two, so only the metric needs an
/// explicit comparison among same-shape candidates).
#[tracing::instrument(skip(caps, allocator, options), name = "plan_pass")]
pub fn plan_pass(
    id: u32,
    req: &PassRequest,
    caps: &HardwareCapabilities,
    allocator: &mut SramAllocator,
    options: &CompilationOptions,
) -> CResult<Option<Pass>> {
    if req.format == CompilerDataFormat::Nchw && !caps.supports_nchw {
        return Err(CompilerError::not_supported(
            "NCHW format conversion requested on hardware capabilities without NCHW support",
        ));
    }
    if req.ple_kernel.is_some() && req.input_locations.len() > 1 {
        // §4.F: "PLE-only operations require all inputs to share a location
        // and identical shapes".
        let first_loc = req.input_locations[0];
        let first_shape = req.input_shapes.first().copied();
        if !req.input_locations.iter().all(|&l| l == first_loc) || !req.input_shapes.iter().all(|&s| Some(s) == first_shape) {
            return Err(CompilerError::not_supported(
                "PLE-only pass requires all inputs to share location and shape",
            ));
        }
    }

    let block_configs = candidate_block_configs(req, caps, options);
    if block_configs.is_empty() {
        return Ok(None);
    }

    let mut best: Option<(Candidate, u64)> = None;
    let mut trial_user = 0xF000_0000u32.wrapping_add(id.wrapping_mul(64));

    for output_stripe in stripe::candidate_output_stripes(req.output_shape) {
        for &block_config in &block_configs {
            let algorithm = if options.enable_winograd
                && req.op == MceOpKind::Conv
                && req.stride == (Stride { x: 1, y: 1 })
                && matches!((req.kernel_h, req.kernel_w), (1, 1) | (1, 3) | (3, 1) | (3, 3))
            {
                Algorithm::Winograd
            } else {
                Algorithm::Direct
            };

            let input_stripe = stripe::mce_input_stripe(req.output_shape, output_stripe, req.ifm_channels, req.kernel_h, req.kernel_w, req.stride);
            let weight_shape = stripe::weight_stripe(output_stripe[3], req.ifm_channels, req.kernel_h, req.kernel_w);
            let ple_shape = req.ple_kernel.map(|_| stripe::ple_stripe(output_stripe, req.ple_shape_multiplier));

            let Ok((stripes_h, stripes_w, stripes_c, _)) = num_stripes(req.output_shape, output_stripe) else { continue };
            let needs_halo = req.kernel_h > 1 || req.kernel_w > 1;
            let in_flight = stripe::num_stripes_in_tile(stripes_h.max(stripes_w), needs_halo);

            let Ok(mut input_bytes) = byte_size_nhwcb(input_stripe) else { continue };
            let Ok(output_bytes) = byte_size_nhwcb(output_stripe) else { continue };
            let mut weight_bytes = weight_shape.iter().product::<u32>() * req.weight_bytes_per_element.max(1);
            if req.op == MceOpKind::FullyConnected {
                input_bytes = round_up_u32(input_bytes, FC_INPUT_TILE_ALIGNMENT);
                weight_bytes = round_up_u32(weight_bytes, FC_INPUT_TILE_ALIGNMENT);
            }

            let input_tile = TileSize { num_stripes_in_tile: in_flight, stripe_bytes: input_bytes };
            let weight_tile = TileSize { num_stripes_in_tile: 1, stripe_bytes: weight_bytes };
            let output_tile = TileSize { num_stripes_in_tile: in_flight, stripe_bytes: output_bytes };
            let ple_input_tile = ple_shape
                .map(|s| byte_size_nhwcb(s))
                .transpose()
                .ok()
                .flatten()
                .map(|bytes| TileSize { num_stripes_in_tile: in_flight, stripe_bytes: bytes });

            let mut regions = vec![
                (input_tile.total_bytes(), "input"),
                (weight_tile.total_bytes(), "weights"),
                (output_tile.total_bytes(), "output"),
            ];
            if let Some(t) = ple_input_tile {
                regions.push((t.total_bytes(), "ple_input"));
            }

            trial_user = trial_user.wrapping_add(1);
            let Some(offsets) = try_fit(allocator, trial_user, &regions) else { continue };
            free_fit(allocator, trial_user, &offsets);

            let num_active_ogs = caps.num_engines.max(1);
            let cycles = mce_cycles(
                caps,
                req.op,
                matches!(algorithm, Algorithm::Winograd),
                output_stripe,
                req.ifm_channels,
                req.kernel_h,
                req.kernel_w,
                num_active_ogs,
            );
            let total_stripes = (stripes_h * stripes_w * stripes_c).max(1);
            let input_dram = if req.input_location == BufferLocation::Dram {
                dram_stats(input_bytes as u64, total_stripes, in_flight, options.activation_compression_savings)
            } else {
                DramStats { parallel_bytes: 0, non_parallel_bytes: 0 }
            };
            let output_dram = dram_stats(output_bytes as u64, total_stripes, in_flight, options.activation_compression_savings);
            let reloads = weight_reload_count(stripes_h, stripes_w, stripes_c);
            let weights = WeightsStats {
                parallel_bytes: weight_bytes as u64,
                non_parallel_bytes: (weight_bytes as u64) * reloads as u64,
                num_reloads: reloads,
                compression_savings: 0.0,
            };
            let ple = PleStats { num_patches: ple_num_patches(output_stripe) };
            let performance = PassPerformance::compute(cycles, input_dram, output_dram, weights, ple);

            let candidate = Candidate {
                output_stripe,
                block_config,
                algorithm,
                input_tile,
                weight_tile,
                output_tile,
                ple_input_tile,
                performance,
            };

            // The outer loop already stops moving to a smaller stripe shape
            // once any candidate fits (see below), so every candidate
            // compared here shares `output_stripe`; only reload count then
            // metric need breaking ties (§4.F tie-break order).
            let is_better = match &best {
                None => true,
                Some((prev, _)) => {
                    (candidate.performance.weights.num_reloads, candidate.performance.metric)
                        < (prev.performance.weights.num_reloads, prev.performance.metric)
                }
            };
            if is_better {
                let metric = candidate.performance.metric;
                best = Some((candidate, metric));
            }
        }
        if best.is_some() {
            // A fast (large-stripe) plan was found for this stripe shape;
            // §4.F only falls back to smaller stripes when none fit.
            break;
        }
    }

    let Some((winner, _)) = best else { return Ok(None) };

    // Commit the winning candidate's SRAM footprint for real.
    let mut regions = vec![
        (winner.input_tile.total_bytes(), "input"),
        (winner.weight_tile.total_bytes(), "weights"),
        (winner.output_tile.total_bytes(), "output"),
    ];
    if let Some(t) = winner.ple_input_tile {
        regions.push((t.total_bytes(), "ple_input"));
    }
    let committed_user = 0xE000_0000u32.wrapping_add(id.wrapping_mul(8));
    if try_fit(allocator, committed_user, &regions).is_none() {
        return Ok(None);
    }

    Ok(Some(Pass {
        id,
        input_nodes: Vec::new(),
        output_node: NodeId(0),
        output_stripe_shape: winner.output_stripe,
        input_tile: winner.input_tile,
        weight_tile: winner.weight_tile,
        output_tile: winner.output_tile,
        ple_input_tile: winner.ple_input_tile,
        algorithm: winner.algorithm,
        block_config: winner.block_config,
        performance: winner.performance,
    }))
}

/// Groups `passes` into cascading [`Section`]s: consecutive runs where
/// `feeds_next_without_dram[i]` is true are one Section; `input_counts[i]`
/// decides `Miso` (>1) vs `Siso` for the section's head.
pub fn cascade_into_sections(pass_ids: &[u32], feeds_next_without_dram: &[bool], head_input_counts: &[usize]) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Vec<u32> = Vec::new();
    for (i, &id) in pass_ids.iter().enumerate() {
        current.push(id);
        let continues = feeds_next_without_dram.get(i).copied().unwrap_or(false) && i + 1 < pass_ids.len();
        if !continues {
            let head_inputs = head_input_counts.first().copied().unwrap_or(1);
            let section_type = if head_inputs > 1 { SectionType::Miso } else { SectionType::Siso };
            sections.push(Section {
                section_type,
                pass_ids: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        sections.push(Section { section_type: SectionType::Siso, pass_ids: current });
    }
    sections
}

/// Adapter resolving the "legacy Pass planner vs. Part/Plan/OpGraph
/// combiner" Open Question: wraps one `Pass` as a single-part `Plan` so
/// `perf_estimator`/the cascading combiner can cost either representation
/// uniformly.
pub fn pass_to_plan(pass: &Pass, input_shape: TensorShape, output_shape: TensorShape) -> Plan {
    let mut graph = OpGraph::new();
    let input_buf = graph.add_buffer(
        BufferLocationTag::Sram,
        input_shape,
        Some(SramMetadata {
            stripe_shape: input_shape,
            num_stripes: 1,
            num_loads: 1,
            packed_boundary: false,
            tile_size: pass.input_tile.total_bytes(),
            format: CompilerDataFormat::Nhwcb,
        }),
    );
    let output_buf = graph.add_buffer(
        BufferLocationTag::Sram,
        output_shape,
        Some(SramMetadata {
            stripe_shape: pass.output_stripe_shape,
            num_stripes: 1,
            num_loads: 1,
            packed_boundary: false,
            tile_size: pass.output_tile.total_bytes(),
            format: CompilerDataFormat::Nhwcb,
        }),
    );
    let _ = graph.add_op(
        Op::MceOp {
            op: MceOpKind::Conv,
            algo: pass.algorithm,
            block_config: pass.block_config,
            stride: Stride { x: 1, y: 1 },
            pad: (0, 0),
            clamp: (i16::MIN, i16::MAX),
            upsample: crate::ir::node::UpsampleType::Off,
            uninterleaved_shape: input_shape,
        },
        vec![input_buf],
        output_buf,
    );
    Plan::new(
        graph,
        vec![PartInputMapping { input_index: 0, buffer: input_buf }],
        vec![PartOutputMapping { output_index: 0, buffer: output_buf }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> PassRequest {
        PassRequest {
            output_shape: [1, 16, 16, 16],
            ifm_channels: 16,
            kernel_h: 3,
            kernel_w: 3,
            stride: Stride { x: 1, y: 1 },
            op: MceOpKind::Conv,
            ple_kernel: None,
            ple_shape_multiplier: (1, 1, 1),
            input_location: BufferLocation::Sram,
            input_locations: vec![BufferLocation::Sram],
            input_shapes: vec![[1, 16, 16, 16]],
            format: CompilerDataFormat::Nhwcb,
            weight_bytes_per_element: 1,
        }
    }

    #[test]
    fn plans_the_full_tensor_stripe_when_it_fits() {
        let caps = HardwareCapabilities::reference();
        let mut allocator = SramAllocator::new(caps.sram_bytes_per_lane());
        let options = CompilationOptions::default();
        let pass = plan_pass(1, &request(), &caps, &mut allocator, &options).unwrap().unwrap();
        assert_eq!(pass.output_stripe_shape, [1, 16, 16, 16]);
    }

    #[test]
    fn falls_back_to_smaller_stripes_when_sram_is_too_small() {
        let caps = HardwareCapabilities::reference();
        let mut allocator = SramAllocator::new(2048); // too small for the full stripe
        let options = CompilationOptions::default();
        let req = PassRequest {
            output_shape: [1, 64, 64, 64],
            ..request()
        };
        let pass = plan_pass(2, &req, &caps, &mut allocator, &options).unwrap();
        if let Some(p) = pass {
            let full_volume: u64 = [1u64, 64, 64, 64].iter().product();
            let stripe_volume: u64 = p.output_stripe_shape.iter().map(|&d| d as u64).product();
            assert!(stripe_volume < full_volume);
        }
    }

    #[test]
    fn fully_connected_forces_8x8_block_config_and_1024_byte_input_rounding() {
        let caps = HardwareCapabilities::reference();
        let mut allocator = SramAllocator::new(caps.sram_bytes_per_lane());
        let options = CompilationOptions::default();
        let req = PassRequest {
            op: MceOpKind::FullyConnected,
            kernel_h: 1,
            kernel_w: 1,
            output_shape: [1, 1, 1, 10],
            ifm_channels: 10,
            ..request()
        };
        let pass = plan_pass(3, &req, &caps, &mut allocator, &options).unwrap().unwrap();
        assert_eq!(pass.block_config, FC_BLOCK_CONFIG);
        assert_eq!(pass.input_tile.stripe_bytes % FC_INPUT_TILE_ALIGNMENT, 0);
    }

    #[test]
    fn nchw_is_rejected_without_hardware_support() {
        let mut caps = HardwareCapabilities::reference();
        caps.supports_nchw = false;
        let mut allocator = SramAllocator::new(caps.sram_bytes_per_lane());
        let options = CompilationOptions::default();
        let req = PassRequest { format: CompilerDataFormat::Nchw, ..request() };
        let err = plan_pass(4, &req, &caps, &mut allocator, &options).unwrap_err();
        assert!(matches!(err, CompilerError::NotSupported { .. }));
    }

    #[test]
    fn cascading_groups_dram_free_runs_and_tags_miso_by_head_input_count() {
        let sections = cascade_into_sections(&[1, 2, 3], &[true, false, false], &[2]);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].pass_ids, vec![1, 2]);
        assert_eq!(sections[0].section_type, SectionType::Miso);
        assert_eq!(sections[1].pass_ids, vec![3]);
    }
}
