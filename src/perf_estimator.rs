//! Module J: MCE/PLE/DRAM/weights statistics and the overall metric the
//! planner ranks candidate plans with.
//!
//! Grounded on `MceEstimationUtils.cpp` (MCE cycle formula, Winograd block
//! constants) and `PerformanceData.cpp` (the stats record shape and the
//! `Stream`/`Issues` JSON tree from §6).

use crate::capabilities::HardwareCapabilities;
use crate::ir::node::MceOpKind;
use crate::tensor::{round_up_to_brick_group, TensorShape, PATCH_SHAPE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MceStats {
    pub cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightsStats {
    pub parallel_bytes: u64,
    pub non_parallel_bytes: u64,
    pub num_reloads: u32,
    pub compression_savings: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DramStats {
    pub parallel_bytes: u64,
    pub non_parallel_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PleStats {
    pub num_patches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PassPerformance {
    pub mce: MceStats,
    pub input: DramStats,
    pub output: DramStats,
    pub weights: WeightsStats,
    pub ple: PleStats,
    /// `max(mce_cycles, parallel_dram_cycles) + non_parallel_dram_cycles`.
    pub metric: u64,
}

impl PassPerformance {
    pub fn compute(
        mce_cycles: u64,
        input: DramStats,
        output: DramStats,
        weights: WeightsStats,
        ple: PleStats,
    ) -> Self {
        let parallel_dram_cycles = input.parallel_bytes + output.parallel_bytes + weights.parallel_bytes;
        let non_parallel_dram_cycles =
            input.non_parallel_bytes + output.non_parallel_bytes + weights.non_parallel_bytes;
        let metric = mce_cycles.max(parallel_dram_cycles) + non_parallel_dram_cycles;
        Self {
            mce: MceStats { cycles: mce_cycles },
            input,
            output,
            weights,
            ple,
            metric,
        }
    }
}

/// Direct-algorithm MCE cycle estimate:
/// `(rounded_H * rounded_W * ceil(IFM_C/MACs_per_cycle) * rounded_OFM_C * kernel_area)
///   / (igs_per_engine * macs_per_og * num_active_ogs)`.
pub fn mce_cycles_direct(
    caps: &HardwareCapabilities,
    output_shape: TensorShape,
    ifm_channels: u32,
    kernel_h: u32,
    kernel_w: u32,
    num_active_ogs: u32,
) -> u64 {
    let rounded = round_up_to_brick_group(output_shape).unwrap_or(output_shape);
    let macs_per_cycle = caps.macs_per_og.max(1);
    let ifm_groups = (ifm_channels + macs_per_cycle - 1) / macs_per_cycle;
    let kernel_area = (kernel_h * kernel_w) as u64;
    let numerator = rounded[1] as u64 * rounded[2] as u64 * ifm_groups as u64 * rounded[3] as u64 * kernel_area;
    let denominator = (caps.igs_per_engine.max(1) as u64)
        * (caps.macs_per_og.max(1) as u64)
        * (num_active_ogs.max(1) as u64);
    numerator.div_ceil(denominator.max(1))
}

/// Winograd-algorithm MCE cycle estimate, keyed by kernel shape against the
/// capability record's MAC-per-Winograd-block constants.
pub fn mce_cycles_winograd(
    caps: &HardwareCapabilities,
    output_shape: TensorShape,
    kernel_h: u32,
    kernel_w: u32,
    num_active_ogs: u32,
) -> u64 {
    let rounded = round_up_to_brick_group(output_shape).unwrap_or(output_shape);
    let macs_per_block = match (kernel_h, kernel_w) {
        (1, 1) => caps.winograd_block_sizes.one_by_one,
        (1, 3) => caps.winograd_block_sizes.one_by_three,
        (3, 1) => caps.winograd_block_sizes.three_by_one,
        (3, 3) => caps.winograd_block_sizes.three_by_three,
        _ => caps.winograd_block_sizes.three_by_three,
    } as u64;
    let numerator = rounded[1] as u64 * rounded[2] as u64 * rounded[3] as u64 * macs_per_block;
    let denominator = (caps.igs_per_engine.max(1) as u64)
        * (caps.macs_per_og.max(1) as u64)
        * (num_active_ogs.max(1) as u64);
    numerator.div_ceil(denominator.max(1))
}

pub fn mce_cycles(
    caps: &HardwareCapabilities,
    op: MceOpKind,
    is_winograd: bool,
    output_shape: TensorShape,
    ifm_channels: u32,
    kernel_h: u32,
    kernel_w: u32,
    num_active_ogs: u32,
) -> u64 {
    let _ = op;
    if is_winograd {
        mce_cycles_winograd(caps, output_shape, kernel_h, kernel_w, num_active_ogs)
    } else {
        mce_cycles_direct(caps, output_shape, ifm_channels, kernel_h, kernel_w, num_active_ogs)
    }
}

/// PLE patches: number of `(1,8,4)` H x W patches needed to cover `shape`.
pub fn ple_num_patches(shape: TensorShape) -> u64 {
    let h_patches = (shape[1] as u64 + PATCH_SHAPE.h as u64 - 1) / PATCH_SHAPE.h as u64;
    let w_patches = (shape[2] as u64 + PATCH_SHAPE.w as u64 - 1) / PATCH_SHAPE.w as u64;
    h_patches * w_patches * shape[3] as u64
}

/// Bytes transferred for a set of stripes, split into "parallel" (can
/// overlap with compute, when SRAM tile streaming is double/triple
/// buffered) and "non-parallel" (stalls the pipeline), with an optional
/// compression savings ratio applied multiplicatively.
pub fn dram_stats(stripe_bytes: u64, num_stripes: u32, num_parallel_stripes: u32, compression_savings: f32) -> DramStats {
    let factor = 1.0 - compression_savings.clamp(0.0, 1.0);
    let total = (stripe_bytes as f64 * num_stripes as f64 * factor as f64) as u64;
    let parallel_fraction = if num_stripes == 0 {
        0.0
    } else {
        (num_parallel_stripes.min(num_stripes)) as f64 / num_stripes as f64
    };
    let parallel_bytes = (total as f64 * parallel_fraction) as u64;
    DramStats {
        parallel_bytes,
        non_parallel_bytes: total - parallel_bytes,
    }
}

/// Reload count: only non-zero when streaming in both H and C but not W
/// (§4.J), since the weight tile then needs reloading once per extra H
/// stripe group.
pub fn weight_reload_count(stripes_h: u32, stripes_w: u32, stripes_c: u32) -> u32 {
    if stripes_h > 1 && stripes_c > 1 && stripes_w == 1 {
        stripes_h - 1
    } else {
        0
    }
}

/// The deterministic per-operation JSON performance tree from §6.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PerformanceReport {
    pub stream: Vec<StreamEntry>,
    pub issues: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    pub operation_ids: Vec<u32>,
    pub parent_ids: Vec<u32>,
    pub input: DramStats,
    pub output: DramStats,
    pub weights: WeightsStats,
    pub mce: MceStats,
    pub ple: PleStats,
}

impl PerformanceReport {
    /// Sum over passes of `metric` — the network-wide performance number
    /// the planner minimises.
    pub fn network_metric(passes: &[PassPerformance]) -> u64 {
        passes.iter().map(|p| p.metric).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_is_max_plus_non_parallel() {
        let perf = PassPerformance::compute(
            100,
            DramStats { parallel_bytes: 20, non_parallel_bytes: 5 },
            DramStats { parallel_bytes: 10, non_parallel_bytes: 3 },
            WeightsStats { parallel_bytes: 0, non_parallel_bytes: 2, num_reloads: 0, compression_savings: 0.0 },
            PleStats { num_patches: 4 },
        );
        // parallel_dram = 30, mce=100 -> max=100; non_parallel = 10
        assert_eq!(perf.metric, 110);
    }

    #[test]
    fn weight_reload_only_when_streaming_h_and_c_not_w() {
        assert_eq!(weight_reload_count(3, 1, 2), 2);
        assert_eq!(weight_reload_count(3, 2, 2), 0);
        assert_eq!(weight_reload_count(1, 1, 2), 0);
    }
}
