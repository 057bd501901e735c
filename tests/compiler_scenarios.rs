//! End-to-end compile/estimate scenarios (§8's worked examples), exercised
//! through the crate's public `Network`/`compile`/`estimate_performance`
//! surface only.

use std::sync::Arc;
use stripeweave::buffer_manager::BufferType;
use stripeweave::capabilities::HardwareCapabilities;
use stripeweave::command_stream::Command;
use stripeweave::compiler::{compile, compile_for_inspection, estimate_performance, COMPILED_BLOB_TAG};
use stripeweave::ir::node::{BiasAttr, Stride, UpsampleType, WeightsAttr};
use stripeweave::network::{tensor_info, Network, Operand, OperatorKind};
use stripeweave::options::CompilationOptions;
use stripeweave::tensor::{byte_size_nhwcb, CompilerDataFormat, DataType, QuantizationInfo};

fn caps() -> HardwareCapabilities {
    HardwareCapabilities::reference()
}

fn options() -> CompilationOptions {
    CompilationOptions::default()
}

/// §8 scenario 1: Input NHWC (1,16,16,16) converted to (1,8,32,16) NHWCB,
/// straight to Output. One conversion pass, one DRAM intermediate sized to
/// the rounded NHWCB output (4096 bytes per `nhwcb_byte_size_matches_scenario_one`
/// in `src/tensor/shape.rs`), no weight data anywhere in the compiled blob.
#[test]
fn identity_reshape_through_sram_produces_one_intermediate() {
    let mut net = Network::new();
    let input = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0))
        .unwrap();
    let converted = net
        .add_operator(
            vec![Operand { operator: input, output_index: 0 }],
            OperatorKind::FormatConversion { from: CompilerDataFormat::Nhwc, to: CompilerDataFormat::Nhwcb },
            tensor_info([1, 8, 32, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
    net.add_operator(
        vec![Operand { operator: converted, output_index: 0 }],
        OperatorKind::Output,
        tensor_info([1, 8, 32, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
    )
    .unwrap();

    let blob = compile(&net, &caps(), &options()).unwrap();
    assert_eq!(&blob[0..4], &COMPILED_BLOB_TAG);

    let artifacts = compile_for_inspection(&net, &caps(), &options()).unwrap();
    assert_eq!(artifacts.commands.commands().len(), 1, "exactly one conversion pass");
    match &artifacts.commands.commands()[0] {
        Command::Convert { output, .. } => {
            assert_eq!(output.tensor_shape, [1, 8, 32, 16]);
            assert_eq!(byte_size_nhwcb(output.tensor_shape).unwrap(), 4096);
        }
        other => panic!("expected a Convert command, got {other:?}"),
    }
    assert!(
        artifacts.buffers.buffers().values().all(|b| b.buffer_type != BufferType::ConstantDma),
        "reshape-only network carries no weight data"
    );
}

fn conv_weights(kh: u32, kw: u32, ifm: u32, ofm: u32) -> WeightsAttr {
    let len = (kh * kw * ifm * ofm) as usize;
    WeightsAttr {
        data: Arc::new(vec![1u8; len]),
        shape: [kh, kw, ifm, ofm],
        format: CompilerDataFormat::Hwio,
        quant: QuantizationInfo::per_tensor(0, 1.0),
    }
}

fn depthwise_weights(kh: u32, kw: u32, ifm: u32, multiplier: u32) -> WeightsAttr {
    let len = (kh * kw * ifm * multiplier) as usize;
    WeightsAttr {
        data: Arc::new(vec![1u8; len]),
        shape: [kh, kw, ifm, multiplier],
        format: CompilerDataFormat::Hwim,
        quant: QuantizationInfo::per_tensor(0, 1.0),
    }
}

fn bias(n: usize) -> BiasAttr {
    BiasAttr { data: Arc::new(vec![0i32; n]), scale: 1.0 }
}

/// §8 scenario 2: Conv 3x3 stride 1 pad 1, 16 OFMs, followed by a bounded
/// ReLu, straight to Output. The ReLu must fuse into the Conv's Pass rather
/// than becoming its own node in the command stream.
#[test]
fn bounded_relu_fuses_into_the_preceding_conv() {
    let mut net = Network::new();
    let input = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0))
        .unwrap();
    let conv = net
        .add_operator(
            vec![Operand { operator: input, output_index: 0 }],
            OperatorKind::Convolution {
                weights: conv_weights(3, 3, 16, 16),
                bias: bias(16),
                stride: Stride { x: 1, y: 1 },
                pad_top: 1,
                pad_left: 1,
                upscale_factor: 1,
                upsample_type: UpsampleType::Off,
            },
            tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
    let relu = net
        .add_operator(
            vec![Operand { operator: conv, output_index: 0 }],
            OperatorKind::Relu { lower_bound: 0, upper_bound: 128 },
            tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
    net.add_operator(
        vec![Operand { operator: relu, output_index: 0 }],
        OperatorKind::Output,
        tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
    )
    .unwrap();

    let blob = compile(&net, &caps(), &options()).unwrap();
    assert_eq!(&blob[0..4], &COMPILED_BLOB_TAG);

    let artifacts = compile_for_inspection(&net, &caps(), &options()).unwrap();
    let mce_ple_commands: Vec<_> = artifacts
        .commands
        .commands()
        .iter()
        .filter(|c| matches!(c, Command::McePle { .. }))
        .collect();
    assert_eq!(mce_ple_commands.len(), 1, "ReLu must fuse into the Conv's pass, not become its own command");
    match mce_ple_commands[0] {
        Command::McePle { mce, .. } => {
            assert_eq!((mce.clamp_lo, mce.clamp_hi), (0, 128));
            assert!(mce.algorithm_is_winograd, "3x3 stride-1 Conv should plan with Winograd");
        }
        other => panic!("expected McePle, got {other:?}"),
    }
}

/// §8 scenario 4: stride-2 depthwise 3x3 over (1,32,32,16) down to
/// (1,16,16,16). Direct algorithm only — Winograd never applies to a
/// non-unit stride.
#[test]
fn stride_2_depthwise_compiles_with_direct_algorithm() {
    let mut net = Network::new();
    let input = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 32, 32, 16], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0))
        .unwrap();
    let dw = net
        .add_operator(
            vec![Operand { operator: input, output_index: 0 }],
            OperatorKind::DepthwiseConvolution {
                weights: depthwise_weights(3, 3, 16, 1),
                bias: bias(16),
                stride: Stride { x: 2, y: 2 },
                pad_top: 1,
                pad_left: 1,
            },
            tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
    net.add_operator(
        vec![Operand { operator: dw, output_index: 0 }],
        OperatorKind::Output,
        tensor_info([1, 16, 16, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
    )
    .unwrap();

    let blob = compile(&net, &caps(), &options()).unwrap();
    assert_eq!(&blob[0..4], &COMPILED_BLOB_TAG);

    let artifacts = compile_for_inspection(&net, &caps(), &options()).unwrap();
    match &artifacts.commands.commands()[0] {
        Command::McePle { mce, .. } => assert!(!mce.algorithm_is_winograd, "non-unit stride never picks Winograd"),
        other => panic!("expected McePle, got {other:?}"),
    }
}

/// §8 scenario 3: Concat of two NHWCB tensors along C, (1,8,8,8) and
/// (1,8,8,24), into (1,8,8,32). Both producers must be laid out into one
/// shared DRAM supertensor, each writing its own disjoint slab.
#[test]
fn concat_of_two_nhwcb_tensors_along_c_compiles() {
    let mut net = Network::new();
    let a = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 8, 8, 8], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0))
        .unwrap();
    let b = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 8, 8, 24], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0))
        .unwrap();
    let concat = net
        .add_operator(
            vec![Operand { operator: a, output_index: 0 }, Operand { operator: b, output_index: 0 }],
            OperatorKind::Concatenation { axis: 3 },
            tensor_info([1, 8, 8, 32], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
    net.add_operator(
        vec![Operand { operator: concat, output_index: 0 }],
        OperatorKind::Output,
        tensor_info([1, 8, 8, 32], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
    )
    .unwrap();

    let blob = compile(&net, &caps(), &options()).unwrap();
    assert_eq!(&blob[0..4], &COMPILED_BLOB_TAG);

    let artifacts = compile_for_inspection(&net, &caps(), &options()).unwrap();
    let slabs: Vec<_> = artifacts
        .commands
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::Convert { output, .. } => Some(output.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(slabs.len(), 2, "each Concat producer gets its own slab-writing Convert");

    let supertensor_buf = slabs[0].buffer_id;
    assert!(
        slabs.iter().all(|output| output.buffer_id == supertensor_buf),
        "both producers must land in the same shared supertensor buffer"
    );
    let mut offsets: Vec<u32> = slabs.iter().map(|output| output.dram_offset).collect();
    offsets.sort();
    let first_slab_size = byte_size_nhwcb([1, 8, 8, 8]).unwrap();
    assert_eq!(offsets, vec![0, first_slab_size], "the second producer's slab starts where the first one ends");

    let supertensor = artifacts.buffers.buffers().get(&supertensor_buf).expect("supertensor buffer registered");
    assert_eq!(supertensor.buffer_type, BufferType::Output, "sole consumer is Output, so it's reclassified in place");
    assert_eq!(supertensor.size, first_slab_size + byte_size_nhwcb([1, 8, 8, 24]).unwrap());
}

/// §8 scenario 3 boundary case: Concat inputs whose combined shape is
/// smaller than a brick group must still compile (each slab still gets its
/// own full brick-group-rounded byte allocation).
#[test]
fn concat_smaller_than_a_brick_group_still_compiles() {
    let mut net = Network::new();
    let a = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 1, 1, 4], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0))
        .unwrap();
    let b = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 1, 1, 4], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0))
        .unwrap();
    let concat = net
        .add_operator(
            vec![Operand { operator: a, output_index: 0 }, Operand { operator: b, output_index: 0 }],
            OperatorKind::Concatenation { axis: 3 },
            tensor_info([1, 1, 1, 8], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
    net.add_operator(
        vec![Operand { operator: concat, output_index: 0 }],
        OperatorKind::Output,
        tensor_info([1, 1, 1, 8], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
    )
    .unwrap();

    let blob = compile(&net, &caps(), &options()).unwrap();
    assert_eq!(&blob[0..4], &COMPILED_BLOB_TAG);
}

/// §8 scenario 6: a Conv whose full-tensor stripe plan doesn't fit in SRAM
/// must fall back to a smaller stripe rather than fail to compile.
#[test]
fn sram_pressure_forces_a_smaller_stripe_plan() {
    let mut tight_caps = HardwareCapabilities::reference();
    tight_caps.num_srams = 1;
    tight_caps.total_sram_bytes = 40_000; // too small for the full (1,64,64,16) tile, large enough for a split one

    let mut net = Network::new();
    let input = net
        .add_operator(vec![], OperatorKind::Input, tensor_info([1, 64, 64, 16], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0))
        .unwrap();
    let conv = net
        .add_operator(
            vec![Operand { operator: input, output_index: 0 }],
            OperatorKind::Convolution {
                weights: conv_weights(3, 3, 16, 16),
                bias: bias(16),
                stride: Stride { x: 1, y: 1 },
                pad_top: 1,
                pad_left: 1,
                upscale_factor: 1,
                upsample_type: UpsampleType::Off,
            },
            tensor_info([1, 64, 64, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
        )
        .unwrap();
    net.add_operator(
        vec![Operand { operator: conv, output_index: 0 }],
        OperatorKind::Output,
        tensor_info([1, 64, 64, 16], DataType::U8, CompilerDataFormat::Nhwcb, 0, 1.0),
    )
    .unwrap();

    let blob = compile(&net, &tight_caps, &options()).unwrap();
    assert_eq!(&blob[0..4], &COMPILED_BLOB_TAG);

    let artifacts = compile_for_inspection(&net, &tight_caps, &options()).unwrap();
    match &artifacts.commands.commands()[0] {
        Command::McePle { output, .. } => {
            let full_volume: u64 = [1u64, 64, 64, 16].iter().product();
            let stripe_volume: u64 = output.stripe_shape.iter().map(|&d| d as u64).product();
            assert!(stripe_volume < full_volume, "planner should have re-planned to a smaller-than-full stripe");
        }
        other => panic!("expected McePle, got {other:?}"),
    }
}

/// §8 scenario 5: a branch the taxonomy can't map raises `NotSupported`
/// from `compile`, but `estimate_performance` still succeeds and annotates
/// the offending operator id with the reason.
#[test]
fn estimate_only_branch_fails_compile_but_annotates_estimate() {
    let mut net = Network::new();
    net.add_operator(
        vec![],
        OperatorKind::Unsupported { reason: "dynamic batch dimension".into() },
        tensor_info([1, 4, 4, 4], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0),
    )
    .unwrap();

    assert!(compile(&net, &caps(), &options()).is_err());

    let report = estimate_performance(&net, &caps(), &options()).unwrap();
    assert_eq!(report.issues.get(&0).map(String::as_str), Some("dynamic batch dimension"));
}

/// §8: a network that fails the fail-early batch-size check never reaches
/// graph construction at all.
#[test]
fn batch_size_greater_than_one_is_rejected_before_graph_construction() {
    let mut net = Network::new();
    net.add_operator(vec![], OperatorKind::Input, tensor_info([2, 4, 4, 4], DataType::U8, CompilerDataFormat::Nhwc, 0, 1.0))
        .unwrap();

    assert!(compile(&net, &caps(), &options()).is_err());
}
