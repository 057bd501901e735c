//! Module D: fixed-point rewrite optimiser (§4.D).
//!
//! Grounded on the teacher's `graph/optimizer.rs` fixed-point-by-construction
//! sweep (`GraphOptimizer::optimize` loops over nodes pattern-matching
//! adjacent op pairs); rewrite semantics themselves come from
//! `original_source/.../Optimization.cpp`.

use crate::errors::CResult;
use crate::ir::node::NodeKind;
use crate::ir::{Graph, NodeId};

/// Runs every rewrite in §4.D's listed order over a fresh topological
/// ordering each sweep, repeating until a full sweep makes no change.
#[tracing::instrument(skip(graph), name = "optimizer_fixed_point")]
pub fn optimize(graph: &mut Graph) -> CResult<()> {
    loop {
        let mut changed = false;
        for id in graph.topological_sort()? {
            if graph.node(id).is_none() {
                continue;
            }
            let applied = merge_inverse_format_conversions(graph, id)?
                || reorder_reinterpret_requantize(graph, id)?
                || reorder_concat_requantize_or_copy(graph, id)?
                || merge_copy_requantize(graph, id)?
                || merge_adjacent_requantizes(graph, id)?
                || merge_adjacent_copies(graph, id)?
                || merge_adjacent_concats(graph, id)?
                || remove_unconnected_leaf(graph, id)?
                || merge_constant_into_reinterpret_or_format(graph, id)?;
            changed |= applied;
        }
        if !changed {
            tracing::debug!("optimizer reached fixed point");
            return Ok(());
        }
    }
}

/// Rewrite 1: `X --Conv(A->B)--> Conv(B->A) ⇒ X`. Reuses `collapse_edge`
/// twice (once per cancelled conversion) rather than hand-rolling the
/// rewiring.
fn merge_inverse_format_conversions(graph: &mut Graph, f1: NodeId) -> CResult<bool> {
    let (from, to) = match graph.node(f1).map(|n| n.kind.clone()) {
        Some(NodeKind::FormatConversion { from, to }) => (from, to),
        _ => return Ok(false),
    };
    if graph.fan_out(f1) != 1 {
        return Ok(false);
    }
    let f2 = graph.consumers_of(f1)[0].0;
    let is_inverse = matches!(
        graph.node(f2).map(|n| n.kind.clone()),
        Some(NodeKind::FormatConversion { from: f2_from, to: f2_to }) if f2_from == to && f2_to == from
    );
    if !is_inverse {
        return Ok(false);
    }
    let Some(&e_in) = graph.incoming_edges(f1).first() else {
        return Ok(false);
    };
    let e_mid = graph.outgoing_edges(f1)[0];
    graph.collapse_edge(e_mid)?; // drops f2, f1's consumers now point past it
    graph.collapse_edge(e_in)?; // drops f1, X now feeds f2's old consumers directly
    Ok(true)
}

/// Rewrite 2: `Reinterpret -> Requantize` becomes `Requantize -> Reinterpret`
/// so the requantise can later fuse into a preceding MCE. The two nodes
/// swap kind/metadata in place; no edges need to move since the pair's
/// position in the graph is unchanged, only which op runs first.
fn reorder_reinterpret_requantize(graph: &mut Graph, r: NodeId) -> CResult<bool> {
    if !matches!(graph.node(r).map(|n| &n.kind), Some(NodeKind::Reinterpret)) {
        return Ok(false);
    }
    if graph.fan_out(r) != 1 {
        return Ok(false);
    }
    let q = graph.consumers_of(r)[0].0;
    if !matches!(graph.node(q).map(|n| &n.kind), Some(NodeKind::Requantize)) {
        return Ok(false);
    }
    let Some(&p) = graph.producers_of(r).first() else {
        return Ok(false);
    };
    let (p_shape, p_format) = {
        let n = graph.node(p).unwrap();
        (n.output_shape, n.format)
    };
    let (r_shape, r_format, r_ids) = {
        let n = graph.node(r).unwrap();
        (n.output_shape, n.format, n.corresponding_operation_ids.clone())
    };
    let (q_quant, q_dtype, q_ids) = {
        let n = graph.node(q).unwrap();
        (n.output_quant.clone(), n.output_dtype, n.corresponding_operation_ids.clone())
    };
    let merged_ids: Vec<u32> = r_ids.into_iter().chain(q_ids).collect();

    let rn = graph.node_mut(r).unwrap();
    rn.kind = NodeKind::Requantize;
    rn.output_shape = p_shape;
    rn.format = p_format;
    rn.output_quant = q_quant.clone();
    rn.output_dtype = q_dtype;
    rn.corresponding_operation_ids = merged_ids.clone();

    let qn = graph.node_mut(q).unwrap();
    qn.kind = NodeKind::Reinterpret;
    qn.output_shape = r_shape;
    qn.format = r_format;
    qn.output_quant = q_quant;
    qn.corresponding_operation_ids = merged_ids;

    Ok(true)
}

/// Rewrite 3: `Concat -> Requantize|Copy` pushes a copy of the downstream op
/// onto each of Concat's input branches (so each branch can fuse into its
/// own MCE), then drops the original downstream node.
fn reorder_concat_requantize_or_copy(graph: &mut Graph, concat: NodeId) -> CResult<bool> {
    if !matches!(graph.node(concat).map(|n| &n.kind), Some(NodeKind::Concat { .. })) {
        return Ok(false);
    }
    if graph.fan_out(concat) != 1 {
        return Ok(false);
    }
    let downstream = graph.consumers_of(concat)[0].0;
    let pushed_kind = match graph.node(downstream).map(|n| &n.kind) {
        Some(NodeKind::Requantize) => NodeKind::Requantize,
        Some(NodeKind::Copy) => NodeKind::Copy,
        _ => return Ok(false),
    };

    for e in graph.incoming_edges(concat) {
        let producer = graph.edge(e).map(|ed| ed.producer);
        let shape = producer.and_then(|p| graph.node(p)).map(|n| n.output_shape);
        let new_node = graph.create_node(pushed_kind.clone());
        if let Some(shape) = shape {
            graph.node_mut(new_node).unwrap().output_shape = shape;
        }
        graph.split_edge(e, new_node)?;
    }

    let out_edge = graph.outgoing_edges(concat)[0];
    graph.collapse_edge(out_edge)?;
    Ok(true)
}

/// Rewrite 4: `Copy -> Requantize` merges into a single Requantize, folding
/// the Copy's operation ids into the survivor.
fn merge_copy_requantize(graph: &mut Graph, copy: NodeId) -> CResult<bool> {
    if !matches!(graph.node(copy).map(|n| &n.kind), Some(NodeKind::Copy)) {
        return Ok(false);
    }
    if graph.fan_out(copy) != 1 {
        return Ok(false);
    }
    let requantize = graph.consumers_of(copy)[0].0;
    if !matches!(graph.node(requantize).map(|n| &n.kind), Some(NodeKind::Requantize)) {
        return Ok(false);
    }
    let copy_ids = graph.node(copy).unwrap().corresponding_operation_ids.clone();
    let Some(&incoming) = graph.incoming_edges(copy).first() else {
        return Ok(false);
    };
    graph.collapse_edge(incoming)?; // drops Copy, Requantize now reads Copy's producer directly
    if let Some(n) = graph.node_mut(requantize) {
        let mut ids = copy_ids;
        ids.extend(n.corresponding_operation_ids.iter().copied());
        n.corresponding_operation_ids = ids;
    }
    Ok(true)
}

/// Rewrite 5: adjacent Requantizes merge; the downstream node's parameters
/// win, both nodes' operation ids accumulate.
fn merge_adjacent_requantizes(graph: &mut Graph, q1: NodeId) -> CResult<bool> {
    if !matches!(graph.node(q1).map(|n| &n.kind), Some(NodeKind::Requantize)) {
        return Ok(false);
    }
    if graph.fan_out(q1) != 1 {
        return Ok(false);
    }
    let q2 = graph.consumers_of(q1)[0].0;
    if !matches!(graph.node(q2).map(|n| &n.kind), Some(NodeKind::Requantize)) {
        return Ok(false);
    }
    let (q2_quant, q2_dtype, q2_ids) = {
        let n = graph.node(q2).unwrap();
        (n.output_quant.clone(), n.output_dtype, n.corresponding_operation_ids.clone())
    };
    let e_mid = graph.outgoing_edges(q1)[0];
    graph.collapse_edge(e_mid)?; // drops q2
    if let Some(n) = graph.node_mut(q1) {
        n.output_quant = q2_quant;
        n.output_dtype = q2_dtype;
        n.corresponding_operation_ids.extend(q2_ids);
    }
    Ok(true)
}

/// Rewrite 6: adjacent Copies merge into one.
fn merge_adjacent_copies(graph: &mut Graph, c1: NodeId) -> CResult<bool> {
    if !matches!(graph.node(c1).map(|n| &n.kind), Some(NodeKind::Copy)) {
        return Ok(false);
    }
    if graph.fan_out(c1) != 1 {
        return Ok(false);
    }
    let c2 = graph.consumers_of(c1)[0].0;
    if !matches!(graph.node(c2).map(|n| &n.kind), Some(NodeKind::Copy)) {
        return Ok(false);
    }
    let c2_ids = graph.node(c2).unwrap().corresponding_operation_ids.clone();
    let e_mid = graph.outgoing_edges(c1)[0];
    graph.collapse_edge(e_mid)?;
    if let Some(n) = graph.node_mut(c1) {
        n.corresponding_operation_ids.extend(c2_ids);
    }
    Ok(true)
}

/// Rewrite 7: nested Concats along the same axis flatten into one. The
/// inner Concat's inputs are spliced in at the position its single edge
/// occupied in the outer Concat, and every input edge is torn down and
/// rebuilt in the new order since slot indices must stay dense.
fn merge_adjacent_concats(graph: &mut Graph, outer: NodeId) -> CResult<bool> {
    let outer_axis = match graph.node(outer).map(|n| n.kind.clone()) {
        Some(NodeKind::Concat { axis }) => axis,
        _ => return Ok(false),
    };
    let producers = graph.producers_of(outer);
    for (slot, &inner) in producers.iter().enumerate() {
        let is_match = matches!(
            graph.node(inner).map(|n| n.kind.clone()),
            Some(NodeKind::Concat { axis }) if axis == outer_axis
        ) && graph.fan_out(inner) == 1;
        if !is_match {
            continue;
        }

        let inner_producers = graph.producers_of(inner);
        let mut new_producers = producers.clone();
        new_producers.splice(slot..slot + 1, inner_producers);

        for s in 0..producers.len() as u32 {
            graph.disconnect_input(outer, s);
        }
        graph.remove_node(inner);
        for (new_slot, &src) in new_producers.iter().enumerate() {
            graph.connect(src, outer, new_slot as u32)?;
        }
        return Ok(true);
    }
    Ok(false)
}

/// Rewrite 8: a node with no consumers that isn't an Output is dead.
fn remove_unconnected_leaf(graph: &mut Graph, id: NodeId) -> CResult<bool> {
    if graph.fan_out(id) != 0 {
        return Ok(false);
    }
    if matches!(graph.node(id).map(|n| &n.kind), Some(NodeKind::Output { .. }) | None) {
        return Ok(false);
    }
    graph.remove_node(id);
    Ok(true)
}

/// Rewrite 9: `Constant -> Reinterpret|FormatConversion` folds into the
/// Constant itself by rewriting its output shape/format (and, for
/// FormatConversion, nothing else — the bytes are unchanged, only their
/// declared layout is).
fn merge_constant_into_reinterpret_or_format(graph: &mut Graph, constant: NodeId) -> CResult<bool> {
    if !matches!(graph.node(constant).map(|n| &n.kind), Some(NodeKind::Constant { .. })) {
        return Ok(false);
    }
    if graph.fan_out(constant) != 1 {
        return Ok(false);
    }
    let downstream = graph.consumers_of(constant)[0].0;
    let is_target = matches!(
        graph.node(downstream).map(|n| &n.kind),
        Some(NodeKind::Reinterpret) | Some(NodeKind::FormatConversion { .. })
    );
    if !is_target {
        return Ok(false);
    }
    let (d_shape, d_format, d_quant, d_dtype, d_ids) = {
        let n = graph.node(downstream).unwrap();
        (n.output_shape, n.format, n.output_quant.clone(), n.output_dtype, n.corresponding_operation_ids.clone())
    };
    let e = graph.outgoing_edges(constant)[0];
    graph.collapse_edge(e)?; // drops the Reinterpret/FormatConversion node
    if let Some(n) = graph.node_mut(constant) {
        n.output_shape = d_shape;
        n.format = d_format;
        n.output_quant = d_quant;
        n.output_dtype = d_dtype;
        n.corresponding_operation_ids.extend(d_ids);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_manager::BufferLocation;
    use crate::ir::node::{CompressionHint, LocationHint};
    use crate::tensor::{CompilerDataFormat, QuantizationInfo};
    use std::sync::Arc;

    fn const_node(g: &mut Graph, shape: [u32; 4]) -> NodeId {
        let id = g.create_node(NodeKind::Constant { data: Arc::new(vec![0; 4]) });
        g.node_mut(id).unwrap().output_shape = shape;
        g.node_mut(id).unwrap().location = BufferLocation::Dram;
        id
    }

    #[test]
    fn inverse_format_conversions_cancel() {
        let mut g = Graph::new();
        let c = const_node(&mut g, [1, 8, 8, 16]);
        let to_nhwcb = g.create_node(NodeKind::FormatConversion { from: CompilerDataFormat::Nhwc, to: CompilerDataFormat::Nhwcb });
        let back_to_nhwc = g.create_node(NodeKind::FormatConversion { from: CompilerDataFormat::Nhwcb, to: CompilerDataFormat::Nhwc });
        let out = g.create_node(NodeKind::Output { source_operation_output_index: 0 });
        g.connect(c, to_nhwcb, 0).unwrap();
        g.connect(to_nhwcb, back_to_nhwc, 0).unwrap();
        g.connect(back_to_nhwc, out, 0).unwrap();

        optimize(&mut g).unwrap();

        assert_eq!(g.producers_of(out), vec![c]);
        assert!(g.node(to_nhwcb).is_none());
        assert!(g.node(back_to_nhwc).is_none());
    }

    #[test]
    fn reinterpret_then_requantize_swaps_order() {
        let mut g = Graph::new();
        let input = g.create_node(NodeKind::Input);
        let reinterpret = g.create_node(NodeKind::Reinterpret);
        let requantize = g.create_node(NodeKind::Requantize);
        g.node_mut(requantize).unwrap().output_quant = QuantizationInfo::per_tensor(4, 0.5);
        let out = g.create_node(NodeKind::Output { source_operation_output_index: 0 });
        g.connect(input, reinterpret, 0).unwrap();
        g.connect(reinterpret, requantize, 0).unwrap();
        g.connect(requantize, out, 0).unwrap();

        assert!(reorder_reinterpret_requantize(&mut g, reinterpret).unwrap());
        assert!(matches!(g.node(reinterpret).unwrap().kind, NodeKind::Requantize));
        assert!(matches!(g.node(requantize).unwrap().kind, NodeKind::Reinterpret));
        assert_eq!(g.node(reinterpret).unwrap().output_quant.zero_point, 4);
    }

    #[test]
    fn adjacent_requantizes_merge_taking_downstream_params() {
        let mut g = Graph::new();
        let input = g.create_node(NodeKind::Input);
        let q1 = g.create_node(NodeKind::Requantize);
        g.node_mut(q1).unwrap().corresponding_operation_ids = vec![1];
        let q2 = g.create_node(NodeKind::Requantize);
        g.node_mut(q2).unwrap().output_quant = QuantizationInfo::per_tensor(9, 2.0);
        g.node_mut(q2).unwrap().corresponding_operation_ids = vec![2];
        let out = g.create_node(NodeKind::Output { source_operation_output_index: 0 });
        g.connect(input, q1, 0).unwrap();
        g.connect(q1, q2, 0).unwrap();
        g.connect(q2, out, 0).unwrap();

        optimize(&mut g).unwrap();

        let survivors: Vec<NodeId> = g.producers_of(out);
        assert_eq!(survivors, vec![q1]);
        let n = g.node(q1).unwrap();
        assert_eq!(n.output_quant.zero_point, 9);
        assert_eq!(n.corresponding_operation_ids, vec![1, 2]);
    }

    #[test]
    fn nested_concats_along_same_axis_flatten() {
        let mut g = Graph::new();
        let a = const_node(&mut g, [1, 8, 8, 16]);
        let b = const_node(&mut g, [1, 8, 8, 16]);
        let c = const_node(&mut g, [1, 8, 8, 16]);
        let inner = g.create_node(NodeKind::Concat { axis: 3 });
        g.connect(a, inner, 0).unwrap();
        g.connect(b, inner, 1).unwrap();
        let outer = g.create_node(NodeKind::Concat { axis: 3 });
        g.connect(inner, outer, 0).unwrap();
        g.connect(c, outer, 1).unwrap();
        let out = g.create_node(NodeKind::Output { source_operation_output_index: 0 });
        g.connect(outer, out, 0).unwrap();

        assert!(merge_adjacent_concats(&mut g, outer).unwrap());
        assert!(g.node(inner).is_none());
        assert_eq!(g.producers_of(outer), vec![a, b, c]);
    }

    #[test]
    fn dead_non_output_leaf_is_removed() {
        let mut g = Graph::new();
        let input = g.create_node(NodeKind::Input);
        let dangling = g.create_node(NodeKind::Copy);
        g.connect(input, dangling, 0).unwrap();
        // dangling has no consumers and is not an Output.
        optimize(&mut g).unwrap();
        assert!(g.node(dangling).is_none());
    }

    #[test]
    fn constant_reinterpret_folds_shape_into_constant() {
        let mut g = Graph::new();
        let c = const_node(&mut g, [1, 8, 8, 16]);
        let reinterpret = g.create_node(NodeKind::Reinterpret);
        g.node_mut(reinterpret).unwrap().output_shape = [1, 4, 16, 16];
        g.node_mut(reinterpret).unwrap().compression_hint = CompressionHint::None;
        g.node_mut(reinterpret).unwrap().location_hint = LocationHint::None;
        let out = g.create_node(NodeKind::Output { source_operation_output_index: 0 });
        g.connect(c, reinterpret, 0).unwrap();
        g.connect(reinterpret, out, 0).unwrap();

        optimize(&mut g).unwrap();

        assert_eq!(g.producers_of(out), vec![c]);
        assert_eq!(g.node(c).unwrap().output_shape, [1, 4, 16, 16]);
    }
}
