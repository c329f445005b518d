//! Layout Assigner and Boundary Delayout.
//!
//! The assigner gives every dispatch operand an explicit physical
//! layout: canonical row-major strides, undefined out-of-bounds fill,
//! the unit grid, host system memory. An operand produced by a bare
//! `empty` allocation is specialized in place (the buffer is simply
//! declared with the layout); anything else gets an explicit
//! [`NodeKind::ToLayout`] conversion inserted in front of the
//! dispatch. Once any operand changed, the concrete layouts are
//! propagated into the dispatch's region parameters, onto the cloned
//! kernel's result, and onto the dispatch's own result.
//!
//! The delayout pattern undoes this at the program boundary: every
//! returned value still carrying a layout is converted back into a
//! plain host buffer, so callers never observe device-specific types.
//!
//! Both patterns run in one pass; each returns no-match once there is
//! nothing left to do, which is the pass's fixpoint signal.

use crate::rewrite::{apply_patterns_greedily, Rewrite, RewritePattern};
use crate::{
    canonical_strides, Enclosing, Graph, Grid, Layout, LayoutId, MemRefDesc, MemorySpace, NodeId,
    NodeKind, OobVal, PassError, TensorType, ValueId, ValueOrigin,
};

/// Synthesize the canonical host layout for a tensor type and intern
/// it: row-major strides, undefined OOB fill, 1x1 grid, system memory,
/// untiled.
fn synthesize_layout(graph: &mut Graph, ty: &TensorType) -> LayoutId {
    let layout = Layout {
        strides: canonical_strides(&ty.shape),
        oob_val: OobVal::Undef,
        grid: Grid::UNIT,
        memref: MemRefDesc {
            shape: ty.shape.clone(),
            tile: None,
            dtype: ty.dtype,
            space: MemorySpace::System,
        },
    };
    graph.intern_layout(layout)
}

struct AssignDispatchLayouts;

impl AssignDispatchLayouts {
    /// Give one layout-less operand a layout, in place when its
    /// producer is a bare placeholder allocation, otherwise through an
    /// inserted conversion. Returns the operand's new value.
    fn lay_out_operand(
        graph: &mut Graph,
        dispatch: NodeId,
        operand: ValueId,
    ) -> Result<ValueId, PassError> {
        let ty = graph.value(operand).ty.clone();
        let lid = synthesize_layout(graph, &ty);

        if let ValueOrigin::Node(producer) = graph.value(operand).origin {
            let bare_empty = matches!(graph.node(producer).kind, NodeKind::Empty)
                && !graph.has_uses_besides(operand, dispatch);
            if bare_empty {
                // Specialize the allocation itself; no conversion needed.
                graph.attach_layout(operand, lid)?;
                return Ok(operand);
            }
        }

        let span = graph.node(dispatch).span;
        let laid_ty = TensorType {
            shape: ty.shape.clone(),
            dtype: ty.dtype,
            layout: Some(lid),
        };
        let buffer = graph.new_node(
            NodeKind::Empty,
            Some(laid_ty.clone()),
            span,
            Enclosing::Root,
        );
        let buffer_val = graph.result_of(buffer);
        let convert = graph.new_node(
            NodeKind::ToLayout {
                input: operand,
                buffer: buffer_val,
                device_bound: true,
            },
            Some(laid_ty),
            span,
            Enclosing::Root,
        );
        graph.insert_before(dispatch, buffer);
        graph.insert_before(dispatch, convert);
        Ok(graph.result_of(convert))
    }

    /// Push the operands' now-concrete types into the region: each
    /// parameter mirrors its operand, the cloned kernel's result
    /// follows its output buffer, and the dispatch result follows the
    /// last operand (destination-passing: the last operand is the
    /// output).
    fn propagate_into_region(graph: &mut Graph, dispatch: NodeId) {
        let NodeKind::Dispatch(d) = &graph.node(dispatch).kind else {
            unreachable!("propagating into a dispatch");
        };
        let operands = d.operands.clone();
        let params = d.params.clone();
        let body = d.body.clone();

        for (&param, &operand) in params.iter().zip(operands.iter()) {
            let ty = graph.value(operand).ty.clone();
            graph.set_value_type(param, ty);
        }
        for n in body {
            if let NodeKind::Kernel(k) = &graph.node(n).kind {
                let out_ty = graph.value(k.output).ty.clone();
                graph.set_value_type(graph.result_of(n), out_ty);
            }
        }
        let out_ty = graph
            .value(*operands.last().expect("dispatch has operands"))
            .ty
            .clone();
        graph.set_value_type(graph.result_of(dispatch), out_ty);
    }
}

impl RewritePattern for AssignDispatchLayouts {
    fn name(&self) -> &'static str {
        "assign-dispatch-layouts"
    }

    fn match_and_rewrite(&self, graph: &mut Graph, node: NodeId) -> Result<Rewrite, PassError> {
        let operands = match &graph.node(node).kind {
            NodeKind::Dispatch(d) => d.operands.clone(),
            _ => return Ok(Rewrite::NoMatch),
        };

        let mut modified = false;
        for (i, operand) in operands.iter().enumerate() {
            if graph.value(*operand).ty.layout.is_some() {
                continue;
            }
            let new_operand = Self::lay_out_operand(graph, node, *operand)?;
            match &mut graph.node_mut(node).kind {
                NodeKind::Dispatch(d) => d.operands[i] = new_operand,
                _ => unreachable!("matched a dispatch"),
            }
            modified = true;
        }

        if !modified {
            return Ok(Rewrite::NoMatch);
        }
        Self::propagate_into_region(graph, node);
        Ok(Rewrite::Changed)
    }
}

struct DelayoutReturns;

impl RewritePattern for DelayoutReturns {
    fn name(&self) -> &'static str {
        "delayout-returns"
    }

    fn match_and_rewrite(&self, graph: &mut Graph, node: NodeId) -> Result<Rewrite, PassError> {
        let operands = match &graph.node(node).kind {
            NodeKind::Return { operands } => operands.clone(),
            _ => return Ok(Rewrite::NoMatch),
        };

        let mut modified = false;
        for (i, &operand) in operands.iter().enumerate() {
            let ty = graph.value(operand).ty.clone();
            if ty.layout.is_none() {
                continue;
            }

            let span = graph.node(node).span;
            let host_ty = TensorType::new(ty.shape.clone(), ty.dtype);
            let buffer = graph.new_node(
                NodeKind::Empty,
                Some(host_ty.clone()),
                span,
                Enclosing::Root,
            );
            let buffer_val = graph.result_of(buffer);
            let convert = graph.new_node(
                NodeKind::ToLayout {
                    input: operand,
                    buffer: buffer_val,
                    device_bound: false,
                },
                Some(host_ty),
                span,
                Enclosing::Root,
            );
            graph.insert_before(node, buffer);
            graph.insert_before(node, convert);
            let converted = graph.result_of(convert);
            match &mut graph.node_mut(node).kind {
                NodeKind::Return { operands } => operands[i] = converted,
                _ => unreachable!("matched a return"),
            }
            modified = true;
        }

        Ok(if modified {
            Rewrite::Changed
        } else {
            Rewrite::NoMatch
        })
    }
}

/// Run the Layout Assigner and Boundary Delayout to fixpoint. Returns
/// whether anything was rewritten; a `false` return means every
/// dispatch operand already carries a layout and every returned value
/// is layout-less.
///
/// # Errors
///
/// [`PassError::LayoutReattach`] if a layout is assigned onto an
/// already laid-out value — an earlier-pipeline bug, not recoverable.
pub fn assign_layouts(graph: &mut Graph) -> Result<bool, PassError> {
    apply_patterns_greedily(graph, &[&AssignDispatchLayouts, &DelayoutReturns])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::build_dispatches;
    use crate::recognize::recognize_kernels;
    use crate::{DType, HlOp, Shape};
    use tgc_span::Span;

    fn f32_ty(dims: &[i64]) -> TensorType {
        TensorType::new(Shape::new(dims.iter().copied()), DType::Float32)
    }

    fn dispatched_add() -> Graph {
        let mut g = Graph::new();
        let a = g.add_argument(f32_ty(&[4, 4]), Span::DUMMY);
        let b = g.add_argument(f32_ty(&[4, 4]), Span::DUMMY);
        let s = g.append_hl(HlOp::Add, [a, b], f32_ty(&[4, 4]), Span::DUMMY);
        g.set_return([s], Span::DUMMY);
        recognize_kernels(&mut g).unwrap();
        build_dispatches(&mut g).unwrap();
        g
    }

    fn the_dispatch(g: &Graph) -> (NodeId, &crate::Dispatch) {
        g.body()
            .iter()
            .find_map(|&n| match &g.node(n).kind {
                NodeKind::Dispatch(d) => Some((n, d)),
                _ => None,
            })
            .expect("graph has a dispatch")
    }

    #[test]
    fn test_every_operand_laid_out_after_fixpoint() {
        let mut g = dispatched_add();
        assert!(assign_layouts(&mut g).unwrap());

        let (_, d) = the_dispatch(&g);
        for &v in &d.operands {
            assert!(g.value(v).ty.layout.is_some(), "operand without layout");
        }
        // Re-running reports no change.
        assert!(!assign_layouts(&mut g).unwrap());
    }

    #[test]
    fn test_bare_empty_specialized_without_conversion() {
        let mut g = dispatched_add();
        assert!(assign_layouts(&mut g).unwrap());

        let (_, d) = the_dispatch(&g);
        // Two argument operands go through conversions; the DPS buffer
        // (last operand) is an empty specialized in place.
        let out = *d.operands.last().unwrap();
        let ValueOrigin::Node(producer) = g.value(out).origin else {
            panic!("buffer is node-produced");
        };
        assert!(matches!(g.node(producer).kind, NodeKind::Empty));

        let conversions = g
            .body()
            .iter()
            .filter(|&&n| {
                matches!(
                    g.node(n).kind,
                    NodeKind::ToLayout {
                        device_bound: true,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(conversions, 2);
    }

    #[test]
    fn test_layout_propagates_through_region() {
        let mut g = dispatched_add();
        assign_layouts(&mut g).unwrap();

        let (node, d) = the_dispatch(&g);
        for (&param, &operand) in d.params.iter().zip(d.operands.iter()) {
            assert_eq!(g.value(param).ty, g.value(operand).ty);
        }
        let NodeKind::Kernel(k) = &g.node(d.body[0]).kind else {
            panic!("expected kernel clone");
        };
        assert_eq!(
            g.value(g.result_of(d.body[0])).ty,
            g.value(k.output).ty,
            "kernel result follows its output buffer"
        );
        assert_eq!(
            g.value(g.result_of(node)).ty,
            g.value(*d.operands.last().unwrap()).ty,
            "dispatch result follows the output operand"
        );
    }

    #[test]
    fn test_propagated_layout_shares_identity() {
        let mut g = dispatched_add();
        assign_layouts(&mut g).unwrap();

        let (node, d) = the_dispatch(&g);
        let out = *d.operands.last().unwrap();
        let out_lid = g.value(out).ty.layout.unwrap();
        assert_eq!(g.value(d.params[2]).ty.layout, Some(out_lid));
        assert_eq!(g.value(g.result_of(node)).ty.layout, Some(out_lid));
    }

    #[test]
    fn test_returned_device_tensor_is_delayouted() {
        let mut g = dispatched_add();
        assign_layouts(&mut g).unwrap();

        // The return's operand is now a host-bound conversion result
        // with no layout.
        let ret = *g.body().last().unwrap();
        let NodeKind::Return { operands } = &g.node(ret).kind else {
            panic!("expected return");
        };
        let returned = operands[0];
        assert!(g.value(returned).ty.layout.is_none());
        let ValueOrigin::Node(producer) = g.value(returned).origin else {
            panic!("conversion is node-produced");
        };
        assert!(matches!(
            g.node(producer).kind,
            NodeKind::ToLayout {
                device_bound: false,
                ..
            }
        ));

        // Exactly one host-bound conversion for the one returned value.
        let host_convs = g
            .body()
            .iter()
            .filter(|&&n| {
                matches!(
                    g.node(n).kind,
                    NodeKind::ToLayout {
                        device_bound: false,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(host_convs, 1);
    }

    #[test]
    fn test_layoutless_return_untouched() {
        let mut g = Graph::new();
        let a = g.add_argument(f32_ty(&[4]), Span::DUMMY);
        g.set_return([a], Span::DUMMY);

        assert!(!assign_layouts(&mut g).unwrap());
        assert_eq!(g.body().len(), 1);
    }
}
