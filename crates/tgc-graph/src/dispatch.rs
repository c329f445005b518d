//! Dispatch Builder.
//!
//! Wraps each top-level [`Kernel`] in a [`Dispatch`] describing its
//! grid-parallel execution: per-operand index maps and tiling
//! constraints, per-iteration-dimension roles, and a nested region
//! whose parameters mirror the operands. The kernel is cloned into the
//! region reading those parameters, the region yields the clone's
//! result, and the dispatch's result replaces the original kernel's.
//!
//! "Already wrapped" is detected structurally — a kernel whose
//! enclosing region is a dispatch fails the match — so the pass is
//! idempotent without any visited set.

use smallvec::SmallVec;

use crate::affine::{kernel_maps, operand_constraints, MapError};
use crate::rewrite::{apply_patterns_greedily, Rewrite, RewritePattern};
use crate::{Dispatch, Enclosing, Graph, Grid, Kernel, NodeId, NodeKind, PassError, ValueId};

/// The dispatch-building pattern, parameterized by the target grid.
///
/// No enclosing policy exists at this layer yet, so [`Grid::UNIT`] is
/// the default; a policy layer can construct the builder with a real
/// grid later.
pub struct DispatchBuilder {
    /// Grid assigned to every built dispatch.
    pub grid: Grid,
}

impl Default for DispatchBuilder {
    fn default() -> Self {
        Self { grid: Grid::UNIT }
    }
}

impl RewritePattern for DispatchBuilder {
    fn name(&self) -> &'static str {
        "kernel-to-dispatch"
    }

    fn match_and_rewrite(&self, graph: &mut Graph, node: NodeId) -> Result<Rewrite, PassError> {
        let kernel = match &graph.node(node).kind {
            NodeKind::Kernel(k) if graph.node(node).parent == Enclosing::Root => k.clone(),
            _ => return Ok(Rewrite::NoMatch),
        };

        let span = graph.node(node).span;
        let operands: SmallVec<[ValueId; 4]> = kernel.operands().collect();
        let ranks: Vec<usize> = operands
            .iter()
            .map(|&v| graph.value(v).ty.shape.rank())
            .collect();

        let (index_maps, iterator_roles) =
            kernel_maps(kernel.kind, &ranks).map_err(|e| match e {
                MapError::RankMismatch => PassError::RankMismatch {
                    kind: kernel.kind.name(),
                    node: graph.node_debug_string(node),
                },
                MapError::MatmulRank(rank) => PassError::MatmulRank {
                    rank,
                    node: graph.node_debug_string(node),
                },
            })?;
        let constraints = operand_constraints(kernel.kind, operands.len());
        debug_assert_eq!(index_maps.len(), operands.len());
        debug_assert_eq!(constraints.len(), operands.len());

        let result_ty = graph.value(graph.result_of(node)).ty.clone();
        let dispatch = graph.new_node(
            NodeKind::Dispatch(Dispatch {
                operands: operands.clone(),
                grid: self.grid,
                index_maps,
                iterator_roles,
                constraints,
                params: Vec::new(),
                body: Vec::new(),
            }),
            Some(result_ty.clone()),
            span,
            Enclosing::Root,
        );

        // Region parameters mirror the operands one for one.
        let params: Vec<ValueId> = operands
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                let ty = graph.value(v).ty.clone();
                graph.new_param(dispatch, i, ty, span)
            })
            .collect();

        // Clone the kernel into the region, reading the parameters.
        let n_inputs = kernel.inputs.len();
        let clone = graph.new_node(
            NodeKind::Kernel(Kernel {
                name: kernel.name.clone(),
                kind: kernel.kind,
                inputs: params[..n_inputs].iter().copied().collect(),
                output: params[n_inputs],
            }),
            Some(result_ty),
            span,
            Enclosing::Dispatch(dispatch),
        );
        let clone_result = graph.result_of(clone);
        let yld = graph.new_node(
            NodeKind::Yield {
                value: clone_result,
            },
            None,
            span,
            Enclosing::Dispatch(dispatch),
        );

        match &mut graph.node_mut(dispatch).kind {
            NodeKind::Dispatch(d) => {
                d.params = params;
                d.body = vec![clone, yld];
            }
            _ => unreachable!("just built a dispatch"),
        }

        graph.insert_before(node, dispatch);
        let kernel_result = graph.result_of(node);
        let dispatch_result = graph.result_of(dispatch);
        graph.replace_all_uses(kernel_result, dispatch_result);
        graph.remove_node(node);
        Ok(Rewrite::Changed)
    }
}

/// Run the Dispatch Builder to fixpoint with the default unit grid.
/// Returns whether anything was rewritten.
///
/// # Errors
///
/// [`PassError::RankMismatch`] / [`PassError::MatmulRank`] when a
/// kernel's operand ranks admit no index-space derivation — the
/// program is malformed for this target and the pipeline stops.
pub fn build_dispatches(graph: &mut Graph) -> Result<bool, PassError> {
    apply_patterns_greedily(graph, &[&DispatchBuilder::default()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::{IteratorRole, OperandConstraint};
    use crate::recognize::recognize_kernels;
    use crate::{DType, HlOp, Shape, TensorType};
    use tgc_span::Span;

    fn f32_ty(dims: &[i64]) -> TensorType {
        TensorType::new(Shape::new(dims.iter().copied()), DType::Float32)
    }

    fn eltwise_graph() -> Graph {
        let mut g = Graph::new();
        let a = g.add_argument(f32_ty(&[4, 4]), Span::DUMMY);
        let b = g.add_argument(f32_ty(&[4, 4]), Span::DUMMY);
        let s = g.append_hl(HlOp::Add, [a, b], f32_ty(&[4, 4]), Span::DUMMY);
        g.set_return([s], Span::DUMMY);
        recognize_kernels(&mut g).unwrap();
        g
    }

    fn find_dispatch(g: &Graph) -> &Dispatch {
        g.body()
            .iter()
            .find_map(|&n| match &g.node(n).kind {
                NodeKind::Dispatch(d) => Some(d),
                _ => None,
            })
            .expect("graph has a dispatch")
    }

    #[test]
    fn test_eltwise_kernel_is_wrapped() {
        let mut g = eltwise_graph();
        assert!(build_dispatches(&mut g).unwrap());

        let d = find_dispatch(&g);
        assert_eq!(d.operands.len(), 3); // two inputs and the buffer
        assert_eq!(d.grid, Grid::UNIT);
        assert_eq!(d.index_maps.len(), 3);
        assert!(d.index_maps.iter().all(|m| m.is_identity()));
        assert_eq!(d.iterator_roles, vec![IteratorRole::Parallel; 2]);
        assert_eq!(d.constraints, vec![OperandConstraint::Any; 3]);

        // Region: one param per operand, kernel clone reads params,
        // yield terminates.
        assert_eq!(d.params.len(), 3);
        assert_eq!(d.body.len(), 2);
        let NodeKind::Kernel(k) = &g.node(d.body[0]).kind else {
            panic!("expected kernel clone in region");
        };
        assert_eq!(k.inputs.as_slice(), &d.params[..2]);
        assert_eq!(k.output, d.params[2]);
        assert!(matches!(g.node(d.body[1]).kind, NodeKind::Yield { .. }));
    }

    #[test]
    fn test_builder_is_idempotent() {
        let mut g = eltwise_graph();
        assert!(build_dispatches(&mut g).unwrap());
        let dispatches = |g: &Graph| {
            g.live_nodes()
                .into_iter()
                .filter(|&n| matches!(g.node(n).kind, NodeKind::Dispatch(_)))
                .count()
        };
        let first = dispatches(&g);
        assert_eq!(first, 1);

        assert!(!build_dispatches(&mut g).unwrap());
        assert_eq!(dispatches(&g), first);
    }

    #[test]
    fn test_matmul_rank_one_is_fatal() {
        let mut g = Graph::new();
        let a = g.add_argument(f32_ty(&[4]), Span::DUMMY);
        let b = g.add_argument(f32_ty(&[4]), Span::DUMMY);
        let c = g.append_hl(HlOp::Matmul, [a, b], f32_ty(&[4]), Span::DUMMY);
        g.set_return([c], Span::DUMMY);
        recognize_kernels(&mut g).unwrap();

        let err = build_dispatches(&mut g).unwrap_err();
        assert!(matches!(err, PassError::MatmulRank { rank: 1, .. }));
    }

    #[test]
    fn test_eltwise_rank_mismatch_is_fatal() {
        let mut g = Graph::new();
        let a = g.add_argument(f32_ty(&[4, 4]), Span::DUMMY);
        let b = g.add_argument(f32_ty(&[4]), Span::DUMMY);
        let s = g.append_hl(HlOp::Add, [a, b], f32_ty(&[4, 4]), Span::DUMMY);
        g.set_return([s], Span::DUMMY);
        recognize_kernels(&mut g).unwrap();

        let err = build_dispatches(&mut g).unwrap_err();
        assert!(matches!(err, PassError::RankMismatch { kind: "eltwise", .. }));
    }
}
