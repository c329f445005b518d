//! Rewrite-to-fixpoint driver.
//!
//! Each pass is a set of [`RewritePattern`]s applied greedily: the
//! driver scans every live node, and whenever a pattern fires it
//! restarts the scan, until one full scan applies nothing. Patterns
//! report [`Rewrite::NoMatch`] freely — that is the normal signal that
//! drives termination, not an error. Anything fatal comes back as a
//! [`PassError`] and aborts the whole pass.
//!
//! The driver holds no state between scans (no visited sets); a
//! pattern that must not re-fire on its own output detects that
//! structurally, e.g. the Dispatch Builder checks the node's enclosing
//! region. This keeps every pass safe to re-run, which the fixpoint
//! tests rely on.

use tracing::{debug, trace};

use crate::{Graph, NodeId, PassError};

/// Outcome of one pattern application attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rewrite {
    /// The pattern fired and mutated the graph.
    Changed,
    /// The pattern does not apply to this node.
    NoMatch,
}

/// One graph-rewriting rule.
pub trait RewritePattern {
    /// Pattern name, for tracing.
    fn name(&self) -> &'static str;

    /// Try to rewrite `node`. Must either mutate the graph and return
    /// [`Rewrite::Changed`], leave it untouched and return
    /// [`Rewrite::NoMatch`], or fail fatally.
    ///
    /// # Errors
    ///
    /// Fatal [`PassError`]s only; "does not apply" is not an error.
    fn match_and_rewrite(&self, graph: &mut Graph, node: NodeId) -> Result<Rewrite, PassError>;
}

/// Apply `patterns` greedily until a full scan changes nothing.
/// Returns whether any rewrite fired at all.
///
/// # Errors
///
/// Propagates the first fatal [`PassError`] a pattern reports.
pub fn apply_patterns_greedily(
    graph: &mut Graph,
    patterns: &[&dyn RewritePattern],
) -> Result<bool, PassError> {
    let mut any_change = false;
    let mut scans = 0usize;
    loop {
        scans += 1;
        let mut changed = false;
        'scan: for node in graph.live_nodes() {
            for pattern in patterns {
                match pattern.match_and_rewrite(graph, node)? {
                    Rewrite::Changed => {
                        trace!(pattern = pattern.name(), node = node.0, "rewrite applied");
                        changed = true;
                        any_change = true;
                        // The node list may be stale now; rescan.
                        break 'scan;
                    }
                    Rewrite::NoMatch => {}
                }
            }
        }
        if !changed {
            debug!(scans, any_change, "fixpoint reached");
            return Ok(any_change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DType, HlOp, NodeKind, Shape, TensorType};
    use tgc_span::Span;

    /// Folds `multiply` into `add` once per node, to exercise the
    /// driver's rescan-until-quiescent loop.
    struct MulToAdd;

    impl RewritePattern for MulToAdd {
        fn name(&self) -> &'static str {
            "mul-to-add"
        }

        fn match_and_rewrite(
            &self,
            graph: &mut Graph,
            node: NodeId,
        ) -> Result<Rewrite, PassError> {
            match &mut graph.node_mut(node).kind {
                NodeKind::Hl { op, .. } if *op == HlOp::Multiply => {
                    *op = HlOp::Add;
                    Ok(Rewrite::Changed)
                }
                _ => Ok(Rewrite::NoMatch),
            }
        }
    }

    #[test]
    fn test_driver_reaches_fixpoint() {
        let mut g = Graph::new();
        let ty = TensorType::new(Shape::new([4]), DType::Float32);
        let a = g.add_argument(ty.clone(), Span::DUMMY);
        let b = g.add_argument(ty.clone(), Span::DUMMY);
        let x = g.append_hl(HlOp::Multiply, [a, b], ty.clone(), Span::DUMMY);
        let y = g.append_hl(HlOp::Multiply, [x, b], ty.clone(), Span::DUMMY);
        g.set_return([y], Span::DUMMY);

        let changed = apply_patterns_greedily(&mut g, &[&MulToAdd]).unwrap();
        assert!(changed);

        // Second run: nothing left to do.
        let changed = apply_patterns_greedily(&mut g, &[&MulToAdd]).unwrap();
        assert!(!changed);

        for n in g.live_nodes() {
            if let NodeKind::Hl { op, .. } = &g.node(n).kind {
                assert_eq!(*op, HlOp::Add);
            }
        }
    }
}
