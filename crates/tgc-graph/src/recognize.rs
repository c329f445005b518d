//! Kernel Recognizer.
//!
//! Rewrites each supported high-level operation into a generic
//! [`Kernel`] in destination-passing style: a fresh uninitialized
//! buffer matching the declared result type is allocated, and the
//! kernel reads the original operands and writes that buffer.
//!
//! Vocabulary members with no kernel form on this target (currently
//! `transpose`) simply fail the match and stay in the graph; emission
//! rejects them later if nothing else consumes them. Re-running the
//! pass is a no-op — the source pattern is the high-level op, never
//! the kernel it produced.

use smallvec::SmallVec;

use crate::rewrite::{apply_patterns_greedily, Rewrite, RewritePattern};
use crate::{Graph, HlOp, Kernel, KernelKind, NodeId, NodeKind, PassError, ValueId};

/// Kernel name and execution class for a recognized high-level op, or
/// `None` when the op has no kernel form.
fn kernel_tag(op: HlOp) -> Option<(&'static str, KernelKind)> {
    match op {
        HlOp::Add => Some(("add", KernelKind::Eltwise)),
        HlOp::Multiply => Some(("multiply", KernelKind::Eltwise)),
        HlOp::Matmul => Some(("matmul", KernelKind::Matmul)),
        HlOp::Transpose => None,
    }
}

struct HlToKernel;

impl RewritePattern for HlToKernel {
    fn name(&self) -> &'static str {
        "hl-to-kernel"
    }

    fn match_and_rewrite(&self, graph: &mut Graph, node: NodeId) -> Result<Rewrite, PassError> {
        let (op, operands) = match &graph.node(node).kind {
            NodeKind::Hl { op, operands } => (*op, operands.clone()),
            _ => return Ok(Rewrite::NoMatch),
        };
        let Some((name, kind)) = kernel_tag(op) else {
            return Ok(Rewrite::NoMatch);
        };

        let span = graph.node(node).span;
        let parent = graph.node(node).parent;
        let result = graph.result_of(node);
        let result_ty = graph.value(result).ty.clone();

        // Fresh output buffer in destination-passing style.
        let empty = graph.new_node(NodeKind::Empty, Some(result_ty.clone()), span, parent);
        let output = graph.result_of(empty);

        let inputs: SmallVec<[ValueId; 2]> = operands;
        let kernel = graph.new_node(
            NodeKind::Kernel(Kernel {
                name: name.to_string(),
                kind,
                inputs,
                output,
            }),
            Some(result_ty),
            span,
            parent,
        );

        graph.insert_before(node, empty);
        graph.insert_before(node, kernel);
        let kernel_result = graph.result_of(kernel);
        graph.replace_all_uses(result, kernel_result);
        graph.remove_node(node);
        Ok(Rewrite::Changed)
    }
}

/// Run the Kernel Recognizer to fixpoint. Returns whether anything
/// was rewritten.
///
/// # Errors
///
/// Fatal [`PassError`]s from the rewrite driver; recognition itself
/// never fails, it only declines.
pub fn recognize_kernels(graph: &mut Graph) -> Result<bool, PassError> {
    apply_patterns_greedily(graph, &[&HlToKernel])
}
