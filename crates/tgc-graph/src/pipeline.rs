//! Fixed pass ordering for the middle end.
//!
//! ```text
//! recognize_kernels -> build_dispatches -> assign_layouts
//! ```
//!
//! Each pass runs to its own fixpoint before the next starts; the
//! ordering is load-bearing (dispatches only wrap kernels, layouts
//! only attach to dispatch operands). Two further stages, sharding and
//! device lowering, are declared here but rejected with
//! [`PassError::Unimplemented`] so that callers hit a typed error
//! instead of silently skipping them.

use tracing::info;

use crate::dispatch::build_dispatches;
use crate::layout::assign_layouts;
use crate::recognize::recognize_kernels;
use crate::{Graph, PassError};

/// Run the full middle-end pipeline over `graph`.
///
/// # Errors
///
/// Propagates the first fatal [`PassError`] from any pass.
pub fn run_pipeline(graph: &mut Graph) -> Result<(), PassError> {
    let recognized = recognize_kernels(graph)?;
    info!(changed = recognized, "kernel recognition done");
    let dispatched = build_dispatches(graph)?;
    info!(changed = dispatched, "dispatch building done");
    let laid_out = assign_layouts(graph)?;
    info!(changed = laid_out, "layout assignment done");
    Ok(())
}

/// Split dispatches across a multi-unit grid. Not supported yet.
///
/// # Errors
///
/// Always [`PassError::Unimplemented`].
pub fn shard(_graph: &mut Graph) -> Result<(), PassError> {
    Err(PassError::Unimplemented { stage: "shard" })
}

/// Lower dispatch regions to device-executable form. Not supported
/// yet.
///
/// # Errors
///
/// Always [`PassError::Unimplemented`].
pub fn lower_to_device(_graph: &mut Graph) -> Result<(), PassError> {
    Err(PassError::Unimplemented { stage: "lower" })
}
