//! # TGC Binary Emission
//!
//! Serializes a fully-lowered [`tgc_graph::Graph`] into a flat,
//! device-loadable program image: a descriptor pool, a table of
//! tensor references, and a command stream.
//!
//! ## Layout
//!
//! ```text
//! +--------+---------+------------------+----------+----------------+
//! | header | pool    | tensor refs      | commands | inputs/outputs |
//! +--------+---------+------------------+----------+----------------+
//! ```
//!
//! The pool holds nested descriptors (memory -> layout -> tensor),
//! each written once per *identity*: the cache is keyed on the
//! graph's stable handles, so a layout propagated through the
//! pipeline serializes to one pooled record no matter how many
//! tensors reference it, while two independently-synthesized layouts
//! serialize twice even when their bytes match.
//!
//! Commands carry a rendered one-line debug string of the node that
//! produced them, with its source span, so a device-side failure can
//! be traced back to the front end.
//!
//! ## Entry Point
//!
//! [`emit::emit_program`] walks the root region once, front to back.
//! Buffer addresses come from an [`emit::AddressAllocator`] supplied
//! by the caller; [`emit::BumpAllocator`] is the trivial one.

#![warn(missing_docs)]

pub mod cache;
pub mod emit;
pub mod format;

pub use emit::{emit_program, AddressAllocator, BumpAllocator, EmitError, Program};
