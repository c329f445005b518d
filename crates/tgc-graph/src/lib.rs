//! # TGC Graph IR
//!
//! This crate defines the tensor-program graph for the TGC middle end
//! and the rewrite passes that turn a device-agnostic operation graph
//! into a grid-dispatched, layout-explicit program.
//!
//! ## Pipeline Position
//!
//! ```text
//! Front end (op vocabulary: add, multiply, matmul, ...)
//!     |
//!     v
//! [Kernel Recognizer]   <- high-level ops become generic kernels (DPS)
//!     |
//!     v
//! [Dispatch Builder]    <- kernels wrapped in grid-parallel dispatches
//!     |
//!     v
//! [Layout Assigner]     <- explicit strides / memory space everywhere
//! [Boundary Delayout]   <- returned tensors stripped back to host form
//!     |
//!     v
//! Binary emission (`tgc-binary`)
//! ```
//!
//! ## Structure
//!
//! The graph is an arena: nodes, values and layouts live in
//! index-addressed tables and are referred to by [`NodeId`],
//! [`ValueId`] and [`LayoutId`] handles. Execution order is explicit —
//! the root region and each dispatch region hold an ordered node list
//! that rewrites splice. Values are SSA-style: produced once, consumed
//! anywhere, with one sanctioned in-place mutation (layout attachment
//! during the Layout Assigner, guarded by [`Graph::attach_layout`]).
//!
//! ## Main Types
//!
//! - [`Graph`]: the arena plus the root region
//! - [`NodeKind`]: operations ([`Kernel`], [`Dispatch`], conversions)
//! - [`TensorType`], [`Layout`], [`MemRefDesc`]: the type system
//! - [`PassError`]: fatal pipeline failures
//!
//! ## See Also
//!
//! - [`affine`] for index-space maps and operand constraints
//! - [`pipeline`] for pass ordering

#![warn(missing_docs)]

pub mod affine;
pub mod dispatch;
pub mod layout;
pub mod pipeline;
pub mod recognize;
pub mod rewrite;

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tgc_index::{define_index, IndexVec};
use tgc_span::Span;

use crate::affine::{IndexMap, IteratorRole, OperandConstraint};

define_index! {
    /// Handle of a node in the graph arena.
    pub struct NodeId;

    /// Handle of an SSA value in the graph arena.
    pub struct ValueId;

    /// Handle of an interned layout.
    ///
    /// Layout identity is the handle, not the content: propagating a
    /// layout shares the handle, while synthesizing the same content
    /// twice allocates two handles. The binary emitter keys its
    /// dedup cache on this.
    pub struct LayoutId;
}

/// Tensor element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point.
    Float32,
    /// 16-bit floating point.
    Float16,
    /// Brain floating point.
    BFloat16,
    /// 32-bit unsigned integer.
    UInt32,
    /// 16-bit unsigned integer.
    UInt16,
    /// 8-bit unsigned integer.
    UInt8,
}

impl DType {
    /// Size in bytes of one element.
    #[must_use]
    pub const fn size_bytes(self) -> u64 {
        match self {
            Self::Float32 | Self::UInt32 => 4,
            Self::Float16 | Self::BFloat16 | Self::UInt16 => 2,
            Self::UInt8 => 1,
        }
    }

    /// Short type name used in rendered types (`f32`, `u16`, ...).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "f32",
            Self::Float16 => "f16",
            Self::BFloat16 => "bf16",
            Self::UInt32 => "u32",
            Self::UInt16 => "u16",
            Self::UInt8 => "u8",
        }
    }
}

/// Tensor shape: ordered dimension extents, outermost first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(SmallVec<[i64; 4]>);

impl Shape {
    /// Create a shape from dimension extents.
    #[must_use]
    pub fn new(dims: impl IntoIterator<Item = i64>) -> Self {
        Self(dims.into_iter().collect())
    }

    /// The rank (number of dimensions).
    #[must_use]
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// The dimension extents.
    #[must_use]
    pub fn dims(&self) -> &[i64] {
        &self.0
    }

    /// Total number of elements.
    #[must_use]
    pub fn num_elements(&self) -> i64 {
        self.0.iter().product()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for d in &self.0 {
            write!(f, "{d}x")?;
        }
        Ok(())
    }
}

/// Canonical row-major strides for a shape: `stride[i]` is the product
/// of all inner extents, innermost stride 1.
///
/// No alignment padding is applied — rounding the innermost rows up to
/// a hardware word is a later pass's responsibility and deliberately
/// not done here.
#[must_use]
pub fn canonical_strides(shape: &Shape) -> SmallVec<[i64; 4]> {
    let mut strides: SmallVec<[i64; 4]> = SmallVec::with_capacity(shape.rank());
    let mut stride = 1i64;
    for extent in shape.dims().iter().rev() {
        strides.push(stride);
        stride *= extent;
    }
    strides.reverse();
    strides
}

/// A 2-D arrangement of compute units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grid {
    /// Number of rows of compute units.
    pub rows: u32,
    /// Number of columns of compute units.
    pub cols: u32,
}

impl Grid {
    /// The single-unit grid.
    pub const UNIT: Self = Self { rows: 1, cols: 1 };

    /// Create a grid.
    #[must_use]
    pub const fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    /// Total number of compute units.
    #[must_use]
    pub const fn units(self) -> u64 {
        self.rows as u64 * self.cols as u64
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::UNIT
    }
}

impl std::fmt::Display for Grid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Fill value observed on out-of-bounds reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OobVal {
    /// Unspecified contents.
    Undef,
    /// Zero fill.
    Zero,
    /// One fill.
    One,
    /// Positive infinity fill.
    Inf,
    /// Negative infinity fill.
    NegInf,
}

/// Physical memory space a tensor lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    /// Host system memory.
    System,
    /// Host memory-mapped I/O (pinned).
    SystemMmio,
    /// Device DRAM.
    DeviceDram,
    /// Device-local L1.
    DeviceL1,
}

/// A 2-D tile extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileShape {
    /// Tile height in elements.
    pub height: u32,
    /// Tile width in elements.
    pub width: u32,
}

/// Physical buffer description carried inside a [`Layout`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemRefDesc {
    /// Buffer shape.
    pub shape: Shape,
    /// Tile extent when the buffer is tilized, `None` for flat storage.
    pub tile: Option<TileShape>,
    /// Element type.
    pub dtype: DType,
    /// Memory space the buffer lives in.
    pub space: MemorySpace,
}

/// Physical realization descriptor for a tensor value.
///
/// Attached to at most one point in a value's life: re-attachment is a
/// pipeline bug and rejected by [`Graph::attach_layout`]. Moving a
/// tensor between layouts goes through a [`NodeKind::ToLayout`]
/// conversion node instead.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    /// Per-dimension strides, outermost first, innermost stride 1.
    pub strides: SmallVec<[i64; 4]>,
    /// Out-of-bounds fill policy.
    pub oob_val: OobVal,
    /// Grid the tensor is distributed across.
    pub grid: Grid,
    /// Physical buffer description.
    pub memref: MemRefDesc,
}

/// A tensor value's type: logical shape, element type, and an optional
/// physical layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    /// Logical shape.
    pub shape: Shape,
    /// Element type.
    pub dtype: DType,
    /// Physical layout, once assigned.
    pub layout: Option<LayoutId>,
}

impl TensorType {
    /// Create a layout-less tensor type.
    #[must_use]
    pub fn new(shape: Shape, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            layout: None,
        }
    }

    /// Byte size of a dense tensor of this type.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.shape.num_elements() as u64 * self.dtype.size_bytes()
    }
}

/// The high-level operation vocabulary handed over by the front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HlOp {
    /// Elementwise addition.
    Add,
    /// Elementwise multiplication.
    Multiply,
    /// (Batched) matrix multiplication.
    Matmul,
    /// Dimension permutation. No kernel form on this target yet; the
    /// recognizer leaves it untouched and emission rejects it.
    Transpose,
}

impl HlOp {
    /// The operation's printed name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Multiply => "multiply",
            Self::Matmul => "matmul",
            Self::Transpose => "transpose",
        }
    }
}

/// Kernel execution classes. Drives index-space derivation and operand
/// constraints in the Dispatch Builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKind {
    /// Pointwise over matching-rank operands.
    Eltwise,
    /// Contraction over an added inner dimension.
    Matmul,
}

impl KernelKind {
    /// The kind's printed name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Eltwise => "eltwise",
            Self::Matmul => "matmul",
        }
    }
}

/// A generic computational node in destination-passing style: inputs
/// are read, the output buffer is written in place, and the result
/// value aliases that buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    /// Kernel name (for example `"multiply"`).
    pub name: String,
    /// Execution class.
    pub kind: KernelKind,
    /// Input operands, in order.
    pub inputs: SmallVec<[ValueId; 2]>,
    /// The explicit output buffer.
    pub output: ValueId,
}

impl Kernel {
    /// All operands in order: inputs followed by the output buffer.
    pub fn operands(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs.iter().copied().chain(std::iter::once(self.output))
    }

    /// Number of operands including the output.
    #[must_use]
    pub fn num_operands(&self) -> usize {
        self.inputs.len() + 1
    }
}

/// A grid-parallel wrapper around one kernel.
///
/// Carries one index map and one tiling constraint per operand and one
/// iterator role per iteration dimension. Its nested region has one
/// parameter per operand; the region body is the cloned kernel
/// followed by a [`NodeKind::Yield`] of the clone's result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    /// Operands (kernel inputs followed by the output buffer).
    pub operands: SmallVec<[ValueId; 4]>,
    /// Target compute grid.
    pub grid: Grid,
    /// One affine index map per operand.
    pub index_maps: Vec<IndexMap>,
    /// One role per iteration dimension.
    pub iterator_roles: Vec<IteratorRole>,
    /// One tiling constraint per operand.
    pub constraints: Vec<OperandConstraint>,
    /// Region parameters, one per operand, typed like the operand.
    pub params: Vec<ValueId>,
    /// Region body in execution order; the last node is the yield.
    pub body: Vec<NodeId>,
}

/// The operation a node performs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// An inline constant tensor.
    Constant {
        /// Element payload, row-major.
        data: Vec<f32>,
    },
    /// A high-level operation from the front-end vocabulary.
    Hl {
        /// The operation.
        op: HlOp,
        /// Operands in order.
        operands: SmallVec<[ValueId; 2]>,
    },
    /// An uninitialized buffer allocation (DPS placeholder).
    Empty,
    /// A generic kernel invocation.
    Kernel(Kernel),
    /// A grid-parallel dispatch of one kernel.
    Dispatch(Dispatch),
    /// A layout conversion moving a tensor into an explicit buffer.
    ToLayout {
        /// The tensor being converted.
        input: ValueId,
        /// The destination buffer carrying the target layout.
        buffer: ValueId,
        /// Whether the tensor is moving toward the device (`true`) or
        /// back to the host (`false`). Informational only.
        device_bound: bool,
    },
    /// Terminator of a dispatch region.
    Yield {
        /// The produced value.
        value: ValueId,
    },
    /// Terminator of the root region.
    Return {
        /// The program's result values.
        operands: SmallVec<[ValueId; 2]>,
    },
}

/// Where a node sits: the root region or a dispatch's nested region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Enclosing {
    /// The root region of the graph.
    Root,
    /// Inside the region of the given dispatch node.
    Dispatch(NodeId),
}

/// A node: an operation, its source span, its enclosing region, and
/// its result value (absent for terminators).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// The operation.
    pub kind: NodeKind,
    /// Source span of the originating front-end operation.
    pub span: Span,
    /// Enclosing region.
    pub parent: Enclosing,
    /// The produced value, if any.
    pub result: Option<ValueId>,
}

/// Who defines a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueOrigin {
    /// Result of a node.
    Node(NodeId),
    /// Graph input argument at the given position.
    Argument(usize),
    /// Region parameter of a dispatch at the given operand position.
    Param {
        /// The dispatch node owning the region.
        dispatch: NodeId,
        /// The operand position mirrored by this parameter.
        index: usize,
    },
}

/// An SSA value: its type, definition site, and span.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    /// The value's tensor type.
    pub ty: TensorType,
    /// Definition site.
    pub origin: ValueOrigin,
    /// Source span.
    pub span: Span,
}

/// Fatal pipeline failures. No-match is not represented here — it is a
/// normal [`rewrite::Rewrite::NoMatch`] result that drives fixpoint
/// termination.
#[derive(Clone, Debug, thiserror::Error)]
pub enum PassError {
    /// Elementwise kernel operands do not share one rank.
    #[error("operand rank mismatch in {kind} kernel: {node}")]
    RankMismatch {
        /// Kernel kind name.
        kind: &'static str,
        /// Rendered offending node.
        node: String,
    },

    /// A matmul operand has rank below 2.
    #[error("matmul requires operand rank >= 2, got {rank}: {node}")]
    MatmulRank {
        /// The offending rank.
        rank: usize,
        /// Rendered offending node.
        node: String,
    },

    /// A layout was attached to an already laid-out value.
    #[error("layout re-attached to %{value}: {node}")]
    LayoutReattach {
        /// The value's handle.
        value: u32,
        /// Rendered producer of the value.
        node: String,
    },

    /// A pipeline stage that exists as a boundary marker only.
    #[error("stage `{stage}` is not yet supported")]
    Unimplemented {
        /// Stage name.
        stage: &'static str,
    },
}

/// The tensor-program graph: arenas for values, nodes and layouts,
/// the input arguments, and the ordered root region.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    values: IndexVec<ValueId, Value>,
    nodes: IndexVec<NodeId, Node>,
    layouts: IndexVec<LayoutId, Layout>,
    arguments: Vec<ValueId>,
    body: Vec<NodeId>,
}

impl Graph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- construction (front-end surface) ----

    /// Declare a graph input.
    pub fn add_argument(&mut self, ty: TensorType, span: Span) -> ValueId {
        let index = self.arguments.len();
        let v = self.values.push(Value {
            ty,
            origin: ValueOrigin::Argument(index),
            span,
        });
        self.arguments.push(v);
        v
    }

    /// Append an inline constant to the root region.
    pub fn append_constant(&mut self, data: Vec<f32>, ty: TensorType, span: Span) -> ValueId {
        self.append_root(NodeKind::Constant { data }, Some(ty), span)
            .1
            .expect("constant produces a value")
    }

    /// Append a high-level operation to the root region.
    pub fn append_hl(
        &mut self,
        op: HlOp,
        operands: impl IntoIterator<Item = ValueId>,
        ty: TensorType,
        span: Span,
    ) -> ValueId {
        let operands: SmallVec<[ValueId; 2]> = operands.into_iter().collect();
        self.append_root(NodeKind::Hl { op, operands }, Some(ty), span)
            .1
            .expect("hl op produces a value")
    }

    /// Append an uninitialized buffer allocation to the root region.
    pub fn append_empty(&mut self, ty: TensorType, span: Span) -> ValueId {
        self.append_root(NodeKind::Empty, Some(ty), span)
            .1
            .expect("empty produces a value")
    }

    /// Terminate the root region, declaring the program results.
    pub fn set_return(&mut self, operands: impl IntoIterator<Item = ValueId>, span: Span) {
        let operands: SmallVec<[ValueId; 2]> = operands.into_iter().collect();
        self.append_root(NodeKind::Return { operands }, None, span);
    }

    fn append_root(
        &mut self,
        kind: NodeKind,
        result_ty: Option<TensorType>,
        span: Span,
    ) -> (NodeId, Option<ValueId>) {
        let node = self.new_node(kind, result_ty, span, Enclosing::Root);
        self.body.push(node);
        (node, self.nodes[node].result)
    }

    /// Allocate a node in the arena without placing it in any region.
    /// Used by rewrites, which splice the node in explicitly.
    pub(crate) fn new_node(
        &mut self,
        kind: NodeKind,
        result_ty: Option<TensorType>,
        span: Span,
        parent: Enclosing,
    ) -> NodeId {
        let node = self.nodes.next_index();
        let result = result_ty.map(|ty| {
            self.values.push(Value {
                ty,
                origin: ValueOrigin::Node(node),
                span,
            })
        });
        self.nodes.push(Node {
            kind,
            span,
            parent,
            result,
        })
    }

    /// Allocate a region parameter value for a dispatch.
    pub(crate) fn new_param(
        &mut self,
        dispatch: NodeId,
        index: usize,
        ty: TensorType,
        span: Span,
    ) -> ValueId {
        self.values.push(Value {
            ty,
            origin: ValueOrigin::Param { dispatch, index },
            span,
        })
    }

    /// Intern a layout, returning its identity handle. No content
    /// dedup happens here: two calls with equal content return two
    /// handles, and the emitter treats them as distinct descriptors.
    pub fn intern_layout(&mut self, layout: Layout) -> LayoutId {
        self.layouts.push(layout)
    }

    // ---- access ----

    /// The graph's input values, in declaration order.
    #[must_use]
    pub fn arguments(&self) -> &[ValueId] {
        &self.arguments
    }

    /// The root region's nodes in execution order.
    #[must_use]
    pub fn body(&self) -> &[NodeId] {
        &self.body
    }

    /// A node by handle.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// A value by handle.
    #[must_use]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    /// A layout by handle.
    #[must_use]
    pub fn layout(&self, id: LayoutId) -> &Layout {
        &self.layouts[id]
    }

    /// A node's result value. Panics on terminators, which have none.
    #[must_use]
    pub fn result_of(&self, id: NodeId) -> ValueId {
        self.nodes[id].result.expect("node has a result")
    }

    /// All live nodes in pre-order: root region order, with each
    /// dispatch's region nodes following the dispatch itself.
    #[must_use]
    pub fn live_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.body.len());
        for &n in &self.body {
            out.push(n);
            if let NodeKind::Dispatch(d) = &self.nodes[n].kind {
                out.extend(d.body.iter().copied());
            }
        }
        out
    }

    // ---- mutation (pass surface) ----

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Rewrite a value's type in place. Only passes do this, and only
    /// for values scoped to a dispatch they are rewriting.
    pub(crate) fn set_value_type(&mut self, id: ValueId, ty: TensorType) {
        self.values[id].ty = ty;
    }

    /// Attach a layout to a not-yet-laid-out value.
    ///
    /// # Errors
    ///
    /// [`PassError::LayoutReattach`] if the value already carries a
    /// layout — that is a pipeline bug, not a recoverable condition.
    pub fn attach_layout(&mut self, id: ValueId, layout: LayoutId) -> Result<(), PassError> {
        if self.values[id].ty.layout.is_some() {
            return Err(PassError::LayoutReattach {
                value: id.0,
                node: self.value_debug_string(id),
            });
        }
        self.values[id].ty.layout = Some(layout);
        Ok(())
    }

    /// Splice `node` into its parent region immediately before
    /// `anchor`. Both must share the same parent region.
    pub(crate) fn insert_before(&mut self, anchor: NodeId, node: NodeId) {
        let parent = self.nodes[anchor].parent;
        debug_assert_eq!(parent, self.nodes[node].parent);
        let body = self.region_body_mut(parent);
        let pos = body
            .iter()
            .position(|&n| n == anchor)
            .expect("anchor is in its region body");
        body.insert(pos, node);
    }

    /// Remove a node from its region body. The arena entry stays (the
    /// handle remains valid) but the node no longer executes.
    pub(crate) fn remove_node(&mut self, node: NodeId) {
        let parent = self.nodes[node].parent;
        let body = self.region_body_mut(parent);
        body.retain(|&n| n != node);
    }

    fn region_body_mut(&mut self, parent: Enclosing) -> &mut Vec<NodeId> {
        match parent {
            Enclosing::Root => &mut self.body,
            Enclosing::Dispatch(d) => match &mut self.nodes[d].kind {
                NodeKind::Dispatch(dd) => &mut dd.body,
                _ => unreachable!("enclosing node is a dispatch"),
            },
        }
    }

    /// Replace every use of `old` with `new` across all live nodes.
    pub(crate) fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for id in self.live_nodes() {
            self.replace_uses_in(id, old, new);
        }
    }

    fn replace_uses_in(&mut self, node: NodeId, old: ValueId, new: ValueId) {
        let sub = |v: &mut ValueId| {
            if *v == old {
                *v = new;
            }
        };
        match &mut self.nodes[node].kind {
            NodeKind::Constant { .. } | NodeKind::Empty => {}
            NodeKind::Hl { operands, .. } => operands.iter_mut().for_each(sub),
            NodeKind::Kernel(k) => {
                k.inputs.iter_mut().for_each(sub);
                sub(&mut k.output);
            }
            NodeKind::Dispatch(d) => d.operands.iter_mut().for_each(sub),
            NodeKind::ToLayout { input, buffer, .. } => {
                sub(input);
                sub(buffer);
            }
            NodeKind::Yield { value } => sub(value),
            NodeKind::Return { operands } => operands.iter_mut().for_each(sub),
        }
    }

    /// Whether any live node other than `except` uses `value`.
    #[must_use]
    pub fn has_uses_besides(&self, value: ValueId, except: NodeId) -> bool {
        self.live_nodes()
            .into_iter()
            .filter(|&n| n != except)
            .any(|n| self.node_uses(n, value))
    }

    fn node_uses(&self, node: NodeId, value: ValueId) -> bool {
        match &self.nodes[node].kind {
            NodeKind::Constant { .. } | NodeKind::Empty => false,
            NodeKind::Hl { operands, .. } => operands.contains(&value),
            NodeKind::Kernel(k) => k.inputs.contains(&value) || k.output == value,
            NodeKind::Dispatch(d) => d.operands.contains(&value),
            NodeKind::ToLayout { input, buffer, .. } => *input == value || *buffer == value,
            NodeKind::Yield { value: v } => *v == value,
            NodeKind::Return { operands } => operands.contains(&value),
        }
    }

    // ---- rendering ----

    /// Render a value's type, e.g. `4x4xf32` or `8x8xf32/layout2`.
    #[must_use]
    pub fn type_string(&self, ty: &TensorType) -> String {
        let mut s = format!("{}{}", ty.shape, ty.dtype.name());
        if let Some(lid) = ty.layout {
            let _ = write!(s, "/layout{lid}");
        }
        s
    }

    fn value_debug_string(&self, id: ValueId) -> String {
        match self.values[id].origin {
            ValueOrigin::Node(n) => self.node_debug_string(n),
            ValueOrigin::Argument(i) => {
                format!(
                    "%{id} = argument {i} : {} {}",
                    self.type_string(&self.values[id].ty),
                    self.values[id].span
                )
            }
            ValueOrigin::Param { dispatch, index } => {
                format!(
                    "%{id} = param {index} of %{} : {} {}",
                    self.result_of(dispatch).0,
                    self.type_string(&self.values[id].ty),
                    self.values[id].span
                )
            }
        }
    }

    /// Render one node as a single line for diagnostics and emission
    /// debug strings. Region bodies are skipped and large constant
    /// payloads elided; the source span is always retained.
    #[must_use]
    pub fn node_debug_string(&self, id: NodeId) -> String {
        const ELIDE_ABOVE: usize = 16;

        let node = &self.nodes[id];
        let mut s = String::new();
        if let Some(r) = node.result {
            let _ = write!(s, "%{r} = ");
        }
        match &node.kind {
            NodeKind::Constant { data } => {
                if data.len() > ELIDE_ABOVE {
                    let _ = write!(s, "constant dense<...{} elements...>", data.len());
                } else {
                    let _ = write!(s, "constant dense<{data:?}>");
                }
            }
            NodeKind::Hl { op, operands } => {
                let _ = write!(s, "hl.{}{}", op.name(), self.operand_list(operands));
            }
            NodeKind::Empty => {
                let _ = write!(s, "empty()");
            }
            NodeKind::Kernel(k) => {
                let _ = write!(
                    s,
                    "kernel \"{}\" kind={} ins{} outs(%{})",
                    k.name,
                    k.kind.name(),
                    self.operand_list(&k.inputs),
                    k.output
                );
            }
            NodeKind::Dispatch(d) => {
                let maps: Vec<String> = d.index_maps.iter().map(ToString::to_string).collect();
                let roles: Vec<&str> = d.iterator_roles.iter().map(|r| r.name()).collect();
                let constraints: Vec<&str> = d.constraints.iter().map(|c| c.name()).collect();
                let _ = write!(
                    s,
                    "dispatch grid={}{} maps=[{}] roles={roles:?} constraints={constraints:?}",
                    d.grid,
                    self.operand_list(&d.operands),
                    maps.join(", "),
                );
            }
            NodeKind::ToLayout {
                input,
                buffer,
                device_bound,
            } => {
                let dir = if *device_bound { "device" } else { "host" };
                let _ = write!(s, "to_layout %{input} into %{buffer} {dir}");
            }
            NodeKind::Yield { value } => {
                let _ = write!(s, "yield %{value}");
            }
            NodeKind::Return { operands } => {
                let _ = write!(s, "return{}", self.operand_list(operands));
            }
        }
        if let Some(r) = node.result {
            let _ = write!(s, " : {}", self.type_string(&self.values[r].ty));
        }
        let _ = write!(s, " {}", node.span);
        s
    }

    fn operand_list(&self, operands: &[ValueId]) -> String {
        let items: Vec<String> = operands.iter().map(|v| format!("%{v}")).collect();
        format!("({})", items.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_ty(dims: &[i64]) -> TensorType {
        TensorType::new(Shape::new(dims.iter().copied()), DType::Float32)
    }

    #[test]
    fn test_canonical_strides_row_major() {
        let shape = Shape::new([2, 3, 4]);
        let strides = canonical_strides(&shape);
        assert_eq!(strides.as_slice(), &[12, 4, 1]);

        // stride[i] == product(shape[i+1:]) for all i.
        for (i, &s) in strides.iter().enumerate() {
            let expect: i64 = shape.dims()[i + 1..].iter().product();
            assert_eq!(s, expect);
        }
    }

    #[test]
    fn test_canonical_strides_rank_zero() {
        assert!(canonical_strides(&Shape::new([])).is_empty());
    }

    #[test]
    fn test_layout_identity_not_content() {
        let mut g = Graph::new();
        let layout = Layout {
            strides: canonical_strides(&Shape::new([4, 4])),
            oob_val: OobVal::Undef,
            grid: Grid::UNIT,
            memref: MemRefDesc {
                shape: Shape::new([4, 4]),
                tile: None,
                dtype: DType::Float32,
                space: MemorySpace::System,
            },
        };
        let a = g.intern_layout(layout.clone());
        let b = g.intern_layout(layout);
        assert_ne!(a, b);
        assert_eq!(g.layout(a), g.layout(b));
    }

    #[test]
    fn test_attach_layout_rejects_reattachment() {
        let mut g = Graph::new();
        let v = g.add_argument(f32_ty(&[4, 4]), Span::DUMMY);
        let lid = g.intern_layout(Layout {
            strides: canonical_strides(&Shape::new([4, 4])),
            oob_val: OobVal::Undef,
            grid: Grid::UNIT,
            memref: MemRefDesc {
                shape: Shape::new([4, 4]),
                tile: None,
                dtype: DType::Float32,
                space: MemorySpace::System,
            },
        });

        assert!(g.attach_layout(v, lid).is_ok());
        let err = g.attach_layout(v, lid).unwrap_err();
        assert!(matches!(err, PassError::LayoutReattach { .. }));
    }

    #[test]
    fn test_replace_all_uses() {
        let mut g = Graph::new();
        let a = g.add_argument(f32_ty(&[4]), Span::DUMMY);
        let b = g.add_argument(f32_ty(&[4]), Span::DUMMY);
        let sum = g.append_hl(HlOp::Add, [a, b], f32_ty(&[4]), Span::DUMMY);
        g.set_return([sum], Span::DUMMY);

        let c = g.add_argument(f32_ty(&[4]), Span::DUMMY);
        g.replace_all_uses(a, c);

        let hl = g.body()[0];
        match &g.node(hl).kind {
            NodeKind::Hl { operands, .. } => assert_eq!(operands.as_slice(), &[c, b]),
            other => panic!("expected hl node, got {other:?}"),
        }
    }

    #[test]
    fn test_constant_debug_string_elides_large_payloads() {
        let mut g = Graph::new();
        let small = g.append_constant(vec![1.0, 2.0], f32_ty(&[2]), Span::from_raw(1, 5));
        let big = g.append_constant(vec![0.0; 64], f32_ty(&[64]), Span::DUMMY);

        let small_node = match g.value(small).origin {
            ValueOrigin::Node(n) => n,
            _ => unreachable!(),
        };
        let big_node = match g.value(big).origin {
            ValueOrigin::Node(n) => n,
            _ => unreachable!(),
        };

        assert!(g.node_debug_string(small_node).contains("1.0"));
        assert!(g.node_debug_string(small_node).contains("loc(1..5)"));
        assert!(g.node_debug_string(big_node).contains("...64 elements..."));
    }
}
