//! Program emission: one forward walk over the root region.
//!
//! Every tensor value that reaches the device gets a `TensorRef` (a
//! small id, an address from the caller's allocator, a byte size, and
//! a pooled type descriptor). Conversion and dispatch nodes become
//! commands; `empty` and `constant` nodes only materialize refs. A
//! node's result value aliases its output buffer's ref — destination
//! passing means the result *is* the buffer, and the ref table
//! reflects that.
//!
//! Ref ids are allocated by the session, monotonically from zero, so
//! two emissions of the same graph produce identical images and two
//! concurrent emissions cannot interfere.

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use tgc_graph::{Graph, NodeKind, ValueId};

use crate::cache::{CacheKey, ObjectCache};
use crate::format::{
    write_convert_layout, write_launch_dispatch, write_layout_desc, write_memory_desc,
    write_tensor_desc, write_tensor_ref, ByteWriter, PoolWriter, MAGIC, NULL_LAYOUT, VERSION,
};

/// Supplies device addresses for tensor buffers. Implemented by the
/// caller; emission itself has no placement policy.
pub trait AddressAllocator {
    /// Reserve `size` bytes, returning the buffer's base address.
    fn allocate(&mut self, size: u64) -> u64;
}

/// The trivial allocator: a bump pointer from a base address.
#[derive(Debug)]
pub struct BumpAllocator {
    next: u64,
}

impl BumpAllocator {
    /// Create an allocator starting at `base`.
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { next: base }
    }
}

impl AddressAllocator for BumpAllocator {
    fn allocate(&mut self, size: u64) -> u64 {
        let addr = self.next;
        self.next += size;
        addr
    }
}

/// Fatal emission failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EmitError {
    /// A node survived to emission that no pass lowered.
    #[error("cannot emit unlowered operation: {node}")]
    UnloweredOp {
        /// Rendered offending node.
        node: String,
    },
}

/// Descriptor and command counts of one emission, for callers that
/// want to assert on dedup behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmitReport {
    /// Memory-buffer records written to the pool.
    pub memory_descs: usize,
    /// Layout records written to the pool.
    pub layout_descs: usize,
    /// Tensor-type records written to the pool.
    pub tensor_descs: usize,
    /// Tensor references materialized.
    pub tensor_refs: usize,
    /// Commands in the stream.
    pub commands: usize,
}

/// A serialized program image.
#[derive(Clone, Debug)]
pub struct Program {
    /// The complete image.
    pub bytes: Vec<u8>,
    /// Ref ids of the program's input tensors, in argument order.
    pub inputs: Vec<u32>,
    /// Ref ids of the program's output tensors, in return order.
    pub outputs: Vec<u32>,
    /// What was written.
    pub report: EmitReport,
}

struct Emitter<'a> {
    graph: &'a Graph,
    allocator: &'a mut dyn AddressAllocator,
    pool: PoolWriter,
    refs: ByteWriter,
    commands: ByteWriter,
    cache: ObjectCache,
    value_refs: FxHashMap<ValueId, u32>,
    next_ref_id: u32,
    report: EmitReport,
}

impl<'a> Emitter<'a> {
    fn new(graph: &'a Graph, allocator: &'a mut dyn AddressAllocator) -> Self {
        Self {
            graph,
            allocator,
            pool: PoolWriter::new(),
            refs: ByteWriter::new(),
            commands: ByteWriter::new(),
            cache: ObjectCache::new(),
            value_refs: FxHashMap::default(),
            next_ref_id: 0,
            report: EmitReport::default(),
        }
    }

    fn memory_desc(&mut self, lid: tgc_graph::LayoutId) -> u32 {
        if let Some(off) = self.cache.get(CacheKey::Memory(lid)) {
            return off;
        }
        let graph = self.graph;
        let off = write_memory_desc(&mut self.pool, &graph.layout(lid).memref);
        self.cache.insert(CacheKey::Memory(lid), off);
        self.report.memory_descs += 1;
        off
    }

    fn layout_desc(&mut self, lid: tgc_graph::LayoutId) -> u32 {
        if let Some(off) = self.cache.get(CacheKey::Layout(lid)) {
            return off;
        }
        let memory_off = self.memory_desc(lid);
        let graph = self.graph;
        let off = write_layout_desc(&mut self.pool, graph.layout(lid), memory_off);
        self.cache.insert(CacheKey::Layout(lid), off);
        self.report.layout_descs += 1;
        off
    }

    fn tensor_desc(&mut self, value: ValueId) -> u32 {
        if let Some(off) = self.cache.get(CacheKey::Tensor(value)) {
            return off;
        }
        let layout_off = match self.graph.value(value).ty.layout {
            Some(lid) => self.layout_desc(lid),
            None => NULL_LAYOUT,
        };
        let graph = self.graph;
        let off = write_tensor_desc(&mut self.pool, &graph.value(value).ty, layout_off);
        self.cache.insert(CacheKey::Tensor(value), off);
        self.report.tensor_descs += 1;
        off
    }

    /// The ref id for a value, materializing the ref (and its nested
    /// descriptors) on first sight.
    fn tensor_ref(&mut self, value: ValueId) -> u32 {
        if let Some(&id) = self.value_refs.get(&value) {
            return id;
        }
        let desc = self.tensor_desc(value);
        let size = self.graph.value(value).ty.size_bytes();
        let address = self.allocator.allocate(size);
        let id = self.next_ref_id;
        self.next_ref_id += 1;
        write_tensor_ref(&mut self.refs, id, address, size, desc);
        self.value_refs.insert(value, id);
        self.report.tensor_refs += 1;
        trace!(id, address, size, "tensor ref");
        id
    }

    /// Record that `value` shares the buffer behind `ref_id`.
    fn alias(&mut self, value: ValueId, ref_id: u32) {
        self.value_refs.insert(value, ref_id);
    }

    fn run(&mut self) -> Result<(Vec<u32>, Vec<u32>), EmitError> {
        let graph = self.graph;
        let inputs: Vec<u32> = graph
            .arguments()
            .iter()
            .map(|&a| self.tensor_ref(a))
            .collect();
        let mut outputs = Vec::new();

        for &n in graph.body() {
            match &graph.node(n).kind {
                NodeKind::Constant { .. } | NodeKind::Empty => {
                    self.tensor_ref(graph.result_of(n));
                }
                NodeKind::ToLayout { input, buffer, .. } => {
                    let in_ref = self.tensor_ref(*input);
                    let out_ref = self.tensor_ref(*buffer);
                    let dbg = graph.node_debug_string(n);
                    write_convert_layout(&mut self.commands, in_ref, out_ref, &dbg);
                    self.report.commands += 1;
                    self.alias(graph.result_of(n), out_ref);
                }
                NodeKind::Dispatch(d) => {
                    let kernel = d
                        .body
                        .iter()
                        .find_map(|&bn| match &graph.node(bn).kind {
                            NodeKind::Kernel(k) => Some(k),
                            _ => None,
                        })
                        .expect("dispatch region contains a kernel");

                    let (output, ins) =
                        d.operands.split_last().expect("dispatch has operands");
                    let in_refs: Vec<u32> =
                        ins.iter().map(|&v| self.tensor_ref(v)).collect();
                    let out_ref = self.tensor_ref(*output);
                    let dbg = graph.node_debug_string(n);
                    write_launch_dispatch(
                        &mut self.commands,
                        &kernel.name,
                        kernel.kind,
                        d.grid,
                        &in_refs,
                        out_ref,
                        &dbg,
                    );
                    self.report.commands += 1;
                    self.alias(graph.result_of(n), out_ref);
                }
                NodeKind::Hl { .. } | NodeKind::Kernel(_) => {
                    return Err(EmitError::UnloweredOp {
                        node: graph.node_debug_string(n),
                    });
                }
                NodeKind::Return { operands } => {
                    outputs = operands.iter().map(|&v| self.tensor_ref(v)).collect();
                }
                NodeKind::Yield { .. } => {
                    unreachable!("yield only terminates dispatch regions")
                }
            }
        }
        Ok((inputs, outputs))
    }

    fn finish(self, inputs: Vec<u32>, outputs: Vec<u32>) -> Program {
        let mut out = ByteWriter::new();
        out.put_bytes(&MAGIC);
        out.put_u32(VERSION);

        let pool = self.pool.into_bytes();
        out.put_u32(pool.len() as u32);
        out.put_bytes(&pool);

        out.put_u32(self.report.tensor_refs as u32);
        out.put_bytes(self.refs.bytes());

        out.put_u32(self.report.commands as u32);
        out.put_bytes(self.commands.bytes());

        out.put_u32(inputs.len() as u32);
        for &i in &inputs {
            out.put_u32(i);
        }
        out.put_u32(outputs.len() as u32);
        for &o in &outputs {
            out.put_u32(o);
        }

        debug!(
            refs = self.report.tensor_refs,
            commands = self.report.commands,
            pool_bytes = pool.len(),
            "program emitted"
        );
        Program {
            bytes: out.into_bytes(),
            inputs,
            outputs,
            report: self.report,
        }
    }
}

/// Serialize `graph` into a program image, drawing buffer addresses
/// from `allocator`.
///
/// # Errors
///
/// [`EmitError::UnloweredOp`] if any high-level op or bare kernel
/// survived the pipeline.
pub fn emit_program(
    graph: &Graph,
    allocator: &mut dyn AddressAllocator,
) -> Result<Program, EmitError> {
    let mut emitter = Emitter::new(graph, allocator);
    let (inputs, outputs) = emitter.run()?;
    Ok(emitter.finish(inputs, outputs))
}
