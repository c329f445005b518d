//! Record layout of the emitted program image.
//!
//! Everything is little-endian. Strings are length-prefixed UTF-8.
//! Descriptors nest by pool offset: a tensor record points at a
//! layout record, which points at a memory record. Offset 0 is
//! reserved as the null layout — the pool writer seeds one zero byte
//! so no real record can land there — which is how layout-less host
//! tensors are represented without an option flag in every record.

use tgc_graph::{DType, Grid, KernelKind, Layout, MemRefDesc, MemorySpace, OobVal, TensorType};

/// Image magic, first four bytes of every program.
pub const MAGIC: [u8; 4] = *b"TGCB";

/// Image format version.
pub const VERSION: u32 = 1;

/// Pool offset denoting "no layout".
pub const NULL_LAYOUT: u32 = 0;

/// Command opcode: layout conversion between two buffers.
pub const CMD_CONVERT_LAYOUT: u8 = 1;

/// Command opcode: launch one dispatch on the grid.
pub const CMD_LAUNCH_DISPATCH: u8 = 2;

/// Little-endian byte sink used for every section of the image.
#[derive(Debug, Default)]
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length, which is also the offset of the next write.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Append one byte.
    pub fn put_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    /// Append a `u32`.
    pub fn put_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a `u64`.
    pub fn put_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append an `i32`.
    pub fn put_i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.bytes.extend_from_slice(s.as_bytes());
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, b: &[u8]) {
        self.bytes.extend_from_slice(b);
    }

    /// Consume the writer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The bytes written so far.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The descriptor pool: a [`ByteWriter`] whose offset 0 is reserved
/// for [`NULL_LAYOUT`].
#[derive(Debug)]
pub struct PoolWriter(ByteWriter);

impl PoolWriter {
    /// Create a pool with the null slot seeded.
    #[must_use]
    pub fn new() -> Self {
        let mut w = ByteWriter::new();
        w.put_u8(0);
        Self(w)
    }

    /// Offset of the next record.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.0.offset()
    }

    /// Consume the pool.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0.into_bytes()
    }
}

impl Default for PoolWriter {
    fn default() -> Self {
        Self::new()
    }
}

const fn dtype_code(d: DType) -> u8 {
    match d {
        DType::Float32 => 0,
        DType::Float16 => 1,
        DType::BFloat16 => 2,
        DType::UInt32 => 3,
        DType::UInt16 => 4,
        DType::UInt8 => 5,
    }
}

const fn space_code(s: MemorySpace) -> u8 {
    match s {
        MemorySpace::System => 0,
        MemorySpace::SystemMmio => 1,
        MemorySpace::DeviceDram => 2,
        MemorySpace::DeviceL1 => 3,
    }
}

const fn oob_code(o: OobVal) -> u8 {
    match o {
        OobVal::Undef => 0,
        OobVal::Zero => 1,
        OobVal::One => 2,
        OobVal::Inf => 3,
        OobVal::NegInf => 4,
    }
}

const fn kernel_kind_code(k: KernelKind) -> u8 {
    match k {
        KernelKind::Eltwise => 0,
        KernelKind::Matmul => 1,
    }
}

/// Write a memory-buffer record, returning its pool offset.
///
/// Encoding: rank, extents, tile presence byte (with height and width
/// when present), element type, memory space.
pub fn write_memory_desc(pool: &mut PoolWriter, m: &MemRefDesc) -> u32 {
    let off = pool.offset();
    let w = &mut pool.0;
    w.put_u32(m.shape.rank() as u32);
    for &d in m.shape.dims() {
        w.put_i32(d as i32);
    }
    match m.tile {
        Some(t) => {
            w.put_u8(1);
            w.put_u32(t.height);
            w.put_u32(t.width);
        }
        None => w.put_u8(0),
    }
    w.put_u8(dtype_code(m.dtype));
    w.put_u8(space_code(m.space));
    off
}

/// Write a layout record, returning its pool offset. The memory
/// record must already be pooled.
pub fn write_layout_desc(pool: &mut PoolWriter, l: &Layout, memory_off: u32) -> u32 {
    let off = pool.offset();
    let w = &mut pool.0;
    w.put_u32(l.strides.len() as u32);
    for &s in &l.strides {
        w.put_i32(s as i32);
    }
    w.put_u8(oob_code(l.oob_val));
    w.put_u32(l.grid.rows);
    w.put_u32(l.grid.cols);
    w.put_u32(memory_off);
    off
}

/// Write a tensor-type record, returning its pool offset.
/// `layout_off` is [`NULL_LAYOUT`] for a host tensor.
pub fn write_tensor_desc(pool: &mut PoolWriter, ty: &TensorType, layout_off: u32) -> u32 {
    let off = pool.offset();
    let w = &mut pool.0;
    w.put_u32(ty.shape.rank() as u32);
    for &d in ty.shape.dims() {
        w.put_i32(d as i32);
    }
    w.put_u8(dtype_code(ty.dtype));
    w.put_u32(layout_off);
    off
}

/// Write one tensor-reference record into the refs section.
pub fn write_tensor_ref(w: &mut ByteWriter, id: u32, address: u64, size: u64, desc_off: u32) {
    w.put_u32(id);
    w.put_u64(address);
    w.put_u64(size);
    w.put_u32(desc_off);
}

/// Write a layout-conversion command.
pub fn write_convert_layout(w: &mut ByteWriter, input_ref: u32, output_ref: u32, debug: &str) {
    w.put_u8(CMD_CONVERT_LAYOUT);
    w.put_u32(input_ref);
    w.put_u32(output_ref);
    w.put_str(debug);
}

/// Write a dispatch-launch command.
pub fn write_launch_dispatch(
    w: &mut ByteWriter,
    name: &str,
    kind: KernelKind,
    grid: Grid,
    input_refs: &[u32],
    output_ref: u32,
    debug: &str,
) {
    w.put_u8(CMD_LAUNCH_DISPATCH);
    w.put_str(name);
    w.put_u8(kernel_kind_code(kind));
    w.put_u32(grid.rows);
    w.put_u32(grid.cols);
    w.put_u32(input_refs.len() as u32);
    for &r in input_refs {
        w.put_u32(r);
    }
    w.put_u32(output_ref);
    w.put_str(debug);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgc_graph::{canonical_strides, Shape, TileShape};

    #[test]
    fn test_pool_reserves_null_offset() {
        let mut pool = PoolWriter::new();
        assert_eq!(pool.offset(), 1);

        let m = MemRefDesc {
            shape: Shape::new([4, 4]),
            tile: None,
            dtype: DType::Float32,
            space: MemorySpace::System,
        };
        let off = write_memory_desc(&mut pool, &m);
        assert_ne!(off, NULL_LAYOUT);
    }

    #[test]
    fn test_memory_desc_encoding() {
        let mut pool = PoolWriter::new();
        let m = MemRefDesc {
            shape: Shape::new([2, 3]),
            tile: Some(TileShape {
                height: 32,
                width: 32,
            }),
            dtype: DType::BFloat16,
            space: MemorySpace::DeviceDram,
        };
        let off = write_memory_desc(&mut pool, &m);
        let bytes = pool.into_bytes();
        let rec = &bytes[off as usize..];

        assert_eq!(&rec[..4], &2u32.to_le_bytes()); // rank
        assert_eq!(&rec[4..8], &2i32.to_le_bytes());
        assert_eq!(&rec[8..12], &3i32.to_le_bytes());
        assert_eq!(rec[12], 1); // tiled
        assert_eq!(&rec[13..17], &32u32.to_le_bytes());
        assert_eq!(&rec[17..21], &32u32.to_le_bytes());
        assert_eq!(rec[21], 2); // bf16
        assert_eq!(rec[22], 2); // device dram
    }

    #[test]
    fn test_layout_desc_points_at_memory() {
        let shape = Shape::new([4, 4]);
        let mut pool = PoolWriter::new();
        let m = MemRefDesc {
            shape: shape.clone(),
            tile: None,
            dtype: DType::Float32,
            space: MemorySpace::System,
        };
        let mem_off = write_memory_desc(&mut pool, &m);
        let l = Layout {
            strides: canonical_strides(&shape),
            oob_val: OobVal::Undef,
            grid: Grid::UNIT,
            memref: m,
        };
        let lay_off = write_layout_desc(&mut pool, &l, mem_off);
        let bytes = pool.into_bytes();
        let rec = &bytes[lay_off as usize..];

        // num strides, strides [4, 1], oob, grid, memory offset.
        assert_eq!(&rec[..4], &2u32.to_le_bytes());
        assert_eq!(&rec[4..8], &4i32.to_le_bytes());
        assert_eq!(&rec[8..12], &1i32.to_le_bytes());
        assert_eq!(rec[12], 0);
        assert_eq!(&rec[13..17], &1u32.to_le_bytes());
        assert_eq!(&rec[17..21], &1u32.to_le_bytes());
        assert_eq!(&rec[21..25], &mem_off.to_le_bytes());
    }

    #[test]
    fn test_strings_are_length_prefixed() {
        let mut w = ByteWriter::new();
        w.put_str("add");
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..], b"add");
    }
}
