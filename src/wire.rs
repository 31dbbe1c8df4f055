//! On-disk layout: slab header, inode row, and the three descriptor
//! row shapes, as fixed, little-endian, host-aligned byte layouts.
//!
//! The teacher reads/writes these shapes through raw `align_to`/
//! `align_to_mut` transmutes (`src/mkfs/main.rs`, `src/kernel/fs.rs`).
//! `zerocopy`'s derives give the same "reinterpret these bytes as a
//! struct" behavior without the unsafe cast.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const LINE_SIZE: usize = 64;
/// Fixed at the common host page size rather than queried from the
/// platform; §3 calls for "the host page size" but a portable crate
/// needs one deterministic slab size baked into the wire format.
pub const PAGE_SIZE: usize = 4096;
pub const LINES_PER_SLAB: usize = PAGE_SIZE / LINE_SIZE - 1;
pub const MAX_ROWS_PER_SLAB: usize = 63;
pub const INODE_CHILD_COUNT: usize = (LINE_SIZE / 4) - 1;

pub const SLAB_MAGIC: u32 = u32::from_le_bytes(*b"TMSS");
pub const INODE_LEAF_MARKER: u8 = 0xff;

pub const NAME_LEN: usize = 32;
pub const LABEL_NAME_LEN: usize = 32;
pub const CTIME_TEXT_LEN: usize = 26;

pub const TABLE_TABLE_ID: u16 = 0;
pub const INODE_TABLE_ID: u16 = 1;
pub const LABEL_TABLE_ID: u16 = 2;
pub const COLUMN_TABLE_ID: u16 = 3;
pub const FIRST_USER_TABLE_ID: u16 = 4;

pub const TABLE_TABLE_NAME: &str = ".table";
pub const INODE_TABLE_NAME: &str = ".inode";
pub const LABEL_TABLE_NAME: &str = ".label";
pub const COLUMN_TABLE_NAME: &str = ".column";

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SlabHeaderWire {
    pub magic: u32,
    pub table_id: u16,
    pub lines_per_row: u16,
    pub row_bitmap: u64,
    pub own_inode_address: u32,
    pub parent_inode_address: u32,
    pub owning_segment_id: u32,
    pub _reserved: [u8; 36],
}

const _: () = assert!(core::mem::size_of::<SlabHeaderWire>() == LINE_SIZE);

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InodeRowWire {
    pub children: [u32; INODE_CHILD_COUNT],
    pub next: u32,
}

const _: () = assert!(core::mem::size_of::<InodeRowWire>() == LINE_SIZE);

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TableDescriptorWire {
    pub name: [u8; NAME_LEN],
    pub inode_root: u32,
    pub row_count: u32,
    pub row_size: u16,
    pub column_count: u16,
    pub table_id: u16,
    pub sorted: u8,
    pub _reserved: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ColumnDescriptorWire {
    pub name: [u8; NAME_LEN],
    pub table_id: u16,
    pub offset: u16,
    pub size: u16,
    pub data_type: u8,
    pub rule: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LabelRowWire {
    pub time: i64,
    pub tree_prefix: [u8; 8],
    pub name: [u8; LABEL_NAME_LEN],
    pub ctime_text: [u8; CTIME_TEXT_LEN],
    pub _reserved: [u8; 6],
}

/// Copies `s` into a fixed-width, NUL-padded wire field.
pub fn pack_name<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Reads a fixed-width, NUL-padded wire field back as a `String`.
pub fn unpack_name<const N: usize>(buf: &[u8; N]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(N);
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn lines_per_row(row_size: u16) -> u16 {
    ((row_size as usize).div_ceil(LINE_SIZE)) as u16
}

pub fn rows_per_slab(row_size: u16) -> usize {
    let lpr = lines_per_row(row_size).max(1) as usize;
    (LINES_PER_SLAB / lpr).min(MAX_ROWS_PER_SLAB)
}
