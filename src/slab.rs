//! Slabs: page-sized chunks holding a header plus a sequence of
//! 64-byte lines. Rows live at `line[1 + row_index * lines_per_row]`.
//!
//! The teacher's `bio.rs` caches fixed-size disk blocks behind a
//! `Buf` wrapper callers read/write in place; `Slab` plays the same
//! role for a page-sized chunk, except the backing bytes are either a
//! plain owned buffer (publisher side) or a view into a read-only
//! `mmap` (subscriber side) rather than a disk block cache.

use std::sync::Arc;

use memmap2::Mmap;

use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Result, TmstatError};
use crate::wire::{SlabHeaderWire, LINE_SIZE, PAGE_SIZE, SLAB_MAGIC};

/// Where a slab's bytes actually live.
pub enum Backing {
    /// Heap-owned page, mutable — used by every segment a writer
    /// creates (`Create` origin, and the merge-to-file destination).
    Owned(Box<[u8; PAGE_SIZE]>),
    /// A read-only view into a whole-file `mmap`, used by subscribed
    /// segments. `offset` is the byte offset of this slab within the
    /// mapping.
    Mapped(Arc<Mmap>, usize),
}

impl Backing {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Owned(b) => b.as_slice(),
            Backing::Mapped(m, off) => &m[*off..*off + PAGE_SIZE],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Owned(b) => b.as_mut_slice(),
            Backing::Mapped(..) => {
                panic!("tmstat: attempted to mutate a read-only mapped slab")
            }
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Backing::Owned(_))
    }
}

pub struct Slab {
    pub backing: Backing,
}

impl Slab {
    pub fn new_owned() -> Self {
        Slab {
            backing: Backing::Owned(Box::new([0u8; PAGE_SIZE])),
        }
    }

    pub fn new_mapped(mmap: Arc<Mmap>, offset: usize) -> Self {
        Slab {
            backing: Backing::Mapped(mmap, offset),
        }
    }

    pub fn header(&self) -> Result<SlabHeaderWire> {
        SlabHeaderWire::read_from_bytes(&self.backing.as_slice()[..LINE_SIZE])
            .map_err(|_| TmstatError::corrupt("slab header misaligned"))
    }

    pub fn set_header(&mut self, header: &SlabHeaderWire) {
        header
            .write_to(&mut self.backing.as_mut_slice()[..LINE_SIZE])
            .expect("header is exactly one line");
    }

    /// Validates magic and owning segment/table id, per the universal
    /// "every slab's magic matches and its owning-segment id equals
    /// the segment's id" invariant.
    pub fn validate(&self, segment_id: u32, table_id: u16) -> Result<SlabHeaderWire> {
        let h = self.header()?;
        if h.magic != SLAB_MAGIC {
            return Err(TmstatError::corrupt("bad slab magic"));
        }
        if h.owning_segment_id != segment_id {
            return Err(TmstatError::corrupt("slab owning-segment id mismatch"));
        }
        if h.table_id != table_id {
            return Err(TmstatError::damaged("slab table id mismatch"));
        }
        Ok(h)
    }

    fn row_region(row_index: u8, lines_per_row: u16) -> (usize, usize) {
        let start = LINE_SIZE + row_index as usize * lines_per_row as usize * LINE_SIZE;
        let len = lines_per_row as usize * LINE_SIZE;
        (start, len)
    }

    pub fn row_slice(&self, row_index: u8, lines_per_row: u16) -> &[u8] {
        let (start, len) = Self::row_region(row_index, lines_per_row);
        &self.backing.as_slice()[start..start + len]
    }

    pub fn row_slice_mut(&mut self, row_index: u8, lines_per_row: u16) -> &mut [u8] {
        let (start, len) = Self::row_region(row_index, lines_per_row);
        &mut self.backing.as_mut_slice()[start..start + len]
    }

    pub fn zero_row(&mut self, row_index: u8, lines_per_row: u16) {
        self.row_slice_mut(row_index, lines_per_row).fill(0);
    }
}
