//! Row handles: a reference-counted view onto one row's bytes.
//!
//! Three flavors, the way the teacher distinguishes an `Arc<MInode>`
//! obtained via `iget` (keeps the inode pinned, frees on drop when the
//! link count hits zero) from a raw `BufGuard` borrow and from a
//! scratch `IData` built only to carry values (`sysfile.rs`'s local
//! structs never written back to disk):
//!
//! - `Owning`: created by `Table::insert`. Frees its slot when dropped
//!   with no other references, the way `Inode::drop` calls `itrunc`.
//!   Call `preserve` on a handle that should outlive its own scope.
//! - `Weak_`: a query result view. Never frees anything.
//! - `Pseudo`: a free-standing buffer, used to build search keys and
//!   merge accumulators that were never allocated inside a segment.

use std::sync::{Arc, Mutex, Weak};

use crate::column::{ColumnDescriptor, DataType};
use crate::error::{Result, TmstatError};
use crate::segment::SegmentInner;
use crate::slab::Slab;
use crate::wire::lines_per_row;

enum RowStorage {
    Owning {
        segment: Weak<Mutex<SegmentInner>>,
        slab: Arc<Mutex<Slab>>,
        slab_index: u32,
        row_index: u8,
        table_id: u16,
        owns_row: bool,
    },
    Weak_ {
        segment: Weak<Mutex<SegmentInner>>,
        slab: Arc<Mutex<Slab>>,
        row_index: u8,
    },
    Pseudo {
        bytes: Vec<u8>,
    },
}

pub struct RowHandle {
    storage: RowStorage,
    row_size: u16,
    columns: Arc<[ColumnDescriptor]>,
}

impl RowHandle {
    pub(crate) fn new_owning(
        segment: Weak<Mutex<SegmentInner>>,
        slab: Arc<Mutex<Slab>>,
        slab_index: u32,
        row_index: u8,
        table_id: u16,
        row_size: u16,
        columns: Arc<[ColumnDescriptor]>,
    ) -> Self {
        if let Some(seg) = segment.upgrade() {
            seg.lock().unwrap().outstanding += 1;
        }
        RowHandle {
            storage: RowStorage::Owning {
                segment,
                slab,
                slab_index,
                row_index,
                table_id,
                owns_row: true,
            },
            row_size,
            columns,
        }
    }

    pub(crate) fn new_weak(
        segment: Weak<Mutex<SegmentInner>>,
        slab: Arc<Mutex<Slab>>,
        row_index: u8,
        row_size: u16,
        columns: Arc<[ColumnDescriptor]>,
    ) -> Self {
        if let Some(seg) = segment.upgrade() {
            seg.lock().unwrap().outstanding += 1;
        }
        RowHandle {
            storage: RowStorage::Weak_ {
                segment,
                slab,
                row_index,
            },
            row_size,
            columns,
        }
    }

    /// A free-standing row buffer not backed by any segment slab,
    /// used to build search keys or merge accumulators.
    pub fn pseudo(row_size: u16, columns: Arc<[ColumnDescriptor]>) -> Self {
        RowHandle {
            storage: RowStorage::Pseudo {
                bytes: vec![0u8; row_size as usize],
            },
            row_size,
            columns,
        }
    }

    pub fn row_size(&self) -> u16 {
        self.row_size
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn is_owning(&self) -> bool {
        matches!(self.storage, RowStorage::Owning { .. })
    }

    /// Copies out the row's raw bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        match &self.storage {
            RowStorage::Owning { slab, row_index, .. } | RowStorage::Weak_ { slab, row_index, .. } => {
                let guard = slab.lock().unwrap();
                guard.row_slice(*row_index, lines_per_row(self.row_size))[..self.row_size as usize]
                    .to_vec()
            }
            RowStorage::Pseudo { bytes } => bytes.clone(),
        }
    }

    /// Overwrites the row's raw bytes. Fails on a `Weak_` handle into
    /// a read-only mapped segment.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.row_size as usize {
            return Err(TmstatError::invalid("row byte length mismatch"));
        }
        match &mut self.storage {
            RowStorage::Owning { slab, row_index, .. } | RowStorage::Weak_ { slab, row_index, .. } => {
                let mut guard = slab.lock().unwrap();
                if !guard.backing.is_writable() {
                    return Err(TmstatError::invalid("row is read-only"));
                }
                let dst = guard.row_slice_mut(*row_index, lines_per_row(self.row_size));
                dst[..data.len()].copy_from_slice(data);
            }
            RowStorage::Pseudo { bytes } => bytes.copy_from_slice(data),
        }
        Ok(())
    }

    fn find_column(&self, name: &str) -> Result<ColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| TmstatError::NoSuchColumn(name.to_string()))
    }

    fn field_bytes(&self, col: &ColumnDescriptor) -> Vec<u8> {
        let row = self.to_vec();
        row[col.offset as usize..col.offset as usize + col.size as usize].to_vec()
    }

    /// Field accessors default to 0 / empty rather than erroring when
    /// `name` isn't one of this row's columns, so a query can read a
    /// field across union children whose tables differ in column set
    /// without every read needing its own presence check.
    pub fn get_bytes(&self, name: &str) -> Result<Vec<u8>> {
        Ok(match self.columns.iter().find(|c| c.name == name) {
            Some(col) => self.field_bytes(col),
            None => Vec::new(),
        })
    }

    pub fn set_bytes(&mut self, name: &str, value: &[u8]) -> Result<()> {
        let col = self.find_column(name)?;
        if value.len() > col.size as usize {
            return Err(TmstatError::invalid(format!(
                "value for '{name}' exceeds column width {}",
                col.size
            )));
        }
        let mut row = self.to_vec();
        let start = col.offset as usize;
        row[start..start + value.len()].copy_from_slice(value);
        for b in &mut row[start + value.len()..start + col.size as usize] {
            *b = 0;
        }
        self.write_bytes(&row)
    }

    pub fn get_i64(&self, name: &str) -> Result<i64> {
        let Some(col) = self.columns.iter().find(|c| c.name == name) else {
            return Ok(0);
        };
        let bytes = self.field_bytes(col);
        Ok(match col.size {
            1 => bytes[0] as i8 as i64,
            2 => i16::from_le_bytes(bytes[..2].try_into().unwrap()) as i64,
            4 => i32::from_le_bytes(bytes[..4].try_into().unwrap()) as i64,
            8 => i64::from_le_bytes(bytes[..8].try_into().unwrap()),
            n => return Err(TmstatError::invalid(format!("column '{name}' width {n} is not a scalar integer width"))),
        })
    }

    pub fn set_i64(&mut self, name: &str, value: i64) -> Result<()> {
        let col = self.find_column(name)?;
        let bytes: Vec<u8> = match col.size {
            1 => vec![value as i8 as u8],
            2 => (value as i16).to_le_bytes().to_vec(),
            4 => (value as i32).to_le_bytes().to_vec(),
            8 => value.to_le_bytes().to_vec(),
            n => return Err(TmstatError::invalid(format!("column '{name}' width {n} is not a scalar integer width"))),
        };
        self.set_bytes(name, &bytes)
    }

    pub fn get_u64(&self, name: &str) -> Result<u64> {
        let Some(col) = self.columns.iter().find(|c| c.name == name) else {
            return Ok(0);
        };
        let bytes = self.field_bytes(col);
        Ok(match col.size {
            1 => bytes[0] as u64,
            2 => u16::from_le_bytes(bytes[..2].try_into().unwrap()) as u64,
            4 => u32::from_le_bytes(bytes[..4].try_into().unwrap()) as u64,
            8 => u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            n => return Err(TmstatError::invalid(format!("column '{name}' width {n} is not a scalar integer width"))),
        })
    }

    pub fn set_u64(&mut self, name: &str, value: u64) -> Result<()> {
        let col = self.find_column(name)?;
        let bytes: Vec<u8> = match col.size {
            1 => vec![value as u8],
            2 => (value as u16).to_le_bytes().to_vec(),
            4 => (value as u32).to_le_bytes().to_vec(),
            8 => value.to_le_bytes().to_vec(),
            n => return Err(TmstatError::invalid(format!("column '{name}' width {n} is not a scalar integer width"))),
        };
        self.set_bytes(name, &bytes)
    }

    /// Location of this row's slab and index, for the owning table to
    /// hand to `free_row` on explicit removal. `None` for `Pseudo`.
    pub(crate) fn location(&self) -> Option<(u32, u8, u16)> {
        match &self.storage {
            RowStorage::Owning {
                slab_index,
                row_index,
                table_id,
                ..
            } => Some((*slab_index, *row_index, *table_id)),
            _ => None,
        }
    }

    /// Stops this handle from freeing its row when dropped, the way
    /// the original's `tmstat_row_preserve` clears a freshly created
    /// row's owning bit. Use this when a row should outlive the local
    /// handle used to create and fill it in. No-op on non-`Owning`
    /// handles.
    pub fn preserve(&mut self) {
        if let RowStorage::Owning { owns_row, .. } = &mut self.storage {
            *owns_row = false;
        }
    }

    /// Disarms the drop-time free after the row has already been
    /// freed explicitly (`TableHandle::remove`), so dropping this
    /// handle afterward doesn't free it a second time.
    pub(crate) fn mark_freed(&mut self) {
        if let RowStorage::Owning { owns_row, .. } = &mut self.storage {
            *owns_row = false;
        }
    }

    pub fn get_text(&self, name: &str) -> Result<String> {
        let Some(col) = self.columns.iter().find(|c| c.name == name) else {
            return Ok(String::new());
        };
        if col.data_type != DataType::Text {
            return Err(TmstatError::invalid(format!("column '{name}' is not text")));
        }
        let bytes = self.field_bytes(col);
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn set_text(&mut self, name: &str, value: &str) -> Result<()> {
        self.set_bytes(name, value.as_bytes())
    }
}

/// Dropping the last `Owning` reference frees its row's slot, the way
/// `tmstat_row_drop` frees and removes a row whose `own_row` bit is
/// still set — a fresh row is owning by default, and stays that way
/// unless `preserve` (or an explicit `TableHandle::remove`, which
/// disarms this before the handle drops) says otherwise. `Weak_`
/// handles only ever release the segment's outstanding-reference
/// count used to gate subscriber refresh.
impl Drop for RowHandle {
    fn drop(&mut self) {
        match &self.storage {
            RowStorage::Owning {
                segment,
                slab_index,
                row_index,
                table_id,
                owns_row,
                ..
            } => {
                if let Some(seg_arc) = segment.upgrade() {
                    let mut guard = seg_arc.lock().unwrap();
                    if *owns_row {
                        if let Err(e) = crate::inode::free_row(&mut guard, *table_id, *slab_index, *row_index) {
                            log::warn!("failed to free row on drop: {e}");
                        }
                    }
                    guard.outstanding = guard.outstanding.saturating_sub(1);
                }
            }
            RowStorage::Weak_ { segment, .. } => {
                if let Some(seg_arc) = segment.upgrade() {
                    let mut guard = seg_arc.lock().unwrap();
                    guard.outstanding = guard.outstanding.saturating_sub(1);
                }
            }
            RowStorage::Pseudo { .. } => {}
        }
    }
}
