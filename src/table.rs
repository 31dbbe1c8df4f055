//! Table registration: turns a list of `ColumnSpec`s into a row shape
//! and a `.table`/`.column` catalog entry.
//!
//! Grounded on the teacher's `sysfile.rs::sys_mknod`/`create` path:
//! allocate an inode, fill in its descriptor fields, link it into its
//! parent directory. Here the "parent directory" is always the
//! `.table` table and the "inode" is a table descriptor row plus one
//! column-descriptor row per column.

use std::sync::Arc;

use crate::column::{validate_column_name, ColumnDescriptor, ColumnSpec, DataType};
use crate::error::{Result, TmstatError};
use crate::inode::InodeAddr;
use crate::row::RowHandle;
use crate::segment::{Segment, TableMeta};

/// A registered table, as seen by the code that created it. Cloning
/// is cheap; all instances share the same underlying segment.
#[derive(Clone)]
pub struct TableHandle {
    pub(crate) segment: Segment,
    pub(crate) table_id: u16,
}

impl TableHandle {
    /// Registers a new table named `name` with the given columns.
    /// Column order fixes byte layout: offsets are assigned
    /// sequentially starting at zero.
    pub fn register(segment: &Segment, name: &str, sorted: bool, columns: &[ColumnSpec]) -> Result<Self> {
        validate_table_name(name)?;
        if columns.is_empty() {
            return Err(TmstatError::invalid("table must have at least one column"));
        }
        let mut seen = std::collections::HashSet::new();
        for c in columns {
            validate_column_name(&c.name)?;
            if !seen.insert(c.name.as_str()) {
                return Err(TmstatError::invalid(format!("duplicate column name '{}'", c.name)));
            }
            if c.size == 0 {
                return Err(TmstatError::invalid(format!("column '{}' has zero size", c.name)));
            }
        }

        let mut inner = segment.inner().lock().unwrap();
        if inner.table_ids_by_name.contains_key(name) {
            return Err(TmstatError::invalid(format!("table '{name}' already exists")));
        }
        if !inner.is_writable() {
            return Err(TmstatError::invalid("segment is read-only"));
        }

        let table_id = inner.allocate_table_id();
        // `hidden` columns still occupy a byte range (and are checked
        // for overlap via the same sequential offset assignment below)
        // but get no `.column` descriptor row: they never appear in
        // `columns()`/`column()` and so can never be named in a
        // predicate or field accessor.
        let mut offset: u16 = 0;
        let mut descriptors = Vec::with_capacity(columns.len());
        for spec in columns {
            let col = ColumnDescriptor {
                name: spec.name.clone(),
                table_id,
                offset,
                size: spec.size,
                data_type: spec.data_type,
                rule: spec.rule,
            };
            offset += spec.size;
            if spec.data_type != DataType::Hidden {
                descriptors.push(col);
            }
        }
        let row_size = offset;
        if row_size == 0 || (row_size as usize) > crate::wire::PAGE_SIZE - crate::wire::LINE_SIZE {
            return Err(TmstatError::invalid("row size out of range"));
        }

        inner.tables.insert(
            table_id,
            TableMeta {
                name: name.to_string(),
                table_id,
                root: InodeAddr::NULL,
                row_count: 0,
                row_size,
                sorted,
                columns: descriptors.clone(),
                descriptor_addr: InodeAddr::NULL,
            },
        );
        inner.table_ids_by_name.insert(name.to_string(), table_id);

        // Give the table its row in `.table`, then one row per column
        // in `.column`.
        let (slab, row) = crate::inode::alloc_row(&mut inner, crate::wire::TABLE_TABLE_ID)?;
        let descriptor_addr = InodeAddr::row(slab, row);
        inner.tables.get_mut(&table_id).unwrap().descriptor_addr = descriptor_addr;
        inner.sync_table_descriptor(table_id)?;

        for col in &descriptors {
            let (cslab, crow) = crate::inode::alloc_row(&mut inner, crate::wire::COLUMN_TABLE_ID)?;
            inner.write_column_descriptor(InodeAddr::row(cslab, crow), col)?;
        }

        drop(inner);
        Ok(TableHandle {
            segment: segment.clone(),
            table_id,
        })
    }

    /// Looks up an already-registered table by name.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        let table_id = segment
            .table_id(name)
            .ok_or_else(|| TmstatError::NoSuchTable(name.to_string()))?;
        Ok(TableHandle {
            segment: segment.clone(),
            table_id,
        })
    }

    pub fn table_id(&self) -> u16 {
        self.table_id
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn name(&self) -> String {
        let inner = self.segment.inner().lock().unwrap();
        inner.tables[&self.table_id].name.clone()
    }

    pub fn row_size(&self) -> u16 {
        let inner = self.segment.inner().lock().unwrap();
        inner.tables[&self.table_id].row_size
    }

    pub fn row_count(&self) -> u32 {
        let inner = self.segment.inner().lock().unwrap();
        inner.tables[&self.table_id].row_count
    }

    pub fn is_sorted(&self) -> bool {
        let inner = self.segment.inner().lock().unwrap();
        inner.tables[&self.table_id].sorted
    }

    pub fn columns(&self) -> Vec<ColumnDescriptor> {
        let inner = self.segment.inner().lock().unwrap();
        inner.tables[&self.table_id].columns.clone()
    }

    pub fn column(&self, name: &str) -> Result<ColumnDescriptor> {
        self.columns()
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| TmstatError::NoSuchColumn(name.to_string()))
    }

    pub fn key_columns(&self) -> Vec<ColumnDescriptor> {
        self.columns()
            .into_iter()
            .filter(|c| c.rule == crate::column::MergeRule::Key)
            .collect()
    }

    /// Allocates a new, zeroed row owned by the caller. The returned
    /// handle's fields should be filled in with the `set_*` methods;
    /// the row is already linked into the table and visible to
    /// concurrent readers as soon as this call returns. Dropping the
    /// handle frees the row unless `RowHandle::preserve` is called
    /// first.
    pub fn insert(&self) -> Result<RowHandle> {
        let mut inner = self.segment.inner().lock().unwrap();
        if !inner.is_writable() {
            return Err(TmstatError::invalid("segment is read-only"));
        }
        let (slab_index, row_index) = crate::inode::alloc_row(&mut inner, self.table_id)?;
        let slab = inner.slab(slab_index)?;
        let row_size = inner.tables[&self.table_id].row_size;
        let columns: Arc<[ColumnDescriptor]> = inner.tables[&self.table_id].columns.clone().into();
        let seg_weak = Arc::downgrade(self.segment.inner());
        drop(inner);
        Ok(RowHandle::new_owning(
            seg_weak,
            slab,
            slab_index,
            row_index,
            self.table_id,
            row_size,
            columns,
        ))
    }

    /// Explicitly frees a previously inserted row. Equivalent to
    /// letting the last `Owning` handle to this row drop, spelled out
    /// for callers that want to free a row before its handle's scope
    /// ends.
    pub fn remove(&self, mut row: RowHandle) -> Result<()> {
        let (slab_index, row_index, table_id) = row
            .location()
            .ok_or_else(|| TmstatError::invalid("row is not owned by this table"))?;
        if table_id != self.table_id {
            return Err(TmstatError::invalid("row belongs to a different table"));
        }
        let mut inner = self.segment.inner().lock().unwrap();
        crate::inode::free_row(&mut inner, table_id, slab_index, row_index)?;
        drop(inner);
        row.mark_freed();
        Ok(())
    }

    /// Builds a weak (non-freeing) handle onto an existing row,
    /// used by the query engine to return results.
    pub(crate) fn weak_row(&self, slab_index: u32, row_index: u8) -> Result<RowHandle> {
        let inner = self.segment.inner().lock().unwrap();
        let slab = inner.slab(slab_index)?;
        let row_size = inner.tables[&self.table_id].row_size;
        let columns: Arc<[ColumnDescriptor]> = inner.tables[&self.table_id].columns.clone().into();
        let seg_weak = Arc::downgrade(self.segment.inner());
        drop(inner);
        Ok(RowHandle::new_weak(seg_weak, slab, row_index, row_size, columns))
    }

    /// A free-standing row shaped like this table's rows, for
    /// building search keys without touching the segment.
    pub fn pseudo_row(&self) -> RowHandle {
        let inner = self.segment.inner().lock().unwrap();
        let row_size = inner.tables[&self.table_id].row_size;
        let columns: Arc<[ColumnDescriptor]> = inner.tables[&self.table_id].columns.clone().into();
        drop(inner);
        RowHandle::pseudo(row_size, columns)
    }
}

fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= crate::wire::NAME_LEN {
        return Err(TmstatError::invalid(format!("table name '{name}' has invalid length")));
    }
    if name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(TmstatError::invalid(format!("table name '{name}' contains an illegal byte")));
    }
    Ok(())
}
