//! The query planner: a binary-search fast path over sorted tables
//! and a linear-scan fallback, the way the teacher's directory lookup
//! (`fs.rs::dirlookup`) is a plain linear scan over directory entries
//! because directories are small and unsorted — the fast path here
//! exists precisely because merged tables are *not* small.

use std::cmp::Ordering;

use crate::column::{ColumnDescriptor, DataType};
use crate::error::Result;
use crate::row::RowHandle;
use crate::segment::SegmentInner;
use crate::table::TableHandle;
use crate::wire::rows_per_slab;

/// Which strategy a query actually used, useful for tests and for
/// anyone tuning a hot lookup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPlan {
    BinarySearch,
    LinearScan,
}

/// Full, in-order enumeration of every live row in a table.
pub fn scan(table: &TableHandle) -> Result<Vec<RowHandle>> {
    let mut out = Vec::new();
    for (slab_index, row_index) in ordered_rows(table)? {
        out.push(table.weak_row(slab_index, row_index)?);
    }
    Ok(out)
}

/// Enumerates `(slab_index, row_index)` pairs in table order: slabs in
/// the order they were linked into the inode tree, rows within a slab
/// in ascending bitmap-bit order. For a `sorted` table, created only
/// through the merge-to-file writer, this order is also key order.
pub(crate) fn ordered_rows(table: &TableHandle) -> Result<Vec<(u32, u8)>> {
    let inner = table.segment().inner().lock().unwrap();
    let table_id = table.table_id();
    let slabs = crate::inode::table_slabs(&inner, table_id)?;
    let mut out = Vec::new();
    for slab_index in slabs {
        for row_index in slab_row_indices(&inner, table_id, slab_index)? {
            out.push((slab_index, row_index));
        }
    }
    Ok(out)
}

fn slab_row_indices(inner: &SegmentInner, table_id: u16, slab_index: u32) -> Result<Vec<u8>> {
    let header = inner.validated_header(slab_index, table_id)?;
    let rows = rows_per_slab(header.lines_per_row * crate::wire::LINE_SIZE as u16) as u8;
    Ok((0..rows).filter(|&i| header.row_bitmap & (1 << i) != 0).collect())
}

/// Reads one field's raw bytes straight out of a slab, without going
/// through a `RowHandle` — used by the binary-search fast path, which
/// already holds the segment lock for the whole search and can't take
/// it again through `TableHandle::weak_row`.
fn field_bytes(
    inner: &SegmentInner,
    table_id: u16,
    slab_index: u32,
    row_index: u8,
    col: &ColumnDescriptor,
) -> Result<Vec<u8>> {
    let header = inner.validated_header(slab_index, table_id)?;
    let slab = inner.slab(slab_index)?;
    let guard = slab.lock().unwrap();
    let row = guard.row_slice(row_index, header.lines_per_row);
    Ok(row[col.offset as usize..col.offset as usize + col.size as usize].to_vec())
}

fn compare_resolved(
    inner: &SegmentInner,
    table_id: u16,
    slab_index: u32,
    row_index: u8,
    resolved: &[(ColumnDescriptor, &[u8])],
) -> Result<Ordering> {
    for (col, value) in resolved {
        let field = field_bytes(inner, table_id, slab_index, row_index, col)?;
        match field.as_slice().cmp(value) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

/// True if `field` and `value` satisfy one predicate, per the column's
/// comparison rule: a text field compares only up to its first NUL (a
/// caller's unpadded value still matches a zero-padded column), every
/// other type compares every byte.
fn predicate_matches(col: &ColumnDescriptor, field: &[u8], value: &[u8]) -> bool {
    if col.data_type == DataType::Text {
        let field_end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let value_end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        field[..field_end] == value[..value_end]
    } else {
        field == value
    }
}

/// Resolves `(column-name, value)` predicates against a table's real
/// columns. `None` means one of the predicate columns doesn't exist
/// on this table, which per the query engine's contract yields an
/// empty result rather than an error.
fn resolve_predicates<'a>(
    table: &TableHandle,
    predicates: &[(&str, &'a [u8])],
) -> Option<Vec<(ColumnDescriptor, &'a [u8])>> {
    let columns = table.columns();
    let mut resolved = Vec::with_capacity(predicates.len());
    for (name, value) in predicates {
        let col = columns.iter().find(|c| c.name == *name)?;
        resolved.push((col.clone(), *value));
    }
    Some(resolved)
}

/// Evaluates an arbitrary conjunction of equality predicates against a
/// table: a missing predicate column or table empties the result; a
/// sorted table whose predicates cover exactly its key columns binary
/// searches the slab list instead of scanning every row.
pub fn query<'a>(table: &TableHandle, predicates: &[(&str, &'a [u8])]) -> Result<(Vec<RowHandle>, QueryPlan)> {
    if predicates.is_empty() {
        return Ok((scan(table)?, QueryPlan::LinearScan));
    }

    let Some(resolved) = resolve_predicates(table, predicates) else {
        return Ok((Vec::new(), QueryPlan::LinearScan));
    };

    let key_cols = table.key_columns();
    let covers_keys = table.is_sorted()
        && !key_cols.is_empty()
        && resolved.len() == key_cols.len()
        && key_cols.iter().all(|k| resolved.iter().any(|(c, _)| c.name == k.name));

    if covers_keys {
        // Reorder to match the table's own key-column order: that's
        // the order the sorted merge writer actually sorted rows by,
        // which is the only order a binary search can trust.
        let in_key_order: Vec<(ColumnDescriptor, &[u8])> = key_cols
            .iter()
            .map(|k| resolved.iter().find(|(c, _)| c.name == k.name).cloned().unwrap())
            .collect();
        return match binary_search_slabs(table, &in_key_order)? {
            Some((slab_index, row_index)) => Ok((vec![table.weak_row(slab_index, row_index)?], QueryPlan::BinarySearch)),
            None => Ok((Vec::new(), QueryPlan::BinarySearch)),
        };
    }

    let mut out = Vec::new();
    for (slab_index, row_index) in ordered_rows(table)? {
        let row = table.weak_row(slab_index, row_index)?;
        let mut all_match = true;
        for (col, value) in &resolved {
            if !predicate_matches(col, &row.get_bytes(&col.name)?, value) {
                all_match = false;
                break;
            }
        }
        if all_match {
            out.push(row);
        }
    }
    Ok((out, QueryPlan::LinearScan))
}

/// Binary search over the table's *slabs* (not its rows): each slab's
/// first and last live row bound the keys it could hold, so the
/// search narrows to one slab in O(log slab count), then scans that
/// slab's handful of rows linearly.
fn binary_search_slabs(table: &TableHandle, resolved: &[(ColumnDescriptor, &[u8])]) -> Result<Option<(u32, u8)>> {
    let inner = table.segment().inner().lock().unwrap();
    let table_id = table.table_id();
    let slabs = crate::inode::table_slabs(&inner, table_id)?;

    let mut lo = 0usize;
    let mut hi = slabs.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let slab_index = slabs[mid];
        let rows = slab_row_indices(&inner, table_id, slab_index)?;
        let Some(&first) = rows.first() else {
            return Err(crate::error::TmstatError::damaged(
                "a slab linked into the inode tree has no live rows",
            ));
        };
        let last = *rows.last().unwrap();

        if compare_resolved(&inner, table_id, slab_index, first, resolved)? == Ordering::Greater {
            hi = mid;
            continue;
        }
        if compare_resolved(&inner, table_id, slab_index, last, resolved)? == Ordering::Less {
            lo = mid + 1;
            continue;
        }

        for row_index in rows {
            if compare_resolved(&inner, table_id, slab_index, row_index, resolved)? == Ordering::Equal {
                return Ok(Some((slab_index, row_index)));
            }
        }
        return Ok(None);
    }
    Ok(None)
}

/// Looks up a row by its full key-column tuple. Thin wrapper over
/// [`query`] that builds a predicate for every key column from `key`.
pub fn find_by_key(table: &TableHandle, key: &RowHandle) -> Result<(Option<RowHandle>, QueryPlan)> {
    let key_cols = table.key_columns();
    if key_cols.is_empty() {
        return Ok((None, QueryPlan::LinearScan));
    }
    let mut values = Vec::with_capacity(key_cols.len());
    for col in &key_cols {
        values.push((col.name.clone(), key.get_bytes(&col.name)?));
    }
    let predicates: Vec<(&str, &[u8])> = values.iter().map(|(name, bytes)| (name.as_str(), bytes.as_slice())).collect();
    let (mut rows, plan) = query(table, &predicates)?;
    Ok((rows.pop(), plan))
}
