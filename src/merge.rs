//! Multi-segment union and the sorted merge-to-file writer.
//!
//! No teacher file merges anything; this is modeled on the sibling
//! examples' LSM-style compaction (`fjall-rs-lsm-tree`): scan every
//! source in parallel, collate into an ordered map keyed by key-column
//! bytes, apply each column's merge rule, then replay the map in order
//! into a destination that is sorted by construction.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::Path;

use crate::column::{ColumnDescriptor, ColumnSpec, DataType, MergeRule};
use crate::error::{Result, TmstatError};
use crate::query::scan;
use crate::row::RowHandle;
use crate::segment::Segment;
use crate::table::TableHandle;

/// Merges rows from every table in `tables` (which must share an
/// identical column layout) into one ordered map keyed by the
/// concatenated bytes of the key columns, applying each non-key
/// column's merge rule across duplicates.
pub fn union(tables: &[TableHandle]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    if tables.is_empty() {
        return Ok(BTreeMap::new());
    }
    let columns = tables[0].columns();
    for t in &tables[1..] {
        if t.columns() != columns {
            return Err(TmstatError::invalid("union: tables have mismatched schemas"));
        }
    }
    let mut rows = Vec::new();
    for table in tables {
        rows.extend(scan(table)?);
    }
    merge_rows(&rows, &columns)
}

/// Merges an already-gathered set of rows sharing `columns` into one
/// ordered map keyed by the concatenated bytes of the key columns.
/// Split out from [`union`] so a caller that has already filtered
/// rows down by predicate (a union query, not a whole-table scan) can
/// merge just that subset without re-scanning anything.
pub fn merge_rows(rows: &[RowHandle], columns: &[ColumnDescriptor]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let key_cols: Vec<_> = columns.iter().filter(|c| c.rule == MergeRule::Key).cloned().collect();
    if key_cols.is_empty() {
        return Err(TmstatError::invalid("merge: table has no key columns"));
    }

    let mut acc: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    for row in rows {
        let mut key = Vec::new();
        for c in &key_cols {
            key.extend_from_slice(&row.get_bytes(&c.name)?);
        }
        let bytes = row.to_vec();
        match acc.entry(key) {
            Entry::Occupied(mut e) => merge_row(e.get_mut(), &bytes, columns)?,
            Entry::Vacant(e) => {
                e.insert(bytes);
            }
        }
    }
    Ok(acc)
}

fn merge_row(existing: &mut [u8], incoming: &[u8], columns: &[ColumnDescriptor]) -> Result<()> {
    for col in columns {
        let start = col.offset as usize;
        let end = start + col.size as usize;
        match col.rule {
            MergeRule::Key => {}
            MergeRule::Or => {
                for i in start..end {
                    existing[i] |= incoming[i];
                }
            }
            MergeRule::Sum => combine_numeric(&mut existing[start..end], &incoming[start..end], col.rule, col.data_type)?,
            MergeRule::Min | MergeRule::Max => {
                combine_min_max(&mut existing[start..end], &incoming[start..end], col.rule, col.data_type)?
            }
        }
    }
    Ok(())
}

/// `min`/`max` outside the numeric types compare byte-for-byte, the
/// way the original's merge routine falls back to `memcmp` for
/// anything that isn't `TMSTAT_T_SIGNED`/`TMSTAT_T_UNSIGNED`: a hex or
/// binary column has no sign to speak of, and a text column is
/// ordered the same way its key-column comparisons already are.
fn combine_min_max(existing: &mut [u8], incoming: &[u8], rule: MergeRule, data_type: DataType) -> Result<()> {
    if matches!(data_type, DataType::Signed | DataType::Unsigned) {
        return combine_numeric(existing, incoming, rule, data_type);
    }
    let replace = match rule {
        MergeRule::Min => incoming < existing,
        MergeRule::Max => incoming > existing,
        _ => unreachable!(),
    };
    if replace {
        existing.copy_from_slice(incoming);
    }
    Ok(())
}

fn combine_numeric(existing: &mut [u8], incoming: &[u8], rule: MergeRule, data_type: DataType) -> Result<()> {
    let signed = matches!(data_type, DataType::Signed);
    let (a, b): (i128, i128) = if signed {
        (read_signed(existing)?, read_signed(incoming)?)
    } else {
        (read_unsigned(existing)? as i128, read_unsigned(incoming)? as i128)
    };
    let result = match rule {
        MergeRule::Sum => a.wrapping_add(b),
        MergeRule::Min => a.min(b),
        MergeRule::Max => a.max(b),
        _ => unreachable!(),
    };
    write_numeric(existing, result, signed)
}

fn read_signed(bytes: &[u8]) -> Result<i128> {
    Ok(match bytes.len() {
        1 => bytes[0] as i8 as i128,
        2 => i16::from_le_bytes(bytes.try_into().unwrap()) as i128,
        4 => i32::from_le_bytes(bytes.try_into().unwrap()) as i128,
        8 => i64::from_le_bytes(bytes.try_into().unwrap()) as i128,
        n => return Err(TmstatError::invalid(format!("merge: unsupported signed column width {n}"))),
    })
}

fn read_unsigned(bytes: &[u8]) -> Result<u128> {
    Ok(match bytes.len() {
        1 => bytes[0] as u128,
        2 => u16::from_le_bytes(bytes.try_into().unwrap()) as u128,
        4 => u32::from_le_bytes(bytes.try_into().unwrap()) as u128,
        8 => u64::from_le_bytes(bytes.try_into().unwrap()) as u128,
        n => return Err(TmstatError::invalid(format!("merge: unsupported unsigned column width {n}"))),
    })
}

fn write_numeric(dst: &mut [u8], value: i128, signed: bool) -> Result<()> {
    match (dst.len(), signed) {
        (1, true) => dst.copy_from_slice(&(value as i8).to_le_bytes()),
        (1, false) => dst.copy_from_slice(&(value as u8).to_le_bytes()),
        (2, true) => dst.copy_from_slice(&(value as i16).to_le_bytes()),
        (2, false) => dst.copy_from_slice(&(value as u16).to_le_bytes()),
        (4, true) => dst.copy_from_slice(&(value as i32).to_le_bytes()),
        (4, false) => dst.copy_from_slice(&(value as u32).to_le_bytes()),
        (8, true) => dst.copy_from_slice(&(value as i64).to_le_bytes()),
        (8, false) => dst.copy_from_slice(&(value as u64).to_le_bytes()),
        (n, _) => return Err(TmstatError::invalid(format!("merge: unsupported numeric column width {n}"))),
    }
    Ok(())
}

/// Merges `tables` and writes the sorted result into a brand new
/// table named `name` inside `dest`. The destination rows land in key
/// order because `BTreeMap` iteration already is; the row count is
/// known up front, so the needed slabs are allocated and linked in one
/// batch (§4.1's batched variant) instead of one slab-link walk per
/// overflow row, and rows are written straight into their slabs rather
/// than through a per-row handle.
pub fn merge_to_file(
    tables: &[TableHandle],
    dest: &Segment,
    name: &str,
    specs: &[ColumnSpec],
) -> Result<TableHandle> {
    let merged = union(tables)?;
    let dest_table = TableHandle::register(dest, name, true, specs)?;
    let table_id = dest_table.table_id();
    let row_size = dest_table.row_size();
    let lpr = crate::wire::lines_per_row(row_size);

    let mut inner = dest.inner().lock().unwrap();
    let locations = crate::inode::alloc_rows_batch(&mut inner, table_id, merged.len() as u32)?;
    for ((slab_index, row_index), bytes) in locations.into_iter().zip(merged.values()) {
        let slab = inner.slab(slab_index)?;
        {
            let mut guard = slab.lock().unwrap();
            guard.row_slice_mut(row_index, lpr)[..bytes.len()].copy_from_slice(bytes);
        }
        inner.sync_slab(slab_index)?;
    }
    drop(inner);
    Ok(dest_table)
}

/// Convenience: merges into a brand new private-file segment and
/// publishes it, the way the publisher side of the protocol produces
/// a new, binary-searchable segment from several live ones.
pub fn merge_to_published_file(
    tables: &[TableHandle],
    private_dir: &Path,
    published_dir: &Path,
    name: &str,
    specs: &[ColumnSpec],
) -> Result<Segment> {
    let (segment, tmp_path) = Segment::create_private(private_dir, name)?;
    merge_to_file(tables, &segment, name, specs)?;
    segment.publish(&tmp_path, published_dir, name)?;
    Ok(segment)
}
