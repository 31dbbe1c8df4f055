//! The `.label` table: human-readable annotations timestamped at
//! creation, grouped under a caller-chosen tree prefix.
//!
//! Grounded on the original's label tree, simplified per its own
//! design note: instead of a full prefix trie, `tree_prefix` is an
//! opaque caller-supplied grouping key (e.g. a table id) compared for
//! equality, not walked as a tree. The teacher has no analogue for
//! this — it is modeled after `.table`'s own bootstrap-row convention
//! (a flat table holding one row per named thing).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::column::{ColumnDescriptor, DataType, MergeRule};
use crate::error::{Result, TmstatError};
use crate::inode::InodeAddr;
use crate::segment::Segment;
use crate::wire::{pack_name, unpack_name, LabelRowWire, CTIME_TEXT_LEN, LABEL_NAME_LEN, LABEL_TABLE_ID};
use zerocopy::{FromBytes, IntoBytes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub time: i64,
    pub tree_prefix: u64,
    pub name: String,
    pub ctime_text: String,
}

/// Creates a new label row, stamped with the current time.
pub fn create_label(segment: &Segment, name: &str, tree_prefix: u64) -> Result<()> {
    if name.is_empty() || name.len() >= LABEL_NAME_LEN {
        return Err(TmstatError::invalid(format!("label name '{name}' has invalid length")));
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut inner = segment.inner().lock().unwrap();
    let (slab, row) = crate::inode::alloc_row(&mut inner, LABEL_TABLE_ID)?;
    let wire = LabelRowWire {
        time: now,
        tree_prefix: tree_prefix.to_le_bytes(),
        name: pack_name::<LABEL_NAME_LEN>(name),
        ctime_text: pack_name::<CTIME_TEXT_LEN>(&format_ctime(now)),
        _reserved: [0; 6],
    };
    let addr = InodeAddr::row(slab, row);
    {
        let slab_arc = inner.slab(slab)?;
        let mut guard = slab_arc.lock().unwrap();
        wire.write_to(guard.row_slice_mut(addr.row_index(), 1))
            .map_err(|_| TmstatError::corrupt("label row too small"))?;
    }
    inner.sync_slab(slab)
}

/// Lists every label under `tree_prefix`, in creation order.
pub fn list_labels(segment: &Segment, tree_prefix: u64) -> Result<Vec<Label>> {
    let inner = segment.inner().lock().unwrap();
    let mut out = Vec::new();
    for slab_index in crate::inode::table_slabs(&inner, LABEL_TABLE_ID)? {
        let header = inner.validated_header(slab_index, LABEL_TABLE_ID)?;
        let slab = inner.slab(slab_index)?;
        let guard = slab.lock().unwrap();
        let rows = crate::wire::rows_per_slab(header.lines_per_row * crate::wire::LINE_SIZE as u16) as u8;
        for row_index in 0..rows {
            if header.row_bitmap & (1 << row_index) == 0 {
                continue;
            }
            let wire = LabelRowWire::read_from_bytes(guard.row_slice(row_index, 1))
                .map_err(|_| TmstatError::corrupt("bad label row"))?;
            if u64::from_le_bytes(wire.tree_prefix) != tree_prefix {
                continue;
            }
            out.push(Label {
                time: wire.time,
                tree_prefix,
                name: unpack_name(&wire.name),
                ctime_text: unpack_name(&wire.ctime_text),
            });
        }
    }
    out.sort_by_key(|l| l.time);
    Ok(out)
}

/// The bootstrap column descriptors recorded for `.label` in
/// `.column`, registered once by `segment::bootstrap`. Exposed so
/// callers inspecting the catalog see a real schema rather than an
/// empty column list for this one hidden table.
pub(crate) fn bootstrap_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor {
            name: "time".into(),
            table_id: LABEL_TABLE_ID,
            offset: 0,
            size: 8,
            data_type: DataType::Signed,
            rule: MergeRule::Key,
        },
        ColumnDescriptor {
            name: "tree_prefix".into(),
            table_id: LABEL_TABLE_ID,
            offset: 8,
            size: 8,
            data_type: DataType::Hex,
            rule: MergeRule::Key,
        },
        ColumnDescriptor {
            name: "name".into(),
            table_id: LABEL_TABLE_ID,
            offset: 16,
            size: LABEL_NAME_LEN as u16,
            data_type: DataType::Text,
            rule: MergeRule::Or,
        },
    ]
}

/// Formats a Unix timestamp the way `ctime(3)` would, without pulling
/// in a calendar crate: `Www Mmm dd hh:mm:ss yyyy`, UTC.
fn format_ctime(secs: i64) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let days_since_epoch = secs.div_euclid(86400);
    let secs_of_day = secs.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days_since_epoch);
    let weekday = DAYS[(days_since_epoch.rem_euclid(7)) as usize];
    let hh = secs_of_day / 3600;
    let mm = (secs_of_day % 3600) / 60;
    let ss = secs_of_day % 60;
    format!(
        "{} {} {:02} {:02}:{:02}:{:02} {}",
        weekday,
        MONTHS[(m - 1) as usize],
        d,
        hh,
        mm,
        ss,
        y
    )
}

/// Howard Hinnant's `civil_from_days`: days-since-epoch to (year, month, day).
fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as i64;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as i64;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
