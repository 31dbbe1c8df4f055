//! Recovery from a leftover private-directory file: a publisher that
//! crashed before its atomic rename leaves a page-aligned blob of
//! valid slabs behind. The extractor groups those slabs by their
//! `owning_segment_id` stamp and reconstructs one read-only `Segment`
//! per id, independent of any file naming convention.
//!
//! No teacher file does this either; it plays the role the teacher's
//! `log.rs` recovery pass plays after an unclean shutdown — replaying
//! committed-but-not-yet-installed blocks — except here every slab is
//! already self-describing, so "replay" is just "group and load".

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Result, TmstatError};
use crate::segment::{self, Segment, SegmentInner, SegmentOrigin};
use crate::slab::{Backing, Slab};
use crate::wire::{PAGE_SIZE, SLAB_MAGIC};

/// Scans `data` page by page and reconstructs one in-memory `Segment`
/// per distinct `owning_segment_id` found among valid slabs. Pages
/// that don't carry the slab magic are skipped rather than treated as
/// fatal, since a private file may have been truncated mid-write.
pub fn extract_segments_from_bytes(data: &[u8]) -> Result<Vec<Segment>> {
    let mut by_segment: BTreeMap<u32, Vec<(u32, [u8; PAGE_SIZE])>> = BTreeMap::new();

    for (page_index, chunk) in data.chunks(PAGE_SIZE).enumerate() {
        if chunk.len() != PAGE_SIZE {
            break;
        }
        let magic = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
        if magic != SLAB_MAGIC {
            continue;
        }
        // magic(4) + table_id(2) + lines_per_row(2) + row_bitmap(8) +
        // own_inode_address(4) + parent_inode_address(4) = offset 24.
        let owning_segment_id = u32::from_le_bytes(chunk[24..28].try_into().unwrap());
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(chunk);
        by_segment
            .entry(owning_segment_id)
            .or_default()
            .push((page_index as u32, page));
    }

    let mut out = Vec::new();
    for (segment_id, mut pages) in by_segment {
        pages.sort_by_key(|(idx, _)| *idx);
        let slabs: Vec<Arc<Mutex<Slab>>> = pages
            .into_iter()
            .map(|(_, bytes)| {
                Arc::new(Mutex::new(Slab {
                    backing: Backing::Owned(Box::new(bytes)),
                }))
            })
            .collect();

        let mut inner = SegmentInner {
            id: segment_id,
            slabs,
            tables: BTreeMap::new(),
            table_ids_by_name: BTreeMap::new(),
            partial: BTreeMap::new(),
            free_slabs: BTreeMap::new(),
            next_table_id: crate::wire::FIRST_USER_TABLE_ID,
            file: None,
            mmap: None,
            origin: SegmentOrigin::Created { path: None },
            outstanding: 0,
            generation: 0,
        };
        segment::load_catalog(&mut inner)?;
        out.push(Segment(Arc::new(Mutex::new(inner))));
    }
    Ok(out)
}

/// Reads `path` in full and extracts every recoverable segment from
/// it. Intended for salvaging a publisher's private directory after
/// an unclean exit, before that directory is cleaned up.
pub fn extract_from_file(path: &Path) -> Result<Vec<Segment>> {
    let data = std::fs::read(path).map_err(|e| TmstatError::io(path, e))?;
    extract_segments_from_bytes(&data)
}
