//! Inode addressing and the per-table tree that links slabs.
//!
//! The teacher's two-level direct/indirect block addressing in
//! `fs.rs::IData::bmap` (`NDIRECT` inline, one indirect block for the
//! rest) is the same shape as this module's root-is-leaf /
//! root-is-inode-row / chained-inode-rows progression, generalized
//! from "blocks of a file" to "slabs of a table" and from a two-level
//! cap to an unbounded `next`-linked chain (§4.1).

use zerocopy::{FromBytes, IntoBytes};

use crate::error::{Result, TmstatError};
use crate::segment::SegmentInner;
use crate::wire::{
    lines_per_row, rows_per_slab, InodeRowWire, INODE_CHILD_COUNT, INODE_LEAF_MARKER, SLAB_MAGIC,
};

/// `(slab_index << 8) | row_index`, with `0xff` in the low byte
/// meaning "the slab itself" and `0` meaning absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeAddr(pub u32);

impl InodeAddr {
    pub const NULL: InodeAddr = InodeAddr(0);

    pub fn leaf(slab_index: u32) -> Self {
        InodeAddr((slab_index << 8) | INODE_LEAF_MARKER as u32)
    }

    pub fn row(slab_index: u32, row_index: u8) -> Self {
        InodeAddr((slab_index << 8) | row_index as u32)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_leaf(self) -> bool {
        !self.is_null() && (self.0 & 0xff) == INODE_LEAF_MARKER as u32
    }

    pub fn slab_index(self) -> u32 {
        self.0 >> 8
    }

    pub fn row_index(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

fn rps(seg: &SegmentInner, table_id: u16) -> u8 {
    let meta = &seg.tables[&table_id];
    rows_per_slab(meta.row_size) as u8
}

/// Obtains a slab owned by `table_id`, links it into the table's
/// inode tree, and returns its global slab index. Reuses a slab this
/// table previously emptied and detached (§4.1's slab reuse) before
/// appending a brand new page.
fn allocate_slab(seg: &mut SegmentInner, table_id: u16) -> Result<u32> {
    let idx = match seg.free_slabs.get_mut(&table_id).and_then(|q| q.pop_front()) {
        Some(idx) => idx,
        None => {
            let lpr = lines_per_row(seg.tables[&table_id].row_size);
            seg.push_new_slab(table_id, lpr)?
        }
    };
    seg.partial.entry(table_id).or_default().push_back(idx);
    link_slab(seg, table_id, idx)?;
    Ok(idx)
}

/// Slab linking: the three-case algorithm from §4.1.
pub fn link_slab(seg: &mut SegmentInner, table_id: u16, new_slab: u32) -> Result<()> {
    let root = seg.tables[&table_id].root;

    if root.is_null() {
        // Case 1: root is zero.
        set_slab_parent(seg, new_slab, InodeAddr::NULL)?;
        seg.tables.get_mut(&table_id).unwrap().root = InodeAddr::leaf(new_slab);
        sync_table_root(seg, table_id)?;
        return Ok(());
    }

    if root.is_leaf() {
        // Case 2: single-slab table gains a second slab.
        let existing_slab = root.slab_index();
        if existing_slab == new_slab {
            return Ok(());
        }
        let inode_addr = alloc_inode_row(seg, table_id)?;
        write_inode_child(seg, inode_addr, 0, InodeAddr::leaf(existing_slab))?;
        write_inode_child(seg, inode_addr, 1, InodeAddr::leaf(new_slab))?;
        set_slab_parent(seg, existing_slab, inode_addr)?;
        set_slab_parent(seg, new_slab, inode_addr)?;
        seg.tables.get_mut(&table_id).unwrap().root = inode_addr;
        sync_table_root(seg, table_id)?;
        return Ok(());
    }

    // Case 3: root already points at an inode row; walk the
    // `next`-linked chain for a free child slot.
    let mut current = root;
    loop {
        if let Some(slot) = first_empty_child(seg, current)? {
            write_inode_child(seg, current, slot, InodeAddr::leaf(new_slab))?;
            set_slab_parent(seg, new_slab, current)?;
            return Ok(());
        }
        let next = read_inode_row(seg, current)?.next;
        if next == 0 {
            let fresh = alloc_inode_row(seg, table_id)?;
            set_inode_next(seg, current, fresh)?;
            write_inode_child(seg, fresh, 0, InodeAddr::leaf(new_slab))?;
            set_slab_parent(seg, new_slab, fresh)?;
            return Ok(());
        }
        current = InodeAddr(next);
    }
}

/// Inserts an ordered sequence of new slabs efficiently, used by the
/// sorted merge-to-file writer: walks the chain to its current end
/// exactly once and fills every free child slot along the way, rather
/// than restarting the root-to-leaf walk [`link_slab`] does for each
/// individual slab.
pub fn link_slabs_batch(seg: &mut SegmentInner, table_id: u16, new_slabs: &[u32]) -> Result<()> {
    let mut rest = new_slabs;
    if rest.is_empty() {
        return Ok(());
    }

    if seg.tables[&table_id].root.is_null() {
        let (&first, tail) = rest.split_first().unwrap();
        rest = tail;
        set_slab_parent(seg, first, InodeAddr::NULL)?;
        seg.tables.get_mut(&table_id).unwrap().root = InodeAddr::leaf(first);
        sync_table_root(seg, table_id)?;
        if rest.is_empty() {
            return Ok(());
        }
    }

    let root = seg.tables[&table_id].root;
    let mut current = if root.is_leaf() {
        let existing_slab = root.slab_index();
        let (&next_new, tail) = rest.split_first().unwrap();
        rest = tail;
        let inode_addr = alloc_inode_row(seg, table_id)?;
        write_inode_child(seg, inode_addr, 0, InodeAddr::leaf(existing_slab))?;
        write_inode_child(seg, inode_addr, 1, InodeAddr::leaf(next_new))?;
        set_slab_parent(seg, existing_slab, inode_addr)?;
        set_slab_parent(seg, next_new, inode_addr)?;
        seg.tables.get_mut(&table_id).unwrap().root = inode_addr;
        sync_table_root(seg, table_id)?;
        inode_addr
    } else {
        root
    };
    if rest.is_empty() {
        return Ok(());
    }

    loop {
        let next = read_inode_row(seg, current)?.next;
        if next == 0 {
            break;
        }
        current = InodeAddr(next);
    }

    let mut idx = 0usize;
    while idx < rest.len() {
        let mut row = read_inode_row(seg, current)?;
        loop {
            let Some(slot) = row.children.iter().position(|&c| c == 0) else {
                break;
            };
            if idx >= rest.len() {
                break;
            }
            row.children[slot] = InodeAddr::leaf(rest[idx]).0;
            set_slab_parent(seg, rest[idx], current)?;
            idx += 1;
        }
        write_inode_row(seg, current, &row)?;
        if idx < rest.len() {
            let fresh = alloc_inode_row(seg, table_id)?;
            set_inode_next(seg, current, fresh)?;
            current = fresh;
        }
    }
    Ok(())
}

fn first_empty_child(seg: &SegmentInner, inode_addr: InodeAddr) -> Result<Option<u8>> {
    let row = read_inode_row(seg, inode_addr)?;
    Ok(row
        .children
        .iter()
        .position(|&c| c == 0)
        .map(|i| i as u8))
}

fn alloc_inode_row(seg: &mut SegmentInner, _owning_table: u16) -> Result<InodeAddr> {
    let (slab, row) = alloc_row(seg, crate::wire::INODE_TABLE_ID)?;
    let addr = InodeAddr::row(slab, row);
    let empty = InodeRowWire {
        children: [0; INODE_CHILD_COUNT],
        next: 0,
    };
    write_inode_row(seg, addr, &empty)?;
    Ok(addr)
}

fn read_inode_row(seg: &SegmentInner, addr: InodeAddr) -> Result<InodeRowWire> {
    let slab = seg.slab(addr.slab_index())?;
    let guard = slab.lock().unwrap();
    let bytes = guard.row_slice(addr.row_index(), 1);
    InodeRowWire::read_from_bytes(bytes).map_err(|_| TmstatError::corrupt("bad inode row"))
}

fn write_inode_row(seg: &mut SegmentInner, addr: InodeAddr, row: &InodeRowWire) -> Result<()> {
    {
        let slab = seg.slab(addr.slab_index())?;
        let mut guard = slab.lock().unwrap();
        row.write_to(guard.row_slice_mut(addr.row_index(), 1))
            .expect("inode row is exactly one line");
    }
    seg.sync_slab(addr.slab_index())
}

fn write_inode_child(
    seg: &mut SegmentInner,
    inode_addr: InodeAddr,
    slot: u8,
    child: InodeAddr,
) -> Result<()> {
    let mut row = read_inode_row(seg, inode_addr)?;
    row.children[slot as usize] = child.0;
    write_inode_row(seg, inode_addr, &row)
}

fn set_inode_next(seg: &mut SegmentInner, inode_addr: InodeAddr, next: InodeAddr) -> Result<()> {
    let mut row = read_inode_row(seg, inode_addr)?;
    row.next = next.0;
    write_inode_row(seg, inode_addr, &row)
}

fn set_slab_parent(seg: &mut SegmentInner, slab_index: u32, parent: InodeAddr) -> Result<()> {
    let slab = seg.slab(slab_index)?;
    let mut guard = slab.lock().unwrap();
    let mut header = guard.header()?;
    header.parent_inode_address = parent.0;
    guard.set_header(&header);
    drop(guard);
    seg.sync_slab(slab_index)
}

fn sync_table_root(seg: &mut SegmentInner, table_id: u16) -> Result<()> {
    seg.sync_table_descriptor(table_id)
}

/// Allocates a row for `table_id`: picks the front of the partially-
/// filled list, or allocates a fresh slab; sets the first unset
/// bitmap bit; removes the slab from the list if it is now full.
pub fn alloc_row(seg: &mut SegmentInner, table_id: u16) -> Result<(u32, u8)> {
    let slab_index = match seg.partial.get(&table_id).and_then(|q| q.front().copied()) {
        Some(idx) => idx,
        None => allocate_slab(seg, table_id)?,
    };
    let row_index = alloc_row_in_slab(seg, table_id, slab_index)?;

    let meta = seg.tables.get_mut(&table_id).unwrap();
    meta.row_count += 1;
    seg.sync_table_descriptor(table_id)?;

    Ok((slab_index, row_index))
}

/// Sets the first unset bitmap bit of an already-linked slab known to
/// belong to `table_id`, dropping it from the partial-slab queue once
/// full. Shared by [`alloc_row`] and [`alloc_rows_batch`], which differ
/// only in how the slab itself got linked into the tree.
fn alloc_row_in_slab(seg: &mut SegmentInner, table_id: u16, slab_index: u32) -> Result<u8> {
    let rows_per = rps(seg, table_id);
    let row_index;
    let full;
    {
        let slab_arc = seg.slab(slab_index)?;
        let mut guard = slab_arc.lock().unwrap();
        let mut header = guard.header()?;
        let free_bit = (0..rows_per).find(|&i| header.row_bitmap & (1 << i) == 0);
        let bit = free_bit.ok_or_else(|| {
            TmstatError::damaged("slab bitmap saturated but present in partial list")
        })?;
        header.row_bitmap |= 1 << bit;
        guard.set_header(&header);
        row_index = bit;
        full = header.row_bitmap.count_ones() as usize >= rows_per as usize;
    }
    seg.sync_slab(slab_index)?;

    if full {
        if let Some(q) = seg.partial.get_mut(&table_id) {
            q.retain(|&x| x != slab_index);
        }
    }
    Ok(row_index)
}

/// Allocates `count` rows at once, for writers that know their total
/// row count up front (the sorted merge-to-file writer). Existing
/// partially-filled slabs are drained first; any remaining rows get
/// brand new slabs that are linked into the tree in a single chain
/// walk via [`link_slabs_batch`], instead of the `O(chain length)`
/// root-to-leaf walk [`link_slab`] repeats for every individual slab.
pub fn alloc_rows_batch(seg: &mut SegmentInner, table_id: u16, count: u32) -> Result<Vec<(u32, u8)>> {
    let mut out = Vec::with_capacity(count as usize);
    let mut remaining = count;

    while remaining > 0 {
        let Some(slab_index) = seg.partial.get(&table_id).and_then(|q| q.front().copied()) else {
            break;
        };
        out.push((slab_index, alloc_row_in_slab(seg, table_id, slab_index)?));
        remaining -= 1;
    }

    if remaining > 0 {
        let rows_per = rps(seg, table_id) as u32;
        let fresh_slab_count = remaining.div_ceil(rows_per);
        let lpr = lines_per_row(seg.tables[&table_id].row_size);
        let mut new_slabs = Vec::with_capacity(fresh_slab_count as usize);
        for _ in 0..fresh_slab_count {
            let idx = seg.push_new_slab(table_id, lpr)?;
            seg.partial.entry(table_id).or_default().push_back(idx);
            new_slabs.push(idx);
        }
        link_slabs_batch(seg, table_id, &new_slabs)?;

        for slab_index in new_slabs {
            while remaining > 0 && seg.partial.get(&table_id).is_some_and(|q| q.front() == Some(&slab_index)) {
                out.push((slab_index, alloc_row_in_slab(seg, table_id, slab_index)?));
                remaining -= 1;
            }
        }
    }

    let meta = seg.tables.get_mut(&table_id).unwrap();
    meta.row_count += count - remaining;
    seg.sync_table_descriptor(table_id)?;

    Ok(out)
}

/// Frees a row: clears the bitmap bit and zeroes its bytes. If the
/// slab's bitmap reaches zero, unlinks it from the inode tree.
pub fn free_row(seg: &mut SegmentInner, table_id: u16, slab_index: u32, row_index: u8) -> Result<()> {
    let rows_per = rps(seg, table_id);
    let was_full;
    let now_empty;
    {
        let slab_arc = seg.slab(slab_index)?;
        let mut guard = slab_arc.lock().unwrap();
        let header = guard.header()?;
        if header.magic != SLAB_MAGIC || header.table_id != table_id {
            return Err(TmstatError::damaged("free_row: slab/table mismatch"));
        }
        was_full = header.row_bitmap.count_ones() as usize >= rows_per as usize;
        let mut header = header;
        header.row_bitmap &= !(1 << row_index);
        now_empty = header.row_bitmap == 0;
        guard.set_header(&header);
        guard.zero_row(row_index, lines_per_row(seg.tables[&table_id].row_size));
    }
    seg.sync_slab(slab_index)?;

    if was_full {
        seg.partial.entry(table_id).or_default().push_back(slab_index);
    }

    if now_empty && unlink_slab(seg, table_id, slab_index)? {
        // Truly detached from the tree (not the single-slab-root
        // case, which stays put): pull it out of the partial queue
        // so `alloc_row` doesn't hand it out unlinked, and park it on
        // the free list for `allocate_slab` to relink instead of
        // growing the segment with a new page.
        if let Some(q) = seg.partial.get_mut(&table_id) {
            q.retain(|&x| x != slab_index);
        }
        seg.free_slabs.entry(table_id).or_default().push_back(slab_index);
    }

    let meta = seg.tables.get_mut(&table_id).unwrap();
    meta.row_count = meta.row_count.saturating_sub(1);
    seg.sync_table_descriptor(table_id)?;
    Ok(())
}

/// Row-remove bookkeeping: a slab whose bitmap is now empty is
/// unlinked from its owning inode row (found via the slab's own
/// `parent` field); an inode row left with no children is itself
/// unlinked and freed. Returns whether the slab was actually
/// detached from the tree (`false` for the single-slab-root case,
/// which leaves it in place as the still-valid root).
fn unlink_slab(seg: &mut SegmentInner, table_id: u16, slab_index: u32) -> Result<bool> {
    let parent = {
        let slab_arc = seg.slab(slab_index)?;
        let guard = slab_arc.lock().unwrap();
        InodeAddr(guard.header()?.parent_inode_address)
    };

    if parent.is_null() {
        // Single-slab table: leave the (now-empty) slab as root; it
        // is never deallocated, only reused by a future allocation.
        return Ok(false);
    }

    let mut row = read_inode_row(seg, parent)?;
    if let Some(slot) = row.children.iter().position(|&c| InodeAddr(c).slab_index() == slab_index && !InodeAddr(c).is_null()) {
        row.children[slot] = 0;
    }
    write_inode_row(seg, parent, &row)?;
    set_slab_parent(seg, slab_index, InodeAddr::NULL)?;

    if row.children.iter().all(|&c| c == 0) {
        free_empty_inode_row(seg, table_id, parent)?;
    }
    Ok(true)
}

fn free_empty_inode_row(seg: &mut SegmentInner, table_id: u16, addr: InodeAddr) -> Result<()> {
    // Unlink `addr` from whichever inode row's `next` pointed at it,
    // or clear the table root if `addr` was the root itself.
    let root = seg.tables[&table_id].root;
    if root == addr {
        let next = read_inode_row(seg, addr)?.next;
        seg.tables.get_mut(&table_id).unwrap().root = InodeAddr(next);
        sync_table_root(seg, table_id)?;
    } else {
        let mut cur = root;
        loop {
            let row = read_inode_row(seg, cur)?;
            if row.next == addr.0 {
                let grandchild_next = read_inode_row(seg, addr)?.next;
                set_inode_next(seg, cur, InodeAddr(grandchild_next))?;
                break;
            }
            if row.next == 0 {
                break;
            }
            cur = InodeAddr(row.next);
        }
    }
    free_row(
        seg,
        crate::wire::INODE_TABLE_ID,
        addr.slab_index(),
        addr.row_index(),
    )
}

/// Enumerates a table's data slabs in inode order (root-then-chain),
/// used by the query engine to scan or binary-search a table.
pub fn table_slabs(seg: &SegmentInner, table_id: u16) -> Result<Vec<u32>> {
    let root = seg.tables[&table_id].root;
    if root.is_null() {
        return Ok(vec![]);
    }
    if root.is_leaf() {
        return Ok(vec![root.slab_index()]);
    }

    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut cur = root;
    loop {
        let row = read_inode_row(seg, cur)?;
        for &c in &row.children {
            let addr = InodeAddr(c);
            if !addr.is_null() && seen.insert(addr.0) {
                out.push(addr.slab_index());
            }
        }
        if row.next == 0 {
            break;
        }
        cur = InodeAddr(row.next);
    }
    Ok(out)
}
