//! Segments: one open store, either a private file a publisher is
//! still building or a read-only mapping a subscriber attached to.
//!
//! The teacher keeps exactly one mounted filesystem behind
//! `ROOTDEV`/`Superblock` plus a small fixed array of in-core
//! `Inode`s (`fs.rs`); a `Segment` here is the userspace analogue —
//! one `SegmentInner` per open store, `Arc<Mutex<_>>`-shared the way
//! the teacher shares an `Arc<MInode>` guarded by a `SleepLock<IData>`.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};
use memmap2::{Mmap, MmapOptions};

use crate::column::ColumnDescriptor;
use crate::config::next_segment_id;
use crate::error::{Result, TmstatError};
use crate::inode::InodeAddr;
use crate::slab::Slab;
use crate::wire::{
    pack_name, unpack_name, ColumnDescriptorWire, TableDescriptorWire, COLUMN_TABLE_ID,
    COLUMN_TABLE_NAME, FIRST_USER_TABLE_ID, INODE_TABLE_ID, INODE_TABLE_NAME, LABEL_TABLE_ID,
    LABEL_TABLE_NAME, NAME_LEN, PAGE_SIZE, TABLE_TABLE_ID, TABLE_TABLE_NAME,
};
use zerocopy::{FromBytes, IntoBytes};

/// In-core metadata for one table, mirroring its `.table`-table row.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: String,
    pub table_id: u16,
    pub root: InodeAddr,
    pub row_count: u32,
    pub row_size: u16,
    pub sorted: bool,
    pub columns: Vec<ColumnDescriptor>,
    /// Where this table's own row lives inside the `.table` table.
    /// Null until the bootstrap sequence allocates it.
    pub descriptor_addr: InodeAddr,
}

impl TableMeta {
    fn bootstrap(name: &str, table_id: u16, row_size: u16) -> Self {
        TableMeta {
            name: name.to_string(),
            table_id,
            root: InodeAddr::NULL,
            row_count: 0,
            row_size,
            sorted: false,
            columns: Vec::new(),
            descriptor_addr: InodeAddr::NULL,
        }
    }
}

/// How a segment came to be open: a publisher's in-progress file, or
/// a subscriber's read-only mapping.
pub enum SegmentOrigin {
    Created { path: Option<PathBuf> },
    Subscribed { path: PathBuf, last_ctime: i64 },
}

pub struct SegmentInner {
    pub id: u32,
    pub slabs: Vec<Arc<Mutex<Slab>>>,
    pub tables: BTreeMap<u16, TableMeta>,
    pub table_ids_by_name: BTreeMap<String, u16>,
    pub partial: BTreeMap<u16, VecDeque<u32>>,
    /// Slabs fully emptied and unlinked from their table's tree by
    /// `free_row`, kept around to be relinked by a future allocation
    /// instead of growing `slabs` with a brand new page.
    pub free_slabs: BTreeMap<u16, VecDeque<u32>>,
    pub next_table_id: u16,
    pub file: Option<File>,
    pub mmap: Option<Arc<Mmap>>,
    pub origin: SegmentOrigin,
    pub outstanding: u64,
    pub generation: u64,
}

impl SegmentInner {
    pub fn slab(&self, index: u32) -> Result<Arc<Mutex<Slab>>> {
        self.slabs
            .get(index as usize)
            .cloned()
            .ok_or_else(|| TmstatError::corrupt(format!("slab index {index} out of range")))
    }

    pub fn is_writable(&self) -> bool {
        self.mmap.is_none()
    }

    /// Reads and validates a data slab's header against this segment's
    /// id and the table that is supposed to own it, logging a warning
    /// before surfacing the error: a bad magic or owning-table mismatch
    /// means the slab (or the caller's bookkeeping) is corrupt, and any
    /// read past this point would misinterpret someone else's bytes.
    pub fn validated_header(&self, slab_index: u32, table_id: u16) -> Result<crate::wire::SlabHeaderWire> {
        let slab = self.slab(slab_index)?;
        let guard = slab.lock().unwrap();
        guard.validate(self.id, table_id).inspect_err(|e| {
            log::warn!("slab {slab_index} failed validation for table {table_id}: {e}");
        })
    }

    /// Appends a fresh, zeroed, owned slab for `table_id` and writes
    /// its header; returns the new slab's index.
    pub fn push_new_slab(&mut self, table_id: u16, lines_per_row: u16) -> Result<u32> {
        if !self.is_writable() {
            return Err(TmstatError::invalid("segment is read-only"));
        }
        // An inode address packs the slab index into the high 24 bits
        // (`slab_index << 8 | row_index`), so a segment can never hold
        // more slabs than that field can address.
        if self.slabs.len() >= (1 << 24) {
            return Err(TmstatError::OutOfMemory("slab index space exhausted"));
        }
        let idx = self.slabs.len() as u32;
        let mut slab = Slab::new_owned();
        let header = crate::wire::SlabHeaderWire {
            magic: crate::wire::SLAB_MAGIC,
            table_id,
            lines_per_row,
            row_bitmap: 0,
            own_inode_address: InodeAddr::leaf(idx).0,
            parent_inode_address: 0,
            owning_segment_id: self.id,
            _reserved: [0; 36],
        };
        slab.set_header(&header);
        self.slabs.push(Arc::new(Mutex::new(slab)));
        self.sync_slab(idx)?;
        Ok(idx)
    }

    /// Writes a single slab's full page back to the backing file, if
    /// any. In-memory-only segments (no path given to `create`) skip
    /// this entirely.
    pub fn sync_slab(&mut self, index: u32) -> Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let slab = self.slab(index)?;
        let guard = slab.lock().unwrap();
        let offset = index as u64 * PAGE_SIZE as u64;
        file.write_at(guard.backing.as_slice(), offset)
            .map_err(|e| TmstatError::io(self.path().unwrap_or(Path::new("<segment>")), e))?;
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        match &self.origin {
            SegmentOrigin::Created { path } => path.as_deref(),
            SegmentOrigin::Subscribed { path, .. } => Some(path),
        }
    }

    /// Serializes a table's current metadata into its `.table`-table
    /// row. A no-op until the bootstrap sequence has given the table
    /// a `descriptor_addr` (true only for `.table` itself, briefly,
    /// while it is allocating its own first row).
    pub fn sync_table_descriptor(&mut self, table_id: u16) -> Result<()> {
        let meta = self
            .tables
            .get(&table_id)
            .ok_or_else(|| TmstatError::corrupt("sync_table_descriptor: unknown table"))?;
        if meta.descriptor_addr.is_null() {
            return Ok(());
        }
        let wire = TableDescriptorWire {
            name: pack_name::<NAME_LEN>(&meta.name),
            inode_root: meta.root.0,
            row_count: meta.row_count,
            row_size: meta.row_size,
            column_count: meta.columns.len() as u16,
            table_id: meta.table_id,
            sorted: meta.sorted as u8,
            _reserved: 0,
        };
        let addr = meta.descriptor_addr;
        let slab = self.slab(addr.slab_index())?;
        {
            let mut guard = slab.lock().unwrap();
            wire.write_to_prefix(guard.row_slice_mut(addr.row_index(), 1))
                .map_err(|_| TmstatError::corrupt("table descriptor row too small"))?;
        }
        self.sync_slab(addr.slab_index())
    }

    /// Writes one column's descriptor into the `.column` table at a
    /// caller-allocated row.
    pub fn write_column_descriptor(&mut self, addr: InodeAddr, col: &ColumnDescriptor) -> Result<()> {
        let wire = ColumnDescriptorWire {
            name: pack_name::<NAME_LEN>(&col.name),
            table_id: col.table_id,
            offset: col.offset,
            size: col.size,
            data_type: col.data_type.to_wire(),
            rule: col.rule.to_wire(),
        };
        let slab = self.slab(addr.slab_index())?;
        {
            let mut guard = slab.lock().unwrap();
            wire.write_to_prefix(guard.row_slice_mut(addr.row_index(), 1))
                .map_err(|_| TmstatError::corrupt("column descriptor row too small"))?;
        }
        self.sync_slab(addr.slab_index())
    }

    pub fn read_column_descriptor(&self, addr: InodeAddr) -> Result<ColumnDescriptor> {
        let slab = self.slab(addr.slab_index())?;
        let guard = slab.lock().unwrap();
        let (wire, _) = ColumnDescriptorWire::read_from_prefix(guard.row_slice(addr.row_index(), 1))
            .map_err(|_| TmstatError::corrupt("bad column descriptor row"))?;
        Ok(ColumnDescriptor {
            name: unpack_name(&wire.name),
            table_id: wire.table_id,
            offset: wire.offset,
            size: wire.size,
            data_type: crate::column::DataType::from_wire(wire.data_type)?,
            rule: crate::column::MergeRule::from_wire(wire.rule)?,
        })
    }

    pub fn allocate_table_id(&mut self) -> u16 {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }
}

/// Builds the four bootstrap tables (`.table`, `.inode`, `.label`,
/// `.column`) and gives `.table` a descriptor row for each, including
/// itself (§3's "row 0/1/2... of the `.table` table").
fn bootstrap(seg: &mut SegmentInner) -> Result<()> {
    seg.tables.insert(
        TABLE_TABLE_ID,
        TableMeta::bootstrap(
            TABLE_TABLE_NAME,
            TABLE_TABLE_ID,
            std::mem::size_of::<TableDescriptorWire>() as u16,
        ),
    );
    seg.tables.insert(
        INODE_TABLE_ID,
        TableMeta::bootstrap(
            INODE_TABLE_NAME,
            INODE_TABLE_ID,
            crate::wire::LINE_SIZE as u16,
        ),
    );
    seg.tables.insert(
        LABEL_TABLE_ID,
        TableMeta::bootstrap(
            LABEL_TABLE_NAME,
            LABEL_TABLE_ID,
            std::mem::size_of::<crate::wire::LabelRowWire>() as u16,
        ),
    );
    seg.tables.insert(
        COLUMN_TABLE_ID,
        TableMeta::bootstrap(
            COLUMN_TABLE_NAME,
            COLUMN_TABLE_ID,
            std::mem::size_of::<ColumnDescriptorWire>() as u16,
        ),
    );

    for (name, id) in [
        (TABLE_TABLE_NAME, TABLE_TABLE_ID),
        (INODE_TABLE_NAME, INODE_TABLE_ID),
        (LABEL_TABLE_NAME, LABEL_TABLE_ID),
        (COLUMN_TABLE_NAME, COLUMN_TABLE_ID),
    ] {
        seg.table_ids_by_name.insert(name.to_string(), id);
        let (slab, row) = crate::inode::alloc_row(seg, TABLE_TABLE_ID)?;
        let addr = InodeAddr::row(slab, row);
        seg.tables.get_mut(&id).unwrap().descriptor_addr = addr;
        seg.sync_table_descriptor(id)?;
    }

    for col in crate::label::bootstrap_columns() {
        let (cslab, crow) = crate::inode::alloc_row(seg, COLUMN_TABLE_ID)?;
        seg.write_column_descriptor(InodeAddr::row(cslab, crow), &col)?;
    }
    seg.tables.get_mut(&LABEL_TABLE_ID).unwrap().columns = crate::label::bootstrap_columns();
    seg.sync_table_descriptor(LABEL_TABLE_ID)?;

    seg.next_table_id = FIRST_USER_TABLE_ID;
    Ok(())
}

/// A cheap-to-clone handle to an open segment; every public operation
/// goes through the mutex the way the teacher routes every inode
/// access through its `SleepLock`.
#[derive(Clone)]
pub struct Segment(pub(crate) Arc<Mutex<SegmentInner>>);

impl Segment {
    /// Creates a brand new, empty, in-memory segment.
    pub fn create_in_memory() -> Result<Self> {
        let mut inner = SegmentInner {
            id: next_segment_id(),
            slabs: Vec::new(),
            tables: BTreeMap::new(),
            table_ids_by_name: BTreeMap::new(),
            partial: BTreeMap::new(),
            free_slabs: BTreeMap::new(),
            next_table_id: FIRST_USER_TABLE_ID,
            file: None,
            mmap: None,
            origin: SegmentOrigin::Created { path: None },
            outstanding: 0,
            generation: 0,
        };
        bootstrap(&mut inner)?;
        Ok(Segment(Arc::new(Mutex::new(inner))))
    }

    /// Creates a new segment backed by a file in `private_dir`, named
    /// after `name`. Every slab write is mirrored to this file as it
    /// happens; `publish` later makes it visible under its real name.
    pub fn create_private(private_dir: &Path, name: &str) -> Result<(Self, PathBuf)> {
        std::fs::create_dir_all(private_dir)
            .map_err(|e| TmstatError::io(private_dir, e))?;
        let tmp_path = private_dir.join(format!(".{name}.{}", std::process::id()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| TmstatError::io(&tmp_path, e))?;

        let mut inner = SegmentInner {
            id: next_segment_id(),
            slabs: Vec::new(),
            tables: BTreeMap::new(),
            table_ids_by_name: BTreeMap::new(),
            partial: BTreeMap::new(),
            free_slabs: BTreeMap::new(),
            next_table_id: FIRST_USER_TABLE_ID,
            file: Some(file),
            mmap: None,
            origin: SegmentOrigin::Created {
                path: Some(tmp_path.clone()),
            },
            outstanding: 0,
            generation: 0,
        };
        bootstrap(&mut inner)?;
        Ok((Segment(Arc::new(Mutex::new(inner))), tmp_path))
    }

    /// Atomically renames the private file into `published_dir` under
    /// `name`, the handoff point subscribers discover by directory
    /// listing or by a known path.
    pub fn publish(&self, tmp_path: &Path, published_dir: &Path, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(published_dir).map_err(|e| TmstatError::io(published_dir, e))?;
        let dest = published_dir.join(name);
        std::fs::rename(tmp_path, &dest).map_err(|e| TmstatError::io(&dest, e))?;
        debug!("published segment {} to {}", name, dest.display());
        Ok(dest)
    }

    /// Opens an existing published segment file read-only, mapping it
    /// whole into memory. This is the subscriber entry point.
    pub fn open_subscriber(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| TmstatError::io(path, e))?;
        let meta = file.metadata().map_err(|e| TmstatError::io(path, e))?;
        let ctime = file_ctime(&meta);
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| TmstatError::io(path, e))?
        };
        if mmap.len() % PAGE_SIZE != 0 || mmap.is_empty() {
            return Err(TmstatError::corrupt("segment file size not a multiple of page size"));
        }
        let mmap = Arc::new(mmap);
        let slab_count = mmap.len() / PAGE_SIZE;
        let slabs: Vec<Arc<Mutex<Slab>>> = (0..slab_count)
            .map(|i| Arc::new(Mutex::new(Slab::new_mapped(mmap.clone(), i * PAGE_SIZE))))
            .collect();
        // Every slab in a segment carries the same owning-segment id
        // (stamped by the publisher at allocation time); adopt it as
        // our own so `validated_header` checks mean something for a
        // subscribed segment instead of comparing against a stub id.
        let id = { slabs[0].lock().unwrap().header()?.owning_segment_id };

        let mut inner = SegmentInner {
            id,
            slabs,
            tables: BTreeMap::new(),
            table_ids_by_name: BTreeMap::new(),
            partial: BTreeMap::new(),
            free_slabs: BTreeMap::new(),
            next_table_id: FIRST_USER_TABLE_ID,
            file: None,
            mmap: Some(mmap),
            origin: SegmentOrigin::Subscribed {
                path: path.to_path_buf(),
                last_ctime: ctime,
            },
            outstanding: 0,
            generation: 0,
        };
        load_catalog(&mut inner)?;
        Ok(Segment(Arc::new(Mutex::new(inner))))
    }

    /// Checks whether the backing file has grown since it was mapped
    /// (or last refreshed) and, if so, remaps it whole and reloads the
    /// catalog. Mirrors the protocol's "detect growth via `fstat`"
    /// step; unlike a literal tail-only extension, this crate remaps
    /// the entire file each time for simplicity.
    pub fn refresh(&self) -> Result<bool> {
        let mut inner = self.0.lock().unwrap();
        let SegmentOrigin::Subscribed { path, last_ctime } = &inner.origin else {
            return Ok(false);
        };
        if inner.outstanding > 0 {
            return Ok(false);
        }
        let path = path.clone();
        let file = File::open(&path).map_err(|e| TmstatError::io(&path, e))?;
        let meta = file.metadata().map_err(|e| TmstatError::io(&path, e))?;
        let new_ctime = file_ctime(&meta);
        if new_ctime == *last_ctime {
            trace!("refresh: {} unchanged since last map", path.display());
            return Ok(false);
        }
        debug!("refresh: {} grew, remapping", path.display());
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| TmstatError::io(&path, e))?
        };
        if mmap.len() % PAGE_SIZE != 0 || mmap.is_empty() {
            return Err(TmstatError::corrupt("segment file size not a multiple of page size"));
        }
        let mmap = Arc::new(mmap);
        let slab_count = mmap.len() / PAGE_SIZE;
        inner.slabs = (0..slab_count)
            .map(|i| Arc::new(Mutex::new(Slab::new_mapped(mmap.clone(), i * PAGE_SIZE))))
            .collect();
        inner.mmap = Some(mmap);
        inner.origin = SegmentOrigin::Subscribed {
            path,
            last_ctime: new_ctime,
        };
        inner.generation += 1;
        drop(inner);
        let mut inner = self.0.lock().unwrap();
        inner.tables.clear();
        inner.table_ids_by_name.clear();
        load_catalog(&mut inner)?;
        Ok(true)
    }

    pub fn id(&self) -> u32 {
        self.0.lock().unwrap().id
    }

    pub fn generation(&self) -> u64 {
        self.0.lock().unwrap().generation
    }

    pub fn table_id(&self, name: &str) -> Option<u16> {
        self.0.lock().unwrap().table_ids_by_name.get(name).copied()
    }

    pub fn inner(&self) -> &Arc<Mutex<SegmentInner>> {
        &self.0
    }

    pub fn downgrade(&self) -> Weak<Mutex<SegmentInner>> {
        Arc::downgrade(&self.0)
    }
}

fn file_ctime(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime()
}

/// Reconstructs the in-core table/column catalog from the bootstrap
/// tables found inside a freshly mapped (or remapped) segment.
pub(crate) fn load_catalog(seg: &mut SegmentInner) -> Result<()> {
    for (name, id, row_size) in [
        (TABLE_TABLE_NAME, TABLE_TABLE_ID, std::mem::size_of::<TableDescriptorWire>() as u16),
        (INODE_TABLE_NAME, INODE_TABLE_ID, crate::wire::LINE_SIZE as u16),
        (LABEL_TABLE_NAME, LABEL_TABLE_ID, std::mem::size_of::<crate::wire::LabelRowWire>() as u16),
        (COLUMN_TABLE_NAME, COLUMN_TABLE_ID, std::mem::size_of::<ColumnDescriptorWire>() as u16),
    ] {
        seg.tables
            .insert(id, TableMeta::bootstrap(name, id, row_size));
        seg.table_ids_by_name.insert(name.to_string(), id);
    }

    // `.table` must have at least one slab (its own descriptor row).
    // By construction this crate always allocates `.table`'s first
    // row — and therefore its first slab — before anything else, so
    // slab 0 is always `.table`'s root. This bounds a single segment
    // to at most one slab's worth of tables (63); see DESIGN.md.
    if seg.slabs.is_empty() {
        return Err(TmstatError::corrupt("segment has no slabs"));
    }
    let root_header = seg.validated_header(0, TABLE_TABLE_ID)?;
    if root_header.parent_inode_address != 0 {
        return Err(TmstatError::corrupt("slab 0 is not the .table root"));
    }
    {
        let meta = seg.tables.get_mut(&TABLE_TABLE_ID).unwrap();
        meta.root = InodeAddr::leaf(0);
        meta.row_count = root_header.row_bitmap.count_ones();
    }

    // Now that `.table`'s root is known, walk its rows to recover the
    // authoritative descriptor for every table, including user tables
    // created after bootstrap and the corrected state of the four
    // bootstrap tables themselves (row_size, sorted flag, real root).
    let table_root = seg.tables[&TABLE_TABLE_ID].root;
    let mut max_table_id = FIRST_USER_TABLE_ID - 1;
    if !table_root.is_null() {
        for slab_idx in crate::inode::table_slabs(seg, TABLE_TABLE_ID)? {
            let header = seg.validated_header(slab_idx, TABLE_TABLE_ID)?;
            let slab = seg.slab(slab_idx)?;
            let guard = slab.lock().unwrap();
            for row in 0..crate::wire::rows_per_slab(header.lines_per_row * crate::wire::LINE_SIZE as u16) as u8 {
                if header.row_bitmap & (1 << row) == 0 {
                    continue;
                }
                let (wire, _) = TableDescriptorWire::read_from_prefix(
                    guard.row_slice(row, header.lines_per_row),
                )
                .map_err(|_| TmstatError::corrupt("bad table descriptor row"))?;
                let name = unpack_name(&wire.name);
                let descriptor_addr = InodeAddr::row(slab_idx, row);
                let meta = TableMeta {
                    name: name.clone(),
                    table_id: wire.table_id,
                    root: InodeAddr(wire.inode_root),
                    row_count: wire.row_count,
                    row_size: wire.row_size,
                    sorted: wire.sorted != 0,
                    columns: Vec::new(),
                    descriptor_addr,
                };
                max_table_id = max_table_id.max(wire.table_id);
                seg.tables.insert(wire.table_id, meta);
                seg.table_ids_by_name.insert(name, wire.table_id);
            }
        }
    }
    seg.next_table_id = max_table_id + 1;

    // Load column descriptors for every table from `.column`.
    let column_root = seg.tables[&COLUMN_TABLE_ID].root;
    if !column_root.is_null() {
        for slab_idx in crate::inode::table_slabs(seg, COLUMN_TABLE_ID)? {
            let header = seg.validated_header(slab_idx, COLUMN_TABLE_ID)?;
            let (bitmap, lpr) = (header.row_bitmap, header.lines_per_row);
            let rows = crate::wire::rows_per_slab(lpr * crate::wire::LINE_SIZE as u16) as u8;
            for row in 0..rows {
                if bitmap & (1 << row) == 0 {
                    continue;
                }
                let addr = InodeAddr::row(slab_idx, row);
                let col = seg.read_column_descriptor(addr)?;
                if let Some(meta) = seg.tables.get_mut(&col.table_id) {
                    meta.columns.push(col);
                }
            }
        }
    }
    for meta in seg.tables.values_mut() {
        meta.columns.sort_by_key(|c| c.offset);
    }

    Ok(())
}
