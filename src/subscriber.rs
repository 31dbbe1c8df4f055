//! The subscriber side of the protocol: discover published segment
//! files, open them read-only, and keep already-open ones current.
//!
//! Grounded on the teacher's mount-table model (`fs.rs`'s fixed
//! `ROOTDEV`/`log` pairing one process to one backing device): here a
//! `Subscriber` is the analogous fixed binding of a process to the set
//! of directories it reads published segments from, captured in
//! `StoreConfig`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

use crate::column::MergeRule;
use crate::config::StoreConfig;
use crate::error::{Result, TmstatError};
use crate::row::RowHandle;
use crate::segment::Segment;
use crate::table::TableHandle;

pub struct Subscriber {
    config: StoreConfig,
    open: Mutex<BTreeMap<PathBuf, Segment>>,
}

impl Subscriber {
    pub fn new(config: StoreConfig) -> Self {
        Subscriber {
            config,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Lists every regular file currently visible in any published
    /// directory. A file's presence here means its publisher has
    /// already completed the atomic rename into place.
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for dir in self.config.published_dirs() {
            let entries = match std::fs::read_dir(dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(TmstatError::io(dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| TmstatError::io(dir, e))?;
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    found.push(entry.path());
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Opens `path` if not already open, or returns the cached handle
    /// after giving it a chance to pick up any growth (§4.7's
    /// outstanding-reference-gated refresh).
    pub fn open(&self, path: &Path) -> Result<Segment> {
        let mut open = self.open.lock().unwrap();
        if let Some(existing) = open.get(path) {
            let seg = existing.clone();
            drop(open);
            seg.refresh()?;
            return Ok(seg);
        }
        let seg = Segment::open_subscriber(path)?;
        debug!("subscribed to segment {}", path.display());
        open.insert(path.to_path_buf(), seg.clone());
        Ok(seg)
    }

    /// Re-checks every currently open segment for growth.
    pub fn refresh_all(&self) -> Result<()> {
        let segments: Vec<Segment> = self.open.lock().unwrap().values().cloned().collect();
        for seg in segments {
            seg.refresh()?;
        }
        Ok(())
    }

    /// Opens `path` and looks up `table_name` in it in one call.
    pub fn table(&self, path: &Path, table_name: &str) -> Result<TableHandle> {
        let segment = self.open(path)?;
        TableHandle::open(&segment, table_name)
    }

    /// Opens every discovered segment that exposes a table named
    /// `table_name`, for feeding into [`crate::merge::union`]. A file
    /// that fails to open (truncated, not a segment, stat failure) is
    /// skipped with a warning rather than failing the whole call, so a
    /// single bad file can never take down an otherwise-healthy union.
    pub fn tables_named(&self, table_name: &str) -> Result<Vec<TableHandle>> {
        let mut out = Vec::new();
        for path in self.discover()? {
            let segment = match self.open(&path) {
                Ok(seg) => seg,
                Err(e) => {
                    warn!("skipping unreadable segment {}: {e}", path.display());
                    continue;
                }
            };
            if let Ok(t) = TableHandle::open(&segment, table_name) {
                out.push(t);
            }
        }
        Ok(out)
    }
}

/// Cached state behind a [`Union`], swapped in whole on rebuild so a
/// reader never sees a half-rebuilt child list.
struct UnionState {
    children: Vec<Segment>,
    table_names: BTreeSet<String>,
    dir_ctimes: BTreeMap<PathBuf, i64>,
    generation: u64,
}

/// A live, queryable view over every segment a [`Subscriber`] can see:
/// an anonymous segment of its own, holding no rows, whose only job is
/// to know which user tables its children expose and to fan a query
/// out across all of them. Mirrors §4.7: built fresh on first use,
/// then rebuilt wholesale whenever a published directory's ctime moves
/// and nothing is still holding a row handle into the old state.
pub struct Union {
    subscriber: Subscriber,
    state: Mutex<UnionState>,
}

impl Union {
    /// Subscribes to `config`'s published directories and builds the
    /// initial child list immediately.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let subscriber = Subscriber::new(config);
        let union = Union {
            subscriber,
            state: Mutex::new(UnionState {
                children: Vec::new(),
                table_names: BTreeSet::new(),
                dir_ctimes: BTreeMap::new(),
                generation: 0,
            }),
        };
        union.rebuild()?;
        Ok(union)
    }

    /// Monotonically increasing count of completed rebuilds, bumped
    /// only when the child list actually changes underneath a caller.
    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Every user table name exposed by at least one child segment.
    pub fn table_names(&self) -> Result<BTreeSet<String>> {
        self.refresh_impl(false)?;
        Ok(self.state.lock().unwrap().table_names.clone())
    }

    /// Every child segment's handle to `table_name`, skipping children
    /// that don't expose it.
    pub fn tables(&self, table_name: &str) -> Result<Vec<TableHandle>> {
        self.refresh_impl(false)?;
        let children = self.state.lock().unwrap().children.clone();
        let mut out = Vec::new();
        for child in &children {
            if let Ok(t) = TableHandle::open(child, table_name) {
                out.push(t);
            }
        }
        Ok(out)
    }

    /// Evaluates `predicates` against `table_name` across every child,
    /// refreshing first if nothing is holding the union open. Rows
    /// from different children with equal key-column bytes are merged
    /// by the table's own column rules, the same query-time merge
    /// §4.6 describes for any other multi-source read.
    pub fn query(&self, table_name: &str, predicates: &[(&str, &[u8])]) -> Result<Vec<RowHandle>> {
        self.refresh_impl(false)?;
        let tables = self.tables(table_name)?;
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let columns = tables[0].columns();
        let mut rows = Vec::new();
        for table in &tables {
            if table.columns() != columns {
                continue;
            }
            let (found, _) = crate::query::query(table, predicates)?;
            rows.extend(found);
        }
        if rows.len() <= 1 || !columns.iter().any(|c| c.rule != MergeRule::Key) {
            return Ok(rows);
        }
        let row_size = tables[0].row_size();
        let cols_arc: std::sync::Arc<[crate::column::ColumnDescriptor]> = columns.clone().into();
        let merged = crate::merge::merge_rows(&rows, &columns)?;
        drop(rows);
        let out = merged
            .into_values()
            .map(|bytes| {
                let mut row = RowHandle::pseudo(row_size, cols_arc.clone());
                row.write_bytes(&bytes)?;
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(out)
    }

    /// Rebuilds now if a published directory's ctime has moved since
    /// the last rebuild and nothing is outstanding against the current
    /// children. Returns whether a rebuild actually happened.
    pub fn refresh(&self) -> Result<bool> {
        self.refresh_impl(false)
    }

    /// Rebuilds unconditionally, ignoring cached directory ctimes, as
    /// long as nothing is outstanding against the current children.
    pub fn force_refresh(&self) -> Result<bool> {
        self.refresh_impl(true)
    }

    fn refresh_impl(&self, force: bool) -> Result<bool> {
        {
            let state = self.state.lock().unwrap();
            if state.children.iter().any(|c| c.inner().lock().unwrap().outstanding > 0) {
                return Ok(false);
            }
            if !force {
                let mut unchanged = true;
                for dir in self.subscriber.config.published_dirs() {
                    let current = dir_ctime(dir);
                    if current != state.dir_ctimes.get(dir).copied() {
                        unchanged = false;
                        break;
                    }
                }
                if unchanged && !state.children.is_empty() {
                    return Ok(false);
                }
            }
        }
        self.rebuild()?;
        Ok(true)
    }

    fn rebuild(&self) -> Result<()> {
        let mut dir_ctimes = BTreeMap::new();
        for dir in self.subscriber.config.published_dirs() {
            if let Some(ctime) = dir_ctime(dir) {
                dir_ctimes.insert(dir.clone(), ctime);
            }
        }
        let mut children = Vec::new();
        for path in self.subscriber.discover()? {
            match self.subscriber.open(&path) {
                Ok(seg) => children.push(seg),
                Err(e) => warn!("union: skipping unreadable segment {}: {e}", path.display()),
            }
        }
        let mut table_names = BTreeSet::new();
        for child in &children {
            let names = child.inner().lock().unwrap().table_ids_by_name.keys().cloned().collect::<Vec<_>>();
            table_names.extend(names);
        }

        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.children = children;
        state.table_names = table_names;
        state.dir_ctimes = dir_ctimes;
        Ok(())
    }
}

fn dir_ctime(dir: &Path) -> Option<i64> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(dir).ok().map(|m| m.ctime())
}
