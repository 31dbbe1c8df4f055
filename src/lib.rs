//! A lightweight, embeddable columnar statistics store: a process
//! publishes slab-backed tables of counters to a well-known directory
//! as a single mmap-able file; any number of unrelated processes
//! subscribe by mapping that file read-only, and a separate tool can
//! union several such segments into one merged, sorted view.
//!
//! Module layout mirrors the on-disk structure bottom-up: [`wire`]
//! fixes the byte shapes, [`slab`] and [`inode`] build the page
//! allocator and its tree, [`column`]/[`table`]/[`label`] describe the
//! catalog stored inside that tree, [`row`] is the per-row handle
//! returned by inserts and queries, [`segment`] ties a whole store
//! together (creation, file-backing, subscriber mapping), and
//! [`query`]/[`merge`]/[`subscriber`]/[`extractor`] are the operations
//! built on top.

pub mod column;
pub mod config;
pub mod error;
pub mod extractor;
pub mod inode;
pub mod label;
pub mod merge;
pub mod query;
pub mod row;
pub mod segment;
pub mod slab;
pub mod subscriber;
pub mod table;
pub mod wire;

pub use column::{ColumnDescriptor, ColumnSpec, DataType, MergeRule};
pub use config::StoreConfig;
pub use error::{Result, TmstatError};
pub use query::QueryPlan;
pub use row::RowHandle;
pub use segment::Segment;
pub use subscriber::{Subscriber, Union};
pub use table::TableHandle;

use std::path::{Path, PathBuf};

/// The publisher-side facade: one open segment plus the directories
/// it will eventually be published into. Mirrors how a teacher-style
/// filesystem binds one `Superblock` to one mounted device — here a
/// `Store` binds one in-progress `Segment` to its publish target.
pub struct Store {
    segment: Segment,
    tmp_path: Option<PathBuf>,
    published_dir: PathBuf,
    name: String,
}

impl Store {
    /// Creates a new store file in `config`'s private directory,
    /// named `name`. Nothing is visible to subscribers until
    /// [`Store::publish`] is called.
    pub fn create(config: &StoreConfig, name: &str) -> Result<Self> {
        let published_dir = config
            .published_dirs()
            .first()
            .cloned()
            .unwrap_or_else(|| config.private_dir().to_path_buf());
        let (segment, tmp_path) = Segment::create_private(config.private_dir(), name)?;
        Ok(Store {
            segment,
            tmp_path: Some(tmp_path),
            published_dir,
            name: name.to_string(),
        })
    }

    /// A store that lives only in memory, useful for tests and for
    /// building a merge destination that is published manually.
    pub fn create_in_memory(name: &str) -> Result<Self> {
        Ok(Store {
            segment: Segment::create_in_memory()?,
            tmp_path: None,
            published_dir: PathBuf::new(),
            name: name.to_string(),
        })
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn register_table(&self, name: &str, sorted: bool, columns: &[ColumnSpec]) -> Result<TableHandle> {
        TableHandle::register(&self.segment, name, sorted, columns)
    }

    pub fn table(&self, name: &str) -> Result<TableHandle> {
        TableHandle::open(&self.segment, name)
    }

    pub fn label(&self, name: &str, tree_prefix: u64) -> Result<()> {
        label::create_label(&self.segment, name, tree_prefix)
    }

    pub fn labels(&self, tree_prefix: u64) -> Result<Vec<label::Label>> {
        label::list_labels(&self.segment, tree_prefix)
    }

    /// Publishes the store file into its configured published
    /// directory under its own name, making it visible to subscribers.
    pub fn publish(&mut self) -> Result<PathBuf> {
        let tmp_path = self
            .tmp_path
            .take()
            .ok_or_else(|| TmstatError::invalid("store has no backing file to publish"))?;
        self.segment.publish(&tmp_path, &self.published_dir, &self.name)
    }

    /// Publishes into an explicit directory, overriding the one given
    /// at construction time.
    pub fn publish_to(&mut self, dir: &Path) -> Result<PathBuf> {
        let tmp_path = self
            .tmp_path
            .take()
            .ok_or_else(|| TmstatError::invalid("store has no backing file to publish"))?;
        self.segment.publish(&tmp_path, dir, &self.name)
    }
}
