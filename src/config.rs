//! Injected configuration and the one process-global the design notes
//! sanction: a monotonically increasing segment id counter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SEGMENT_ID: AtomicU32 = AtomicU32::new(1);

/// Allocates the next process-unique segment id, stamped into every
/// slab of a newly created segment so the core-extractor can group
/// slabs by origin.
pub fn next_segment_id() -> u32 {
    NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Directory layout for a store: one private area for in-progress
/// publisher files, and one or more published areas subscribers read.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    private_dir: PathBuf,
    published_dirs: Vec<PathBuf>,
}

impl StoreConfig {
    pub fn new(private_dir: impl Into<PathBuf>, published_dirs: Vec<PathBuf>) -> Self {
        Self {
            private_dir: private_dir.into(),
            published_dirs,
        }
    }

    /// A config with a single published directory, the common case.
    pub fn single(private_dir: impl Into<PathBuf>, published_dir: impl Into<PathBuf>) -> Self {
        Self::new(private_dir, vec![published_dir.into()])
    }

    pub fn private_dir(&self) -> &Path {
        &self.private_dir
    }

    pub fn published_dirs(&self) -> &[PathBuf] {
        &self.published_dirs
    }
}
