//! Reachability tracking for table files.
//!
//! The root never owns a table. Permanent entries hold a `Weak` handle that
//! stays upgradable while the catalog (or a reader snapshot) keeps the table
//! alive. Temporary entries pin paths that a checkpoint or compaction is still
//! writing and that no catalog knows about yet.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::sstable::Table;

#[derive(Default)]
struct Inner {
    permanent: HashMap<PathBuf, Weak<Table>>,
    temporary: HashSet<PathBuf>,
}

#[derive(Default)]
pub struct GcRoot {
    inner: Mutex<Inner>,
}

impl GcRoot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_reachable(&self, path: &Path) -> bool {
        let inner = self.lock();
        if inner.temporary.contains(path) {
            return true;
        }
        inner
            .permanent
            .get(path)
            .is_some_and(|table| table.strong_count() > 0)
    }

    pub fn add(&self, table: &Arc<Table>) {
        self.lock()
            .permanent
            .insert(table.path().to_path_buf(), Arc::downgrade(table));
    }

    pub fn remove(&self, table: &Table) {
        self.lock().permanent.remove(table.path());
    }

    pub fn add_temporary(&self, path: impl Into<PathBuf>) {
        self.lock().temporary.insert(path.into());
    }

    pub fn remove_temporary(&self, path: &Path) {
        self.lock().temporary.remove(path);
    }

    /// Pins `path` until the returned guard is dropped.
    pub fn pin(self: &Arc<Self>, path: impl Into<PathBuf>) -> TempGcRoot {
        let path = path.into();
        self.add_temporary(path.clone());
        TempGcRoot {
            root: Arc::clone(self),
            paths: vec![path],
        }
    }

    /// Drops permanent entries whose table is gone.
    pub fn prune(&self) {
        self.lock()
            .permanent
            .retain(|_, table| table.strong_count() > 0);
    }
}

/// Scoped temporary pins. Every pinned path is released on drop.
pub struct TempGcRoot {
    root: Arc<GcRoot>,
    paths: Vec<PathBuf>,
}

impl TempGcRoot {
    pub fn empty(root: &Arc<GcRoot>) -> Self {
        Self {
            root: Arc::clone(root),
            paths: Vec::new(),
        }
    }

    pub fn add(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.root.add_temporary(path.clone());
        self.paths.push(path);
    }
}

impl Drop for TempGcRoot {
    fn drop(&mut self) {
        for path in &self.paths {
            self.root.remove_temporary(path);
        }
    }
}
