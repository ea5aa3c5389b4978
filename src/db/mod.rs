//! The database handle.
//!
//! # Write Path
//! 1. **Queue**: the batch is handed to the group commit thread
//! 2. **Log**: the grouped batch is appended to the active log segment
//! 3. **Memtable**: the batch is applied to the active memtable
//! 4. **Rotate**: once the active memtable is over the write buffer size it is
//!    frozen and a checkpoint writes it into a table
//!
//! # Read Path
//! 1. **Active memtable**
//! 2. **Immutable memtable**, if a checkpoint is pending
//! 3. **Tables**, newest first
//!
//! The first generation holding the key decides the answer; a tombstone there
//! means the key is absent.

mod iterator;
mod recovery;
mod state;
mod store;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;

pub use iterator::DbIterator;

use crate::batch::WriteBatch;
use crate::config::Config;
use crate::error::Result;
use store::DbInner;
use writer::WriteQueue;

pub struct Db {
    inner: Arc<DbInner>,
    writes: WriteQueue,
}

impl Db {
    /// Opens the database at `path` with default settings, creating it if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(path))
    }

    pub fn open_with_config(config: Config) -> Result<Self> {
        let inner = recovery::open(config)?;
        let writes = match WriteQueue::start(Arc::clone(&inner)) {
            Ok(writes) => writes,
            Err(e) => {
                inner.shutdown();
                return Err(e);
            }
        };
        Ok(Self { inner, writes })
    }

    pub fn query(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.query(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }

    /// Writes every pair atomically.
    pub fn batch_add<K, V>(&self, entries: &[(K, V)]) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut batch = WriteBatch::new();
        for (key, value) in entries {
            batch.put(key.as_ref(), value.as_ref());
        }
        self.write(batch)
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch)
    }

    /// Commits `batch` atomically. Returns once it is durable and visible.
    ///
    /// Keys must be non-empty; a batch holding an empty key is rejected as a
    /// whole with `InvalidArgument`.
    pub fn write(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        batch.validate()?;
        self.writes.submit(batch)
    }

    /// Cursor over a point-in-time view of the database.
    pub fn iter(&self) -> DbIterator {
        DbIterator::new(self.inner.snapshot())
    }

    /// Blocks until everything written so far is stored in tables.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    pub fn path(&self) -> &std::path::Path {
        self.inner.paths.root()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.writes.stop();
        self.inner.shutdown();
        tracing::info!(root = %self.inner.paths.root().display(), "Database closed");
    }
}
