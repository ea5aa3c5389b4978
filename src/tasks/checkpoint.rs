use std::sync::Arc;
use std::time::Duration;

use super::TaskContext;
use crate::error::Result;
use crate::gc_root::TempGcRoot;
use crate::iterator::KvIter;
use crate::memtable::Memtable;
use crate::scheduler::{Cancellation, Task};
use crate::sstable::{Table, TableBuilder};

pub type CheckpointCallback = Box<dyn Fn(Arc<Table>) -> Result<()> + Send>;

/// Writes every entry of `memtable` into a new table file and opens it.
///
/// The target path is pinned in `pins` before the first byte is written, so
/// GC leaves it alone until the caller has registered the table elsewhere.
pub fn write_memtable(
    ctx: &TaskContext,
    memtable: &Arc<Memtable>,
    pins: &mut TempGcRoot,
) -> Result<Arc<Table>> {
    let file_id = ctx.file_ids.allocate();
    let path = ctx.paths.sst_path(file_id);
    pins.add(path.clone());

    let mut builder = TableBuilder::create(&path, ctx.config.block_size)?;
    let mut iter = memtable.iter();
    iter.seek_first()?;
    while !iter.is_eof() {
        builder.add(iter.key(), iter.value())?;
        iter.next()?;
    }
    builder.finish()?;

    Ok(Arc::new(Table::open(&path)?))
}

/// Flushes one immutable memtable into one table.
pub struct CheckpointTask {
    ctx: TaskContext,
    memtable: Arc<Memtable>,
    on_done: CheckpointCallback,
    cancellation: Cancellation,
}

impl CheckpointTask {
    pub fn new(ctx: TaskContext, memtable: Arc<Memtable>, on_done: CheckpointCallback) -> Self {
        Self {
            ctx,
            memtable,
            on_done,
            cancellation: Cancellation::new(),
        }
    }
}

impl Task for CheckpointTask {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    fn run(&mut self) -> Result<()> {
        let mut pins = TempGcRoot::empty(&self.ctx.gc_root);
        let table = write_memtable(&self.ctx, &self.memtable, &mut pins)?;

        tracing::info!(
            logfile_id = self.memtable.logfile_id(),
            path = %table.path().display(),
            entries = table.count(),
            "Checkpoint completed"
        );

        // The pin is held until the callback has put the table in the catalog.
        (self.on_done)(table)
    }

    // An immutable memtable that is never flushed blocks every later rotation.
    fn retry_backoff(&self) -> Option<Duration> {
        Some(self.ctx.config.checkpoint_retry_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gc_root::GcRoot;
    use crate::iterator::collect_all;
    use crate::key::{encode, KeyType};
    use crate::paths::{DbPaths, FileIdAllocator};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> TaskContext {
        let paths = DbPaths::new(dir.path());
        paths.create_dirs().expect("Failed to create dirs");
        TaskContext {
            paths,
            config: Arc::new(Config::new(dir.path()).block_size(64)),
            file_ids: Arc::new(FileIdAllocator::new(10)),
            gc_root: Arc::new(GcRoot::new()),
        }
    }

    #[test]
    fn test_checkpoint_writes_memtable() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir);

        let memtable = Arc::new(Memtable::new(3));
        for i in 0..100 {
            memtable.add(KeyType::Value, format!("key{:03}", i).as_bytes(), b"value");
        }
        memtable.add(KeyType::Tombstone, b"key050", b"");

        let result: Arc<Mutex<Option<Arc<Table>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let gc_root = Arc::clone(&ctx.gc_root);
        let mut task = CheckpointTask::new(
            ctx.clone(),
            Arc::clone(&memtable),
            Box::new(move |table| {
                // Still pinned while the callback runs.
                assert!(gc_root.is_reachable(table.path()));
                *slot.lock().unwrap() = Some(table);
                Ok(())
            }),
        );
        task.run().expect("Failed to run checkpoint");

        let table = result.lock().unwrap().take().expect("callback not invoked");
        assert_eq!(table.path(), ctx.paths.sst_path(10));
        assert_eq!(table.count(), 100);
        assert_eq!(table.query(b"key050").unwrap(), Some((KeyType::Tombstone, Vec::new())));

        let entries = collect_all(&mut table.iter()).unwrap();
        assert_eq!(entries[0].0, encode(b"key000", KeyType::Value));

        // Released once the task returns.
        assert!(!ctx.gc_root.is_reachable(table.path()));
    }

    #[test]
    fn test_failed_checkpoint_releases_pin() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir);

        let memtable = Arc::new(Memtable::new(1));
        memtable.add(KeyType::Value, b"k", b"v");

        let mut task = CheckpointTask::new(
            ctx.clone(),
            memtable,
            Box::new(|_| Err(crate::error::Error::InvalidState("rejected".to_string()))),
        );
        assert!(task.run().is_err());
        assert!(!ctx.gc_root.is_reachable(&ctx.paths.sst_path(10)));
        assert_eq!(task.retry_backoff(), Some(ctx.config.checkpoint_retry_backoff));
    }
}
