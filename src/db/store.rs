//! Engine core: the write generations, the catalog and the background work
//! that moves data between them.
//!
//! Lock order is `log` then `mem`. `sys` serializes catalog updates and is
//! never taken while holding `log` or `mem`. `catalog` only guards the swap of
//! the shared handle.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use super::state::{need_compaction, CompactionGuard, MemtableSlots, ReadSnapshot};
use crate::batch::WriteBatch;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::Result;
use crate::flock::FileLock;
use crate::key::KeyType;
use crate::memtable::Memtable;
use crate::paths::DbPaths;
use crate::scheduler::Scheduler;
use crate::sstable::Table;
use crate::tasks::{CheckpointTask, CompactionTask, GcTask, TaskContext};
use crate::wal::LogWriter;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct DbInner {
    pub config: Arc<Config>,
    pub paths: DbPaths,
    ctx: TaskContext,
    mem: Mutex<MemtableSlots>,
    mem_cond: Condvar,
    catalog: Mutex<Arc<Catalog>>,
    sys: Mutex<()>,
    log: Mutex<LogWriter>,
    compaction_running: Arc<AtomicBool>,
    scheduler: Scheduler,
    weak_self: Weak<DbInner>,
    _lock: FileLock,
}

impl DbInner {
    pub fn new(
        ctx: TaskContext,
        catalog: Catalog,
        log: LogWriter,
        active: Memtable,
        scheduler: Scheduler,
        file_lock: FileLock,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config: Arc::clone(&ctx.config),
            paths: ctx.paths.clone(),
            mem: Mutex::new(MemtableSlots::new(Arc::new(active))),
            mem_cond: Condvar::new(),
            catalog: Mutex::new(Arc::new(catalog)),
            sys: Mutex::new(()),
            log: Mutex::new(log),
            compaction_running: Arc::new(AtomicBool::new(false)),
            scheduler,
            weak_self: weak_self.clone(),
            _lock: file_lock,
            ctx,
        })
    }

    pub fn current_catalog(&self) -> Arc<Catalog> {
        Arc::clone(&lock(&self.catalog))
    }

    /// Memtables are captured before the catalog. A checkpoint swaps the
    /// catalog before it clears the immutable slot, so the snapshot never
    /// misses a generation in between.
    pub fn snapshot(&self) -> ReadSnapshot {
        let (active, immutable) = {
            let mem = lock(&self.mem);
            (Arc::clone(&mem.active), mem.immutable.clone())
        };
        ReadSnapshot {
            active,
            immutable,
            catalog: self.current_catalog(),
        }
    }

    pub fn query(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.snapshot();

        let found = snapshot.memtables().find_map(|memtable| memtable.query(key));
        if let Some(found) = found {
            return Ok(visible(found));
        }

        for table in snapshot.catalog.sstables().iter().rev() {
            if let Some(found) = table.query(key)? {
                return Ok(visible(found));
            }
        }
        Ok(None)
    }

    /// Appends `batch` to the log, then applies it to the active memtable.
    ///
    /// Callers are serialized by the write queue; the `log` lock makes the
    /// append and the apply one step with respect to rotation.
    pub fn commit(&self, batch: &WriteBatch) -> Result<()> {
        let mut log = lock(&self.log);
        self.make_room(&mut log, false)?;

        log.write(batch.as_bytes())?;

        let active = Arc::clone(&lock(&self.mem).active);
        if let Err(e) = batch.apply_to(&active) {
            // The log already holds this batch; memory can no longer match it.
            tracing::error!(error = %e, "Failed to apply logged batch to memtable, aborting");
            std::process::abort();
        }
        Ok(())
    }

    /// Rotates the active memtable once it is over the write buffer size, or
    /// whenever it holds data if `force` is set. Returns whether it rotated.
    ///
    /// Nothing happens while a previous generation is still being flushed.
    fn make_room(&self, log: &mut LogWriter, force: bool) -> Result<bool> {
        {
            let mem = lock(&self.mem);
            if mem.immutable.is_some() || mem.active.is_empty() {
                return Ok(false);
            }
            if !force && mem.active.size() < self.config.write_buffer_size {
                return Ok(false);
            }
        }

        // Only a holder of `log` rotates, so the slots checked above cannot
        // change while the new segment is created without `mem` held.
        let file_id = self.ctx.file_ids.allocate();
        let next_log = LogWriter::create(self.paths.log_path(file_id), self.config.sync_writes)?;

        let frozen = {
            let mut mem = lock(&self.mem);
            *log = next_log;
            let frozen = std::mem::replace(&mut mem.active, Arc::new(Memtable::new(file_id)));
            mem.immutable = Some(Arc::clone(&frozen));
            frozen
        };

        tracing::info!(
            logfile_id = frozen.logfile_id(),
            size = frozen.size(),
            entries = frozen.len(),
            "Memtable frozen, checkpoint issued"
        );
        self.schedule_checkpoint(frozen);
        Ok(true)
    }

    fn schedule_checkpoint(&self, memtable: Arc<Memtable>) {
        let weak = self.weak_self.clone();
        let logfile_id = memtable.logfile_id();
        let task = CheckpointTask::new(
            self.ctx.clone(),
            memtable,
            Box::new(move |table| match weak.upgrade() {
                Some(db) => db.on_checkpoint_done(table, logfile_id),
                None => Ok(()),
            }),
        );

        if !self.scheduler.submit(Box::new(task)) {
            // Without the checkpoint the immutable slot never clears and
            // memory grows without bound.
            tracing::error!(logfile_id, "Failed to submit checkpoint task, aborting");
            std::process::abort();
        }
    }

    fn on_checkpoint_done(&self, table: Arc<Table>, logfile_id: u64) -> Result<()> {
        self.update_catalog(&[table], &[], logfile_id)?;

        lock(&self.mem).immutable = None;
        self.mem_cond.notify_all();

        self.try_gc();
        self.try_compaction();
        Ok(())
    }

    /// Builds, persists and installs the next catalog.
    ///
    /// Added tables join the GC root before the catalog is stored, so a GC
    /// running concurrently can never delete a table the new catalog lists.
    pub fn update_catalog(
        &self,
        added: &[Arc<Table>],
        removed: &[Arc<Table>],
        committed_file_id: u64,
    ) -> Result<()> {
        let _sys = lock(&self.sys);

        let current = self.current_catalog();
        let next = current.apply(
            added,
            removed,
            committed_file_id,
            self.ctx.file_ids.peek_next(),
        )?;

        for table in added {
            self.ctx.gc_root.add(table);
        }
        if let Err(e) = next.store(&self.paths) {
            for table in added {
                self.ctx.gc_root.remove(table);
            }
            return Err(e);
        }

        tracing::info!(
            committed_file_id = next.committed_file_id(),
            next_file_id = next.next_file_id(),
            tables_before = current.sstables().len(),
            tables_after = next.sstables().len(),
            "Catalog updated"
        );
        *lock(&self.catalog) = Arc::new(next);
        Ok(())
    }

    pub fn try_gc(&self) {
        let committed = self.current_catalog().committed_file_id();
        if !self
            .scheduler
            .submit(Box::new(GcTask::new(self.ctx.clone(), committed)))
        {
            tracing::debug!("GC not scheduled, scheduler closed");
        }
    }

    pub fn try_compaction(&self) {
        let catalog = self.current_catalog();
        if !need_compaction(&catalog, self.config.compaction_water_mark) {
            return;
        }
        let Some(guard) = CompactionGuard::try_acquire(&self.compaction_running) else {
            return;
        };

        let weak = self.weak_self.clone();
        let task = CompactionTask::new(
            self.ctx.clone(),
            catalog.sstables().to_vec(),
            Box::new(move |added, removed| {
                let Some(db) = weak.upgrade() else {
                    return Ok(());
                };
                if added.is_empty() && removed.is_empty() {
                    return Ok(());
                }

                let result = db.update_catalog(&added, &removed, 0);
                // Release before re-evaluating so the cascade can start.
                drop(guard);
                if result.is_ok() {
                    db.try_gc();
                    db.try_compaction();
                }
                result
            }),
        );

        if !self.scheduler.submit(Box::new(task)) {
            tracing::debug!("Compaction not scheduled, scheduler closed");
        }
    }

    /// Blocks until no checkpoint is pending.
    fn wait_for_checkpoint(&self) {
        let mut mem = lock(&self.mem);
        while mem.immutable.is_some() {
            mem = self
                .mem_cond
                .wait(mem)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Pushes everything written so far into tables.
    pub fn flush(&self) -> Result<()> {
        self.wait_for_checkpoint();
        let rotated = {
            let mut log = lock(&self.log);
            self.make_room(&mut log, true)?
        };
        if rotated {
            self.wait_for_checkpoint();
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    #[cfg(test)]
    pub fn in_flight_tasks(&self) -> usize {
        self.scheduler.in_flight()
    }
}

fn visible((kind, value): (KeyType, Vec<u8>)) -> Option<Vec<u8>> {
    match kind {
        KeyType::Value => Some(value),
        KeyType::Tombstone => None,
    }
}

impl std::fmt::Debug for DbInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbInner")
            .field("root", &self.paths.root())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::recovery;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn batch_of(prefix: &str, entries: usize) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for i in 0..entries {
            batch.put(format!("{}{:03}", prefix, i).as_bytes(), &[b'v'; 32]);
        }
        batch
    }

    #[test]
    fn test_rotation_waits_for_pending_checkpoint() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config::new(dir.path().join("db"))
            .write_buffer_size(256)
            .sync_writes(false)
            .checkpoint_retry_backoff(Duration::from_millis(20));
        let db = recovery::open(config).expect("Failed to open database");

        // Checkpoints keep failing until the table directory is back.
        fs::remove_dir_all(db.paths.sst_dir()).expect("Failed to remove sst dir");

        db.commit(&batch_of("a", 10)).expect("Failed to commit");
        db.commit(&batch_of("b", 10)).expect("Failed to commit");
        assert!(lock(&db.mem).immutable.is_some());

        // Over the write buffer size again, but the frozen memtable is still
        // waiting for its checkpoint.
        db.commit(&batch_of("c", 10)).expect("Failed to commit");
        db.commit(&batch_of("d", 10)).expect("Failed to commit");
        {
            let mem = lock(&db.mem);
            assert_eq!(mem.immutable.as_ref().map(|m| m.len()), Some(10));
            assert_eq!(mem.active.len(), 30);
            assert!(mem.active.size() > db.config.write_buffer_size);
        }
        assert_eq!(db.paths.list_log_ids().unwrap().len(), 2);
        assert!(db.current_catalog().sstables().is_empty());

        fs::create_dir(db.paths.sst_dir()).expect("Failed to recreate sst dir");
        db.flush().expect("Failed to flush");

        assert!(lock(&db.mem).immutable.is_none());
        assert_eq!(db.current_catalog().sstables().len(), 2);
        for prefix in ["a", "b", "c", "d"] {
            assert_eq!(
                db.query(format!("{}005", prefix).as_bytes()).unwrap(),
                Some(vec![b'v'; 32])
            );
        }
        db.shutdown();
    }

    #[test]
    fn test_query_prefers_newest_generation() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config::new(dir.path()).sync_writes(false);
        let db = recovery::open(config).expect("Failed to open database");

        let mut batch = WriteBatch::new();
        batch.put(b"key", b"old");
        batch.put(b"gone", b"old");
        db.commit(&batch).unwrap();
        db.flush().unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"key", b"new");
        batch.delete(b"gone");
        db.commit(&batch).unwrap();

        assert_eq!(db.query(b"key").unwrap(), Some(b"new".to_vec()));
        assert_eq!(db.query(b"gone").unwrap(), None);
        db.shutdown();
    }
}
