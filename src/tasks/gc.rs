use std::fs;
use std::io;
use std::path::Path;

use super::TaskContext;
use crate::error::Result;
use crate::paths::{parse_log_name, parse_sst_name};
use crate::scheduler::{Cancellation, Task};

/// Deletes log segments already folded into tables and table files that
/// nothing can reach any more.
///
/// A file whose name does not parse is never deleted.
pub struct GcTask {
    ctx: TaskContext,
    committed_file_id: u64,
    cancellation: Cancellation,
}

impl GcTask {
    pub fn new(ctx: TaskContext, committed_file_id: u64) -> Self {
        Self {
            ctx,
            committed_file_id,
            cancellation: Cancellation::new(),
        }
    }

    fn collect_logs(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.ctx.paths.redo_dir())? {
            if self.cancellation.is_cancelled() {
                break;
            }
            let entry = entry?;
            let name = entry.file_name();

            match name.to_str().and_then(parse_log_name) {
                Some(id) if id <= self.committed_file_id => {
                    if remove(&entry.path()) {
                        tracing::info!(logfile_id = id, "Deleted log segment");
                        removed += 1;
                    }
                }
                Some(_) => {}
                None => {
                    tracing::warn!(name = ?name, "Skipping unrecognized file in log directory");
                }
            }
        }
        Ok(removed)
    }

    fn collect_tables(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.ctx.paths.sst_dir())? {
            if self.cancellation.is_cancelled() {
                break;
            }
            let entry = entry?;
            let name = entry.file_name();

            let Some(id) = name.to_str().and_then(parse_sst_name) else {
                tracing::warn!(name = ?name, "Skipping unrecognized file in table directory");
                continue;
            };

            let path = self.ctx.paths.sst_path(id);
            if !self.ctx.gc_root.is_reachable(&path) && remove(&path) {
                tracing::info!(file_id = id, "Deleted unreachable table");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn remove(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}

impl Task for GcTask {
    fn name(&self) -> &'static str {
        "gc"
    }

    fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    fn run(&mut self) -> Result<()> {
        let logs = self.collect_logs()?;
        let tables = self.collect_tables()?;
        self.ctx.gc_root.prune();

        if logs > 0 || tables > 0 {
            tracing::debug!(logs, tables, "GC completed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gc_root::GcRoot;
    use crate::key::{encode, KeyType};
    use crate::paths::{DbPaths, FileIdAllocator};
    use crate::sstable::{Table, TableBuilder};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> TaskContext {
        let paths = DbPaths::new(dir.path());
        paths.create_dirs().expect("Failed to create dirs");
        TaskContext {
            paths,
            config: Arc::new(Config::new(dir.path())),
            file_ids: Arc::new(FileIdAllocator::new(1)),
            gc_root: Arc::new(GcRoot::new()),
        }
    }

    fn make_table(ctx: &TaskContext, id: u64) -> Arc<Table> {
        let path = ctx.paths.sst_path(id);
        let mut builder = TableBuilder::create(&path, 4096).unwrap();
        builder.add(&encode(b"k", KeyType::Value), b"v").unwrap();
        builder.finish().unwrap();
        Arc::new(Table::open(&path).unwrap())
    }

    #[test]
    fn test_collects_committed_logs() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir);

        for id in [1, 3, 5, 8] {
            fs::write(ctx.paths.log_path(id), b"").unwrap();
        }
        fs::write(ctx.paths.redo_dir().join("notes.txt"), b"").unwrap();

        GcTask::new(ctx.clone(), 5).run().expect("Failed to run gc");

        let mut left = ctx.paths.list_log_ids().unwrap();
        left.sort_unstable();
        assert_eq!(left, vec![8]);
        assert!(ctx.paths.redo_dir().join("notes.txt").exists());
    }

    #[test]
    fn test_keeps_reachable_tables() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir);

        let live = make_table(&ctx, 1);
        ctx.gc_root.add(&live);
        let dropped = make_table(&ctx, 2);
        ctx.gc_root.add(&dropped);
        drop(dropped);
        make_table(&ctx, 3);
        fs::write(ctx.paths.sst_dir().join("README"), b"").unwrap();

        GcTask::new(ctx.clone(), 0).run().unwrap();

        assert!(ctx.paths.sst_path(1).exists());
        assert!(!ctx.paths.sst_path(2).exists());
        assert!(!ctx.paths.sst_path(3).exists());
        assert!(ctx.paths.sst_dir().join("README").exists());
    }

    #[test]
    fn test_pinned_table_survives_until_unpinned() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir);

        let path = ctx.paths.sst_path(7);
        let pin = ctx.gc_root.pin(path.clone());
        make_table(&ctx, 7);

        GcTask::new(ctx.clone(), 0).run().unwrap();
        assert!(path.exists(), "pinned table must not be collected");

        drop(pin);
        GcTask::new(ctx.clone(), 0).run().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_cancelled_gc_deletes_nothing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir);
        fs::write(ctx.paths.log_path(1), b"").unwrap();
        make_table(&ctx, 2);

        let mut task = GcTask::new(ctx.clone(), 10);
        task.cancellation().cancel();
        task.run().unwrap();

        assert!(ctx.paths.log_path(1).exists());
        assert!(ctx.paths.sst_path(2).exists());
    }
}
