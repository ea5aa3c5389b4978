use std::sync::Arc;

use super::TaskContext;
use crate::error::Result;
use crate::gc_root::TempGcRoot;
use crate::iterator::{KvIter, MergeIterator};
use crate::key::InternalKey;
use crate::scheduler::{Cancellation, Task};
use crate::sstable::{Table, TableBuilder};

/// Receives `(added, removed)`. Both are empty when nothing should change.
pub type CompactionCallback =
    Box<dyn FnOnce(Vec<Arc<Table>>, Vec<Arc<Table>>) -> Result<()> + Send>;

/// Merges every input table into a fresh run of tables.
///
/// Inputs are given oldest first, as the catalog lists them. Since the output
/// replaces all of them, tombstones have nothing left to shadow and are
/// dropped.
pub struct CompactionTask {
    ctx: TaskContext,
    inputs: Vec<Arc<Table>>,
    on_done: Option<CompactionCallback>,
    cancellation: Cancellation,
}

impl CompactionTask {
    pub fn new(ctx: TaskContext, inputs: Vec<Arc<Table>>, on_done: CompactionCallback) -> Self {
        Self {
            ctx,
            inputs,
            on_done: Some(on_done),
            cancellation: Cancellation::new(),
        }
    }

    fn new_builder(&self, pins: &mut TempGcRoot) -> Result<TableBuilder> {
        let path = self.ctx.paths.sst_path(self.ctx.file_ids.allocate());
        pins.add(path.clone());
        TableBuilder::create(path, self.ctx.config.block_size)
    }

    fn seal(builder: TableBuilder) -> Result<Arc<Table>> {
        let path = builder.path().to_path_buf();
        builder.finish()?;
        Ok(Arc::new(Table::open(path)?))
    }
}

impl Task for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    fn run(&mut self) -> Result<()> {
        let Some(on_done) = self.on_done.take() else {
            return Ok(());
        };

        if self.inputs.is_empty() {
            tracing::info!("No tables chosen for compaction");
            return on_done(Vec::new(), Vec::new());
        }

        tracing::info!(tables = self.inputs.len(), "Compaction started");

        // Newest first so the latest write for a key wins the merge.
        let sources = self.inputs.iter().rev().map(|table| table.iter()).collect();
        let mut merged = MergeIterator::new(sources);

        let mut pins = TempGcRoot::empty(&self.ctx.gc_root);
        let mut outputs = Vec::new();
        let mut builder: Option<TableBuilder> = None;

        merged.seek_first()?;
        while !merged.is_eof() {
            if self.cancellation.is_cancelled() {
                tracing::info!("Compaction cancelled, discarding output");
                return on_done(Vec::new(), Vec::new());
            }

            if !InternalKey::parse(merged.key())?.is_tombstone() {
                let mut current = match builder.take() {
                    Some(current) => current,
                    None => self.new_builder(&mut pins)?,
                };
                current.add(merged.key(), merged.value())?;

                if current.size_in_bytes() > self.ctx.config.sstable_size {
                    outputs.push(Self::seal(current)?);
                } else {
                    builder = Some(current);
                }
            }
            merged.next()?;
        }

        if let Some(current) = builder.take() {
            outputs.push(Self::seal(current)?);
        }

        tracing::info!(
            inputs = self.inputs.len(),
            outputs = outputs.len(),
            "Compaction completed"
        );

        let removed = std::mem::take(&mut self.inputs);
        on_done(outputs, removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gc_root::GcRoot;
    use crate::iterator::collect_all;
    use crate::key::{self, encode, KeyType};
    use crate::paths::{DbPaths, FileIdAllocator};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Outcome = Arc<Mutex<Option<(Vec<Arc<Table>>, Vec<Arc<Table>>)>>>;

    fn context(dir: &TempDir, sstable_size: u64) -> TaskContext {
        let paths = DbPaths::new(dir.path());
        paths.create_dirs().expect("Failed to create dirs");
        TaskContext {
            paths,
            config: Arc::new(
                Config::new(dir.path())
                    .block_size(128)
                    .sstable_size(sstable_size),
            ),
            file_ids: Arc::new(FileIdAllocator::new(100)),
            gc_root: Arc::new(GcRoot::new()),
        }
    }

    fn make_table(ctx: &TaskContext, entries: &[(&str, KeyType, &str)]) -> Arc<Table> {
        let path = ctx.paths.sst_path(ctx.file_ids.allocate());
        let mut builder = TableBuilder::create(&path, 128).expect("Failed to create table");
        for (k, kind, v) in entries {
            builder.add(&encode(k.as_bytes(), *kind), v.as_bytes()).unwrap();
        }
        builder.finish().unwrap();
        Arc::new(Table::open(&path).unwrap())
    }

    fn run(ctx: &TaskContext, inputs: Vec<Arc<Table>>, cancel: bool) -> (Vec<Arc<Table>>, Vec<Arc<Table>>) {
        let outcome: Outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let mut task = CompactionTask::new(
            ctx.clone(),
            inputs,
            Box::new(move |added, removed| {
                *slot.lock().unwrap() = Some((added, removed));
                Ok(())
            }),
        );
        if cancel {
            task.cancellation().cancel();
        }
        task.run().expect("Failed to run compaction");
        let result = outcome.lock().unwrap().take();
        result.expect("callback not invoked")
    }

    fn visible(tables: &[Arc<Table>]) -> BTreeMap<String, String> {
        let mut view = BTreeMap::new();
        for table in tables {
            for (k, v) in collect_all(&mut table.iter()).unwrap() {
                let ikey = InternalKey::parse(&k).unwrap();
                let user_key = String::from_utf8(ikey.user_key().to_vec()).unwrap();
                if ikey.is_tombstone() {
                    view.remove(&user_key);
                } else {
                    view.insert(user_key, String::from_utf8(v).unwrap());
                }
            }
        }
        view
    }

    #[test]
    fn test_compaction_conserves_visible_data() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir, 256);

        let oldest: Vec<(String, KeyType, String)> = (0..60)
            .map(|i| (format!("key{:03}", i), KeyType::Value, "old".to_string()))
            .collect();
        let oldest: Vec<_> = oldest.iter().map(|(k, t, v)| (k.as_str(), *t, v.as_str())).collect();
        let t1 = make_table(&ctx, &oldest);
        let t2 = make_table(
            &ctx,
            &[
                ("key010", KeyType::Value, "mid"),
                ("key020", KeyType::Tombstone, ""),
                ("key070", KeyType::Value, "mid"),
            ],
        );
        let t3 = make_table(
            &ctx,
            &[
                ("key010", KeyType::Value, "new"),
                ("key030", KeyType::Tombstone, ""),
            ],
        );
        let inputs = vec![t1, t2, t3];
        let before = visible(&inputs);

        let (added, removed) = run(&ctx, inputs.clone(), false);

        assert_eq!(removed.len(), inputs.len());
        assert!(removed.iter().zip(&inputs).all(|(a, b)| Arc::ptr_eq(a, b)));
        assert!(added.len() > 1, "small sstable_size must roll over");
        assert_eq!(visible(&added), before);
        assert_eq!(before.get("key010").map(String::as_str), Some("new"));
        assert!(!before.contains_key("key020"));

        // Output runs are ordered and disjoint.
        for pair in added.windows(2) {
            assert!(pair[0].max() < pair[1].min());
        }
        for table in &added {
            for (k, _) in collect_all(&mut table.iter()).unwrap() {
                assert!(!InternalKey::parse(&k).unwrap().is_tombstone());
            }
        }

        // Pins are gone once the task returns.
        assert!(!ctx.gc_root.is_reachable(added[0].path()));
    }

    #[test]
    fn test_all_tombstones_yield_no_output() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir, 4096);

        let t1 = make_table(&ctx, &[("a", KeyType::Value, "1")]);
        let t2 = make_table(&ctx, &[("a", KeyType::Tombstone, "")]);

        let (added, removed) = run(&ctx, vec![t1, t2], false);
        assert!(added.is_empty());
        assert_eq!(removed.len(), 2);
    }

    #[test]
    fn test_empty_input() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir, 4096);

        let (added, removed) = run(&ctx, Vec::new(), false);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_cancelled_compaction_reports_nothing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir, 4096);

        let t1 = make_table(&ctx, &[("a", KeyType::Value, "1"), ("b", KeyType::Value, "2")]);
        let t2 = make_table(&ctx, &[("c", KeyType::Value, "3")]);

        let (added, removed) = run(&ctx, vec![t1, t2], true);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_single_table_is_rewritten() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ctx = context(&dir, 4096);

        let t1 = make_table(&ctx, &[("a", KeyType::Value, "1"), ("b", KeyType::Tombstone, "")]);
        let (added, _) = run(&ctx, vec![t1], false);

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].count(), 1);
        assert_eq!(key::user_key(&collect_all(&mut added[0].iter()).unwrap()[0].0), b"a");
    }
}
