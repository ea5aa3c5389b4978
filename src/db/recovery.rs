//! Opening a database directory.
//!
//! 1. Create the directory if it is new, otherwise require a catalog
//! 2. Take the directory lock
//! 3. Load the catalog and register its tables with the GC root
//! 4. Move the file id allocator past every id in use
//! 5. Replay log segments newer than the committed id into tables and fold
//!    them into the catalog
//! 6. Start a fresh log segment for the new active memtable

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use itertools::Itertools;

use super::store::DbInner;
use crate::batch::WriteBatch;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::gc_root::{GcRoot, TempGcRoot};
use crate::memtable::Memtable;
use crate::paths::{DbPaths, FileIdAllocator};
use crate::scheduler::Scheduler;
use crate::tasks::{write_memtable, TaskContext};
use crate::wal::{LogReader, LogWriter};

pub(crate) fn open(config: Config) -> Result<Arc<DbInner>> {
    let config = Arc::new(config);
    let paths = DbPaths::new(&config.dir);

    let is_new = is_uninitialized(&paths)?;
    if is_new && config.open_only {
        return Err(Error::InvalidArgument(format!(
            "open only mode, but database {} does not exist",
            paths.root().display()
        )));
    }

    fs::create_dir_all(paths.root())?;
    let file_lock = FileLock::lock(paths.lock_file())?;

    if is_new {
        paths.create_dirs()?;
        Catalog::new().store(&paths)?;
        tracing::info!(root = %paths.root().display(), "Created database");
    } else if !paths.catalog_file().is_file() {
        return Err(Error::DbCorrupted(format!(
            "invalid database {}, no catalog found",
            paths.root().display()
        )));
    }

    let catalog = Catalog::load(&paths)?;
    tracing::info!(
        root = %paths.root().display(),
        committed_file_id = catalog.committed_file_id(),
        tables = catalog.sstables().len(),
        "Loaded catalog"
    );

    let gc_root = Arc::new(GcRoot::new());
    for table in catalog.sstables() {
        gc_root.add(table);
    }

    let file_ids = Arc::new(FileIdAllocator::new(catalog.next_file_id()));
    let max_on_disk = paths
        .list_log_ids()?
        .into_iter()
        .chain(paths.list_sst_ids()?)
        .max();
    if let Some(max_id) = max_on_disk {
        file_ids.bump_to(max_id + 1);
    }

    let ctx = TaskContext {
        paths: paths.clone(),
        config: Arc::clone(&config),
        file_ids: Arc::clone(&file_ids),
        gc_root,
    };
    let catalog = replay(&ctx, catalog)?;

    let log_id = file_ids.allocate();
    let log = LogWriter::create(paths.log_path(log_id), config.sync_writes)?;
    let scheduler = Scheduler::new(config.background_threads)?;

    let db = DbInner::new(ctx, catalog, log, Memtable::new(log_id), scheduler, file_lock);
    db.try_gc();
    db.try_compaction();

    tracing::info!(root = %paths.root().display(), logfile_id = log_id, "Database opened");
    Ok(db)
}

/// True when the directory is missing, or holds nothing but what an
/// interrupted create leaves behind.
fn is_uninitialized(paths: &DbPaths) -> Result<bool> {
    let entries = match fs::read_dir(paths.root()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        if path == paths.lock_file() {
            continue;
        }
        if (path == paths.redo_dir() || path == paths.sst_dir()) && is_empty_dir(&path)? {
            continue;
        }
        return Ok(false);
    }
    Ok(true)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Turns every log segment newer than the committed id into a table and
/// returns the catalog that lists them.
fn replay(ctx: &TaskContext, catalog: Catalog) -> Result<Catalog> {
    let committed = catalog.committed_file_id();
    let segments: Vec<u64> = ctx
        .paths
        .list_log_ids()?
        .into_iter()
        .filter(|id| *id > committed)
        .sorted_unstable()
        .collect();

    // Replayed tables are unknown to the catalog until it is stored.
    let mut pins = TempGcRoot::empty(&ctx.gc_root);
    let mut added = Vec::new();
    let mut replayed = committed;

    for id in segments {
        let path = ctx.paths.log_path(id);
        if fs::metadata(&path)?.len() == 0 {
            continue;
        }

        let memtable = Arc::new(replay_segment(&path, id)?);
        if memtable.is_empty() {
            tracing::warn!(logfile_id = id, "Skipping log segment with no usable records");
            continue;
        }

        let table = write_memtable(ctx, &memtable, &mut pins)?;
        tracing::info!(
            logfile_id = id,
            entries = memtable.len(),
            path = %table.path().display(),
            "Replayed log segment"
        );
        added.push(table);
        replayed = id;
    }

    if added.is_empty() {
        return Ok(catalog);
    }

    let next = catalog.apply(&added, &[], replayed, ctx.file_ids.peek_next())?;
    for table in &added {
        ctx.gc_root.add(table);
    }
    next.store(&ctx.paths)?;
    Ok(next)
}

/// Rebuilds the memtable a segment backed. A record that fails to decode
/// ends the segment; what came before it is kept.
fn replay_segment(path: &Path, id: u64) -> Result<Memtable> {
    let memtable = Memtable::new(id);
    let mut reader = LogReader::open(path)?;

    loop {
        let record = match reader.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => break,
            Err(e) if e.is_corruption() => {
                tracing::warn!(logfile_id = id, error = %e, "Corrupted log record, rest of segment lost");
                break;
            }
            Err(e) => return Err(e),
        };

        match WriteBatch::from_bytes(record).and_then(|batch| batch.apply_to(&memtable)) {
            Ok(()) => {}
            Err(e) if e.is_corruption() => {
                tracing::warn!(logfile_id = id, error = %e, "Corrupted write batch, rest of segment lost");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(memtable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_replay_segment_stops_at_corruption() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("5");

        let mut writer = LogWriter::create(&path, false).unwrap();
        let mut good = WriteBatch::new();
        good.put(b"a", b"1");
        good.delete(b"b");
        writer.write(good.as_bytes()).unwrap();
        // A full record whose batch claims an entry it does not have.
        writer.write(&[1, 0, 0, 0, 9]).unwrap();
        let mut lost = WriteBatch::new();
        lost.put(b"c", b"3");
        writer.write(lost.as_bytes()).unwrap();

        let memtable = replay_segment(&path, 5).expect("Failed to replay");
        assert_eq!(memtable.logfile_id(), 5);
        assert_eq!(memtable.query(b"a"), Some((KeyType::Value, b"1".to_vec())));
        assert_eq!(memtable.query(b"b"), Some((KeyType::Tombstone, Vec::new())));
        assert_eq!(memtable.query(b"c"), None);
    }

    #[test]
    fn test_replay_segment_tolerates_torn_tail() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("2");

        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");
        LogWriter::create(&path, false)
            .unwrap()
            .write(batch.as_bytes())
            .unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[200, 0])
            .unwrap();

        let memtable = replay_segment(&path, 2).unwrap();
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_uninitialized_detection() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let paths = DbPaths::new(dir.path().join("db"));
        assert!(is_uninitialized(&paths).unwrap());

        paths.create_dirs().unwrap();
        fs::write(paths.lock_file(), b"1").unwrap();
        assert!(is_uninitialized(&paths).unwrap());

        fs::write(paths.log_path(1), b"").unwrap();
        assert!(!is_uninitialized(&paths).unwrap());
    }

    #[test]
    fn test_root_without_catalog_is_corrupted() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(dir.path().join("stray"), b"x").unwrap();

        let err = open(Config::new(dir.path())).unwrap_err();
        assert!(matches!(err, Error::DbCorrupted(_)));
    }

    #[test]
    fn test_open_only_on_missing_database() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let err = open(Config::new(dir.path().join("missing")).open_only(true)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn test_replay_folds_segments_into_catalog() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let paths = DbPaths::new(dir.path());
        paths.create_dirs().unwrap();
        Catalog::new().store(&paths).unwrap();

        for (id, value) in [(3u64, "old"), (7, "new")] {
            let mut batch = WriteBatch::new();
            batch.put(b"key", value.as_bytes());
            LogWriter::create(paths.log_path(id), false)
                .unwrap()
                .write(batch.as_bytes())
                .unwrap();
        }
        fs::write(paths.log_path(8), b"").unwrap();

        let ctx = TaskContext {
            paths: paths.clone(),
            config: Arc::new(Config::new(dir.path())),
            file_ids: Arc::new(FileIdAllocator::new(9)),
            gc_root: Arc::new(GcRoot::new()),
        };
        let catalog = replay(&ctx, Catalog::load(&paths).unwrap()).unwrap();

        assert_eq!(catalog.committed_file_id(), 7);
        assert_eq!(catalog.sstables().len(), 2);
        // Newest segment is the newest table.
        let newest = catalog.sstables().last().unwrap();
        assert_eq!(newest.query(b"key").unwrap(), Some((KeyType::Value, b"new".to_vec())));

        let stored = Catalog::load(&paths).unwrap();
        assert_eq!(stored.committed_file_id(), 7);
        assert_eq!(stored.sstables().len(), 2);
        for table in catalog.sstables() {
            assert!(ctx.gc_root.is_reachable(table.path()));
        }
    }
}
