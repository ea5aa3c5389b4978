//! Directory layout and file id allocation.
//!
//! ```text
//! <root>/
//!   LOCK          directory lock
//!   meta          catalog
//!   redo/<id>     one log segment per memtable generation
//!   sst/sst.<id>  one table per checkpoint or compaction output
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

const SST_PREFIX: &str = "sst.";

#[derive(Debug, Clone)]
pub struct DbPaths {
    root: PathBuf,
}

impl DbPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("LOCK")
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn redo_dir(&self) -> PathBuf {
        self.root.join("redo")
    }

    pub fn sst_dir(&self) -> PathBuf {
        self.root.join("sst")
    }

    pub fn log_path(&self, id: u64) -> PathBuf {
        self.redo_dir().join(id.to_string())
    }

    pub fn sst_path(&self, id: u64) -> PathBuf {
        self.sst_dir().join(format!("{}{}", SST_PREFIX, id))
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.redo_dir())?;
        fs::create_dir_all(self.sst_dir())?;
        Ok(())
    }

    /// Ids of every parsable log segment, in no particular order.
    pub fn list_log_ids(&self) -> Result<Vec<u64>> {
        list_ids(&self.redo_dir(), parse_log_name)
    }

    /// Ids of every parsable table file, in no particular order.
    pub fn list_sst_ids(&self) -> Result<Vec<u64>> {
        list_ids(&self.sst_dir(), parse_sst_name)
    }
}

pub fn parse_log_name(name: &str) -> Option<u64> {
    name.parse().ok()
}

pub fn parse_sst_name(name: &str) -> Option<u64> {
    name.strip_prefix(SST_PREFIX)?.parse().ok()
}

fn list_ids(dir: &Path, parse: fn(&str) -> Option<u64>) -> Result<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Monotonic id source shared by log segments and tables.
#[derive(Debug)]
pub struct FileIdAllocator {
    next: AtomicU64,
}

impl FileIdAllocator {
    pub fn new(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next.max(1)),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next `allocate` call will return.
    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Raises the counter so it never hands out an id below `min_next`.
    pub fn bump_to(&self, min_next: u64) {
        self.next.fetch_max(min_next, Ordering::SeqCst);
    }
}
