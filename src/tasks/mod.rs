//! Background tasks run by the [`Scheduler`](crate::scheduler::Scheduler).
//!
//! Tasks never touch engine state directly. They read their inputs, write new
//! files under temporary GC pins and report the outcome through a callback,
//! which is where the engine folds results into the catalog.

use std::sync::Arc;

use crate::config::Config;
use crate::gc_root::GcRoot;
use crate::paths::{DbPaths, FileIdAllocator};

pub mod checkpoint;
pub mod compaction;
pub mod gc;

pub use checkpoint::{write_memtable, CheckpointTask};
pub use compaction::CompactionTask;
pub use gc::GcTask;

/// Shared handles every task needs to create or reclaim files.
#[derive(Clone)]
pub struct TaskContext {
    pub paths: DbPaths,
    pub config: Arc<Config>,
    pub file_ids: Arc<FileIdAllocator>,
    pub gc_root: Arc<GcRoot>,
}
