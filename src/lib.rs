//! An embedded, ordered key-value store built on a log-structured merge tree.
//!
//! Writes go to a write-ahead log and an in-memory table. Full memtables are
//! checkpointed into immutable sorted tables, which background compaction
//! merges. A small catalog file records which tables make up the database.

pub mod batch;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod flock;
pub mod gc_root;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod paths;
pub mod scheduler;
pub mod sstable;
pub mod tasks;
pub mod wal;

pub use batch::WriteBatch;
pub use config::Config;
pub use db::{Db, DbIterator};
pub use error::{Error, Result};
pub use key::KeyType;
