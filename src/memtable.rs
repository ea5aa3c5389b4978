//! Memtable implementation using a concurrent skip list.
//!
//! The memtable buffers the most recent mutations in memory, keyed by user key
//! and holding the latest operation for each key. It is written by a single
//! committer thread and read concurrently by any number of queries and scans.
//!
//! # Crossbeam SkipMap
//!
//! `crossbeam-skiplist::SkipMap` gives lock-free lookups and ordered traversal.
//! Entries are reference counted, so a reader holding an entry never observes
//! a partially written value even while the key is being replaced.
//!
//! # Lifecycle
//!
//! 1. **Active**: accepts writes until its byte usage crosses the write buffer size
//! 2. **Immutable**: frozen, waiting for a checkpoint to write it into a table
//! 3. **Dropped**: once the checkpointed table is in the catalog
//!
//! Each memtable remembers the id of the log segment that backs it.

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::iterator::KvIter;
use crate::key::{self, KeyType};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    kind: KeyType,
    value: Vec<u8>,
}

#[derive(Debug)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Slot>,
    logfile_id: u64,
    size: AtomicUsize,
}

impl Memtable {
    pub fn new(logfile_id: u64) -> Self {
        Self {
            data: SkipMap::new(),
            logfile_id,
            size: AtomicUsize::new(0),
        }
    }

    /// Upserts the latest operation for `key`.
    pub fn add(&self, kind: KeyType, key: &[u8], value: &[u8]) {
        let new_size = key.len() + value.len();
        let old_size = self
            .data
            .get(key)
            .map_or(0, |entry| entry.key().len() + entry.value().value.len());

        self.data.insert(
            key.to_vec(),
            Slot {
                kind,
                value: value.to_vec(),
            },
        );

        self.size.fetch_add(new_size, Ordering::SeqCst);
        self.size.fetch_sub(old_size, Ordering::SeqCst);
    }

    pub fn query(&self, key: &[u8]) -> Option<(KeyType, Vec<u8>)> {
        self.data.get(key).map(|entry| {
            let slot = entry.value();
            (slot.kind, slot.value.clone())
        })
    }

    /// Approximate bytes held by keys and values.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn logfile_id(&self) -> u64 {
        self.logfile_id
    }

    /// Copies the current contents into a cursor that later writes cannot
    /// affect.
    pub fn snapshot(&self) -> MemtableSnapshot {
        let entries = self
            .data
            .iter()
            .map(|entry| {
                let slot = entry.value();
                (key::encode(entry.key(), slot.kind), slot.value.clone())
            })
            .collect();
        MemtableSnapshot { entries, pos: 0 }
    }

    pub fn iter(self: &Arc<Self>) -> MemtableIter {
        MemtableIter {
            memtable: Arc::clone(self),
            current: None,
        }
    }
}

/// Cursor over a memtable yielding encoded internal keys.
///
/// Holds a copy of the current entry and re-enters the skip list by key on
/// every step, so it never points into a node that a writer could replace.
/// It observes writes made after it was created; use [`Memtable::snapshot`]
/// on a memtable that is still being written.
pub struct MemtableIter {
    memtable: Arc<Memtable>,
    current: Option<Current>,
}

struct Current {
    user_key: Vec<u8>,
    internal_key: Vec<u8>,
    value: Vec<u8>,
}

impl MemtableIter {
    fn load(&mut self, lower: Bound<&[u8]>) {
        self.current = self.memtable.data.lower_bound(lower).map(|entry| {
            let slot = entry.value();
            Current {
                user_key: entry.key().clone(),
                internal_key: key::encode(entry.key(), slot.kind),
                value: slot.value.clone(),
            }
        });
    }
}

impl KvIter for MemtableIter {
    fn seek_first(&mut self) -> Result<()> {
        self.load(Bound::Unbounded);
        Ok(())
    }

    fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        self.load(Bound::Included(user_key));
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.current.is_none()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(current) = self.current.take() {
            self.load(Bound::Excluded(current.user_key.as_slice()));
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |c| c.internal_key.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |c| c.value.as_slice())
    }
}

/// Frozen copy of a memtable, sorted by user key.
pub struct MemtableSnapshot {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl KvIter for MemtableSnapshot {
    fn seek_first(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        self.pos = self
            .entries
            .partition_point(|(internal_key, _)| key::user_key(internal_key) < user_key);
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.entries.len()
    }

    fn next(&mut self) -> Result<()> {
        if !self.is_eof() {
            self.pos += 1;
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.entries.get(self.pos).map_or(&[], |(k, _)| k.as_slice())
    }

    fn value(&self) -> &[u8] {
        self.entries.get(self.pos).map_or(&[], |(_, v)| v.as_slice())
    }
}
