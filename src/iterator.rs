use std::{cmp::Ordering, collections::BinaryHeap};

use crate::error::Result;
use crate::key;

/// A seekable cursor over encoded internal keys in ascending user key order.
///
/// Call `seek_first` or `seek` before reading. `key`/`value` are only valid
/// while `is_eof` is false.
pub trait KvIter: Send {
    fn seek_first(&mut self) -> Result<()>;

    /// Positions at the first entry whose user key is >= `user_key`.
    fn seek(&mut self, user_key: &[u8]) -> Result<()>;

    fn is_eof(&self) -> bool;

    fn next(&mut self) -> Result<()>;

    fn key(&self) -> &[u8];

    fn value(&self) -> &[u8];
}

pub type BoxedKvIter = Box<dyn KvIter>;

impl<T: KvIter + ?Sized> KvIter for Box<T> {
    fn seek_first(&mut self) -> Result<()> {
        (**self).seek_first()
    }

    fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        (**self).seek(user_key)
    }

    fn is_eof(&self) -> bool {
        (**self).is_eof()
    }

    fn next(&mut self) -> Result<()> {
        (**self).next()
    }

    fn key(&self) -> &[u8] {
        (**self).key()
    }

    fn value(&self) -> &[u8] {
        (**self).value()
    }
}

/// Drains a cursor from its first entry into owned pairs.
pub fn collect_all<I: KvIter + ?Sized>(iter: &mut I) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = Vec::new();
    iter.seek_first()?;
    while !iter.is_eof() {
        entries.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next()?;
    }
    Ok(entries)
}

#[derive(Debug)]
struct HeapEntry {
    user_key: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.user_key == other.user_key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: smallest key, then earliest source, must compare greatest.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key.cmp(&other.user_key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ordering => ordering.reverse(),
        }
    }
}

/// K-way merge over ordered sources.
///
/// When several sources hold the same user key, the one earliest in the input
/// list is surfaced and the others are advanced past it. Callers pass sources
/// newest first.
pub struct MergeIterator<I: KvIter> {
    sources: Vec<I>,
    heap: BinaryHeap<HeapEntry>,
}

impl<I: KvIter> MergeIterator<I> {
    pub fn new(sources: Vec<I>) -> Self {
        Self {
            sources,
            heap: BinaryHeap::new(),
        }
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for (source, iter) in self.sources.iter().enumerate() {
            if !iter.is_eof() {
                self.heap.push(HeapEntry {
                    user_key: key::user_key(iter.key()).to_vec(),
                    source,
                });
            }
        }
    }

    fn push_source(&mut self, source: usize) {
        let iter = &self.sources[source];
        if !iter.is_eof() {
            self.heap.push(HeapEntry {
                user_key: key::user_key(iter.key()).to_vec(),
                source,
            });
        }
    }

    fn current(&self) -> Option<&I> {
        self.heap.peek().map(|top| &self.sources[top.source])
    }
}

impl<I: KvIter> KvIter for MergeIterator<I> {
    fn seek_first(&mut self) -> Result<()> {
        for iter in &mut self.sources {
            iter.seek_first()?;
        }
        self.rebuild();
        Ok(())
    }

    fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        for iter in &mut self.sources {
            iter.seek(user_key)?;
        }
        self.rebuild();
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.heap.is_empty()
    }

    fn next(&mut self) -> Result<()> {
        let Some(top) = self.heap.pop() else {
            return Ok(());
        };

        // Drop shadowed duplicates of the key just surfaced.
        while let Some(entry) = self.heap.peek() {
            if entry.user_key != top.user_key {
                break;
            }
            let source = entry.source;
            self.heap.pop();
            self.sources[source].next()?;
            self.push_source(source);
        }

        self.sources[top.source].next()?;
        self.push_source(top.source);
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.current().map_or(&[], |iter| iter.key())
    }

    fn value(&self) -> &[u8] {
        self.current().map_or(&[], |iter| iter.value())
    }
}
