use crate::error::Result;
use crate::iterator::{BoxedKvIter, KvIter, MergeIterator};
use crate::key::{self, InternalKey};

use super::state::ReadSnapshot;

/// Forward cursor over the live keys of a database.
///
/// Reads from the snapshot taken when it was created; later writes are not
/// observed. Deleted keys are skipped and keys are returned without their tag.
pub struct DbIterator {
    merged: MergeIterator<BoxedKvIter>,
}

impl DbIterator {
    pub(crate) fn new(snapshot: ReadSnapshot) -> Self {
        // The active memtable keeps taking writes, so it is copied. A frozen
        // one never changes and is read in place.
        let mut sources: Vec<BoxedKvIter> = vec![Box::new(snapshot.active.snapshot())];
        if let Some(immutable) = &snapshot.immutable {
            sources.push(Box::new(immutable.iter()));
        }
        sources.extend(
            snapshot
                .catalog
                .sstables()
                .iter()
                .rev()
                .map(|table| Box::new(table.iter()) as BoxedKvIter),
        );

        Self {
            merged: MergeIterator::new(sources),
        }
    }

    pub fn seek_first(&mut self) -> Result<()> {
        self.merged.seek_first()?;
        self.skip_deleted()
    }

    /// Positions at the first live key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.merged.seek(key)?;
        self.skip_deleted()
    }

    pub fn is_valid(&self) -> bool {
        !self.merged.is_eof()
    }

    pub fn next(&mut self) -> Result<()> {
        self.merged.next()?;
        self.skip_deleted()
    }

    pub fn key(&self) -> &[u8] {
        key::user_key(self.merged.key())
    }

    pub fn value(&self) -> &[u8] {
        self.merged.value()
    }

    fn skip_deleted(&mut self) -> Result<()> {
        while !self.merged.is_eof() && InternalKey::parse(self.merged.key())?.is_tombstone() {
            self.merged.next()?;
        }
        Ok(())
    }
}
