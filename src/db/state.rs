use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::memtable::Memtable;

/// The write generations that have not reached a table yet.
pub(crate) struct MemtableSlots {
    pub active: Arc<Memtable>,
    /// Frozen memtable waiting for its checkpoint. At most one at a time.
    pub immutable: Option<Arc<Memtable>>,
}

impl MemtableSlots {
    pub fn new(active: Arc<Memtable>) -> Self {
        Self {
            active,
            immutable: None,
        }
    }
}

/// Everything a reader consults, captured under a brief lock and then walked
/// without holding any.
#[derive(Clone)]
pub(crate) struct ReadSnapshot {
    pub active: Arc<Memtable>,
    pub immutable: Option<Arc<Memtable>>,
    pub catalog: Arc<Catalog>,
}

impl ReadSnapshot {
    /// Memtables newest first.
    pub fn memtables(&self) -> impl Iterator<Item = &Arc<Memtable>> {
        std::iter::once(&self.active).chain(self.immutable.iter())
    }
}

/// RAII guard for the single running compaction.
pub(crate) struct CompactionGuard {
    running: Arc<AtomicBool>,
}

impl CompactionGuard {
    pub fn try_acquire(running: &Arc<AtomicBool>) -> Option<Self> {
        if running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self {
            running: Arc::clone(running),
        })
    }
}

impl Drop for CompactionGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Compaction runs once the table count reaches the water mark and something
/// has been checkpointed since the last compaction. Outputs of a compaction
/// alone never retrigger it, whatever their size.
pub(crate) fn need_compaction(catalog: &Catalog, water_mark: usize) -> bool {
    catalog.sstables().len() >= water_mark.max(1) && !catalog.fresh_tables().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compaction_guard_is_exclusive() {
        let running = Arc::new(AtomicBool::new(false));

        let guard = CompactionGuard::try_acquire(&running).expect("first acquire must succeed");
        assert!(CompactionGuard::try_acquire(&running).is_none());

        drop(guard);
        assert!(!running.load(Ordering::SeqCst));
        assert!(CompactionGuard::try_acquire(&running).is_some());
    }

    #[test]
    fn test_snapshot_memtable_order() {
        let snapshot = ReadSnapshot {
            active: Arc::new(Memtable::new(2)),
            immutable: Some(Arc::new(Memtable::new(1))),
            catalog: Arc::new(Catalog::new()),
        };
        let ids: Vec<_> = snapshot.memtables().map(|m| m.logfile_id()).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_need_compaction_below_water_mark() {
        assert!(!need_compaction(&Catalog::new(), 1));
    }
}
