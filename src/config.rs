use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a database instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the database
    pub dir: PathBuf,

    /// Refuse to create a database that does not exist yet (default: false)
    pub open_only: bool,

    /// Active memtable size that triggers rotation and checkpoint (default: 4MB)
    pub write_buffer_size: usize,

    /// Target size of a table written by compaction (default: 16MB)
    pub sstable_size: u64,

    /// Number of tables at which compaction is considered (default: 8)
    pub compaction_water_mark: usize,

    /// Data block flush threshold (default: 32KB)
    pub block_size: usize,

    /// Fsync the write-ahead log on every commit (default: true)
    pub sync_writes: bool,

    /// Maximum number of writes grouped into one log append (default: 16)
    pub max_batch_size: usize,

    /// How long the write queue waits for more writes to group (default: 50us)
    pub batch_wait: Duration,

    /// Worker threads for checkpoint, compaction and GC (default: 2)
    pub background_threads: usize,

    /// Delay before a failed checkpoint is retried (default: 1s)
    pub checkpoint_retry_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./lsmkv"),
            open_only: false,
            write_buffer_size: 4 * 1024 * 1024,
            sstable_size: 16 * 1024 * 1024,
            compaction_water_mark: 8,
            block_size: 32 * 1024,
            sync_writes: true,
            max_batch_size: 16,
            batch_wait: Duration::from_micros(50),
            background_threads: 2,
            checkpoint_retry_backoff: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn open_only(mut self, enabled: bool) -> Self {
        self.open_only = enabled;
        self
    }

    /// Set the memtable rotation threshold
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the compaction output table size
    pub fn sstable_size(mut self, size: u64) -> Self {
        self.sstable_size = size;
        self
    }

    /// Set the table count that makes compaction eligible
    pub fn compaction_water_mark(mut self, count: usize) -> Self {
        self.compaction_water_mark = count;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Set group commit limits
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn batch_wait(mut self, wait: Duration) -> Self {
        self.batch_wait = wait;
        self
    }

    pub fn background_threads(mut self, threads: usize) -> Self {
        self.background_threads = threads.max(1);
        self
    }

    pub fn checkpoint_retry_backoff(mut self, backoff: Duration) -> Self {
        self.checkpoint_retry_backoff = backoff;
        self
    }
}
