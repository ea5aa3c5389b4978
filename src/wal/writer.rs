use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// The file operations a log segment needs beyond `Write`.
pub trait SegmentFile: Write + Send {
    fn sync_data(&mut self) -> io::Result<()>;

    /// Cuts the file back to `len` bytes and continues writing from there.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl SegmentFile for File {
    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Appends length-prefixed records to one log segment.
///
/// A failed append is cut off the segment before the error is returned, so
/// a torn record never sits in front of later ones. If that cleanup fails
/// too, the writer refuses every further append.
pub struct LogWriter<F: SegmentFile = File> {
    file: F,
    path: PathBuf,
    sync: bool,
    buffer: Vec<u8>,
    // Bytes of complete records in the segment.
    len: u64,
    poisoned: bool,
}

impl<F: SegmentFile> std::fmt::Debug for LogWriter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("path", &self.path)
            .field("sync", &self.sync)
            .field("len", &self.len)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl LogWriter<File> {
    /// Creates a new, empty segment. An existing file at `path` is truncated.
    pub fn create(path: impl AsRef<Path>, sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self::with_file(file, path, sync))
    }
}

impl<F: SegmentFile> LogWriter<F> {
    fn with_file(file: F, path: PathBuf, sync: bool) -> Self {
        Self {
            file,
            path,
            sync,
            buffer: Vec::new(),
            len: 0,
            poisoned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record and flushes it before returning.
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(Error::InvalidState(format!(
                "log {} holds a torn record and accepts no more writes",
                self.path.display()
            )));
        }

        self.buffer.clear();
        self.buffer.write_u32::<LittleEndian>(record.len() as u32)?;
        self.buffer.extend_from_slice(record);

        match self.append() {
            Ok(()) => {
                self.len += self.buffer.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e.into())
            }
        }
    }

    fn append(&mut self) -> io::Result<()> {
        self.file.write_all(&self.buffer)?;
        self.file.flush()?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(e) = self.file.truncate_to(self.len) {
            tracing::error!(
                path = %self.path.display(),
                len = self.len,
                error = %e,
                "Failed to cut torn record off log"
            );
            self.poisoned = true;
        }
    }
}
