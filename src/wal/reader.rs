use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::Result;

/// Reads records back from a log segment in append order.
pub struct LogReader {
    reader: BufReader<File>,
    path: PathBuf,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            reader: BufReader::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next record, or `None` at the end of the usable log.
    /// A truncated length header or payload ends the log.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.reader.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Read through `take` so a garbage length cannot force a huge allocation.
        let mut record = Vec::new();
        let read = (&mut self.reader).take(len as u64).read_to_end(&mut record)?;
        if read < len {
            tracing::warn!(
                path = %self.path.display(),
                expected = len,
                actual = read,
                "Truncated record at end of log"
            );
            return Ok(None);
        }

        Ok(Some(record))
    }
}

impl Iterator for LogReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
