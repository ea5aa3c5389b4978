//! Write batches: the unit of atomic mutation and of write-ahead logging.
//!
//! ```text
//! +-----------+-------------------------------------------------+
//! |count: u32 | (len: u32, user_key || tag, len: u32, value)*   |
//! +-----------+-------------------------------------------------+
//! ```
//!
//! All integers are little-endian. Tombstones carry an empty value.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::key::{InternalKey, KeyType};
use crate::memtable::Memtable;

const HEADER_SIZE: usize = 4;

/// A single decoded mutation borrowing from the batch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRecord<'a> {
    pub kind: KeyType,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    data: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; HEADER_SIZE],
        }
    }

    /// Wraps an encoded batch, as read back from the log.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::DataCorrupted(format!(
                "write batch too small: {} bytes",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.push(KeyType::Value, key, value);
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.push(KeyType::Tombstone, key, &[]);
    }

    fn push(&mut self, kind: KeyType, key: &[u8], value: &[u8]) {
        // Writing into a Vec cannot fail.
        let _ = self.data.write_u32::<LittleEndian>(key.len() as u32 + 1);
        InternalKey::new(key, kind).encode_to(&mut self.data);
        let _ = self.data.write_u32::<LittleEndian>(value.len() as u32);
        self.data.extend_from_slice(value);

        let count = self.count();
        self.set_count(count + 1);
    }

    /// Concatenates another batch; the combined count is the sum of both.
    pub fn append(&mut self, other: &WriteBatch) {
        let count = self.count() + other.count();
        self.data.extend_from_slice(&other.data[HEADER_SIZE..]);
        self.set_count(count);
    }

    pub fn count(&self) -> u32 {
        LittleEndian::read_u32(&self.data[..HEADER_SIZE])
    }

    fn set_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.data[..HEADER_SIZE], count);
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            rest: &self.data[HEADER_SIZE..],
            remaining: self.count(),
        }
    }

    /// Applies every record to the memtable. The batch is fully decoded first
    /// so a corrupt record never leaves a partially applied batch behind.
    /// Checks that every record decodes and has a non-empty key. Empty keys
    /// cannot be told apart from a corrupted record once logged.
    pub fn validate(&self) -> Result<()> {
        for record in self.iter() {
            if let Err(e) = record {
                return Err(Error::InvalidArgument(format!("rejected write batch: {}", e)));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, memtable: &Memtable) -> Result<()> {
        let records = self.iter().collect::<Result<Vec<_>>>()?;
        for record in records {
            memtable.add(record.kind, record.key, record.value);
        }
        Ok(())
    }
}

pub struct BatchIter<'a> {
    rest: &'a [u8],
    remaining: u32,
}

impl<'a> BatchIter<'a> {
    fn read_slice(&mut self, field: &str) -> Result<&'a [u8]> {
        let mut rest = self.rest;
        let len = rest.read_u32::<LittleEndian>().map_err(|_| {
            Error::DataCorrupted(format!("write batch truncated reading {} length", field))
        })? as usize;

        if rest.len() < len {
            return Err(Error::DataCorrupted(format!(
                "write batch truncated reading {}: need {} bytes, have {}",
                field,
                len,
                rest.len()
            )));
        }

        let (slice, tail) = rest.split_at(len);
        self.rest = tail;
        Ok(slice)
    }

    fn read_record(&mut self) -> Result<BatchRecord<'a>> {
        let encoded = self.read_slice("key")?;
        let (tag, key) = match encoded.split_last() {
            Some((tag, key)) if !key.is_empty() => (*tag, key),
            _ => return Err(Error::DataCorrupted("corrupted key".to_string())),
        };
        let kind = KeyType::try_from(tag)
            .map_err(|_| Error::DataCorrupted(format!("invalid tag {}", tag)))?;
        let value = self.read_slice("value")?;

        Ok(BatchRecord { kind, key, value })
    }
}

impl<'a> Iterator for BatchIter<'a> {
    type Item = Result<BatchRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        match self.read_record() {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
