use std::{cmp::Ordering, ops::Range, sync::Arc};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::iterator::KvIter;
use crate::key;

const U32_SIZE: usize = 4;

/// Builds a block: records, then one offset per record, then the record count.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    offsets: Vec<u32>,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            offsets: Vec::new(),
            last_key: Vec::new(),
        }
    }

    /// Appends `len(key) key len(value) value`. Keys must be strictly increasing.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(
            self.offsets.is_empty() || key::compare(&self.last_key, key) == Ordering::Less,
            "block keys must be strictly increasing"
        );

        self.offsets.push(self.buffer.len() as u32);
        // Writing into a Vec cannot fail.
        let _ = self.buffer.write_u32::<LittleEndian>(key.len() as u32);
        self.buffer.extend_from_slice(key);
        let _ = self.buffer.write_u32::<LittleEndian>(value.len() as u32);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
    }

    /// Bytes of record data added so far.
    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn entry_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Seals the block and returns its bytes, leaving the builder empty.
    pub fn done(&mut self) -> Vec<u8> {
        let mut data = std::mem::take(&mut self.buffer);
        data.reserve((self.offsets.len() + 1) * U32_SIZE);
        for offset in &self.offsets {
            let _ = data.write_u32::<LittleEndian>(*offset);
        }
        let _ = data.write_u32::<LittleEndian>(self.offsets.len() as u32);

        self.reset();
        data
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offsets.clear();
        self.last_key.clear();
    }
}

/// A sealed block. Only the record count is validated up front; records are
/// decoded lazily, so corruption surfaces at the entry that is read.
#[derive(Debug)]
pub struct Block {
    data: Vec<u8>,
    count: u32,
    // Start of the offset table, which is also the end of the records.
    offsets_start: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < U32_SIZE {
            return Err(Error::DataCorrupted(format!(
                "invalid block length: {}",
                data.len()
            )));
        }

        let count_start = data.len() - U32_SIZE;
        let count = LittleEndian::read_u32(&data[count_start..]);
        let table_size = count as usize * U32_SIZE;
        if table_size > count_start {
            return Err(Error::DataCorrupted(format!(
                "block corrupted, {} keys with only size {}",
                count,
                data.len()
            )));
        }

        Ok(Self {
            offsets_start: count_start - table_size,
            count,
            data,
        })
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(self: &Arc<Self>) -> BlockIter {
        BlockIter {
            block: Arc::clone(self),
            index: self.count,
            key: 0..0,
            value: 0..0,
        }
    }

    fn corrupted(index: u32) -> Error {
        Error::DataCorrupted(format!("block corrupted when read index {}", index))
    }

    fn read_len(&self, pos: usize, index: u32) -> Result<usize> {
        let end = pos.checked_add(U32_SIZE).ok_or_else(|| Self::corrupted(index))?;
        if end > self.offsets_start {
            return Err(Self::corrupted(index));
        }
        Ok(LittleEndian::read_u32(&self.data[pos..end]) as usize)
    }

    fn read_slice(&self, pos: usize, index: u32) -> Result<Range<usize>> {
        let len = self.read_len(pos, index)?;
        let start = pos + U32_SIZE;
        let end = start.checked_add(len).ok_or_else(|| Self::corrupted(index))?;
        if end > self.offsets_start {
            return Err(Self::corrupted(index));
        }
        Ok(start..end)
    }

    fn entry_at(&self, index: u32) -> Result<(Range<usize>, Range<usize>)> {
        let slot = self.offsets_start + index as usize * U32_SIZE;
        let offset = LittleEndian::read_u32(&self.data[slot..slot + U32_SIZE]) as usize;

        let key = self.read_slice(offset, index)?;
        let value = self.read_slice(key.end, index)?;
        Ok((key, value))
    }

    fn key_at(&self, index: u32) -> Result<&[u8]> {
        let slot = self.offsets_start + index as usize * U32_SIZE;
        let offset = LittleEndian::read_u32(&self.data[slot..slot + U32_SIZE]) as usize;
        let key = self.read_slice(offset, index)?;
        Ok(&self.data[key])
    }
}

/// Cursor over a block with binary-search seek.
pub struct BlockIter {
    block: Arc<Block>,
    index: u32,
    key: Range<usize>,
    value: Range<usize>,
}

impl BlockIter {
    fn seek_to_index(&mut self, index: u32) -> Result<()> {
        self.index = index;
        if index >= self.block.count {
            self.index = self.block.count;
            return Ok(());
        }

        let (key, value) = self.block.entry_at(index)?;
        self.key = key;
        self.value = value;
        Ok(())
    }
}

impl KvIter for BlockIter {
    fn seek_first(&mut self) -> Result<()> {
        self.seek_to_index(0)
    }

    fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        let mut first = 0;
        let mut last = self.block.count;
        while first < last {
            let mid = first + (last - first) / 2;
            let key_at_mid = self.block.key_at(mid)?;
            if key::user_key(key_at_mid) < user_key {
                first = mid + 1;
            } else {
                last = mid;
            }
        }

        self.seek_to_index(first)
    }

    fn is_eof(&self) -> bool {
        self.index >= self.block.count
    }

    fn next(&mut self) -> Result<()> {
        if self.is_eof() {
            return Ok(());
        }
        self.seek_to_index(self.index + 1)
    }

    fn key(&self) -> &[u8] {
        &self.block.data[self.key.clone()]
    }

    fn value(&self) -> &[u8] {
        &self.block.data[self.value.clone()]
    }
}
