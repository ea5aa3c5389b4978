use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use super::block::BlockBuilder;
use super::format::{BlockHandle, Footer, META_ENTRY_COUNT, META_FIRST_KEY, META_LAST_KEY};
use crate::error::Result;
use crate::key;

/// Writes a table file from internal keys supplied in strictly increasing order.
///
/// Data blocks are cut once they reach the block size; each sealed block adds
/// `last key -> handle` to the index block. `finish` writes the pending data
/// block, the index block, the meta block and the footer, then syncs the file.
pub struct TableBuilder {
    writer: BufWriter<File>,
    path: PathBuf,
    block_size: usize,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    offset: u64,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    entry_count: u64,
    size_in_bytes: u64,
}

impl TableBuilder {
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            block_size,
            data_block: BlockBuilder::new(),
            index_block: BlockBuilder::new(),
            offset: 0,
            first_key: Vec::new(),
            last_key: Vec::new(),
            entry_count: 0,
            size_in_bytes: 0,
        })
    }

    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(key.len() > 1, "internal key without user key");
        debug_assert!(
            self.entry_count == 0 || key::compare(&self.last_key, key) == Ordering::Less,
            "table keys must be strictly increasing"
        );

        self.data_block.add(key, value);
        if self.entry_count == 0 {
            self.first_key = key.to_vec();
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
        self.size_in_bytes += (key.len() + value.len() + 8) as u64;

        if self.data_block.size_in_bytes() >= self.block_size {
            self.commit_data_block()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Approximate size of the records added so far.
    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Seals the table. Returns the final file size.
    pub fn finish(mut self) -> Result<u64> {
        if !self.data_block.is_empty() {
            self.commit_data_block()?;
        }

        let index = self.index_block.done();
        let index_handle = self.write_block(&index)?;
        let meta_handle = self.write_meta_block()?;

        let footer = Footer::new(index_handle, meta_handle).encode();
        self.writer.write_all(&footer)?;
        self.offset += footer.len() as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        tracing::debug!(
            path = %self.path.display(),
            entries = self.entry_count,
            size = self.offset,
            "Finished table"
        );
        Ok(self.offset)
    }

    fn write_block(&mut self, content: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, content.len() as u64);
        self.writer.write_all(content)?;
        self.offset += content.len() as u64;
        Ok(handle)
    }

    fn commit_data_block(&mut self) -> Result<()> {
        let block = self.data_block.done();
        let handle = self.write_block(&block)?;

        let mut encoded = Vec::with_capacity(16);
        handle.encode_to(&mut encoded);
        self.index_block.add(&self.last_key, &encoded);
        Ok(())
    }

    fn write_meta_block(&mut self) -> Result<BlockHandle> {
        let mut count = [0u8; 8];
        LittleEndian::write_u64(&mut count, self.entry_count);

        let mut meta = BlockBuilder::new();
        meta.add(META_ENTRY_COUNT, &count);
        meta.add(META_FIRST_KEY, &self.first_key);
        meta.add(META_LAST_KEY, &self.last_key);

        let content = meta.done();
        self.write_block(&content)
    }
}
