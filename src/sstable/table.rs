//! Read side of a table file.
//!
//! Opening a table reads the footer, then loads the index block and the meta
//! block eagerly so that `min`, `max` and `count` never touch data blocks.
//! Data blocks are read on demand by a two-level iterator: the index cursor
//! picks a candidate block, the block cursor walks it, and `next` moves to the
//! following block transparently.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use byteorder::{ByteOrder, LittleEndian};

use super::block::{Block, BlockIter};
use super::format::{
    BlockHandle, Footer, FOOTER_SIZE, META_ENTRY_COUNT, META_FIRST_KEY, META_LAST_KEY,
};
use crate::error::{Error, Result};
use crate::iterator::KvIter;
use crate::key::{self, InternalKey, KeyType};

#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    file: Mutex<File>,
    index: Arc<Block>,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    count: u64,
    // Bytes in front of the footer; every block handle must end within it.
    size_in_bytes: u64,
}

impl Table {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::DataCorrupted(format!(
                "sst {} too small for a footer",
                path.display()
            )));
        }
        let size_in_bytes = file_size - FOOTER_SIZE as u64;

        let mut footer = [0u8; FOOTER_SIZE];
        file.seek(SeekFrom::Start(size_in_bytes))?;
        file.read_exact(&mut footer)?;
        let footer = Footer::decode(&footer)?;

        let index = read_block(&mut file, footer.data_index, size_in_bytes)?;
        let meta = read_block(&mut file, footer.meta_index, size_in_bytes)?;
        let (first_key, last_key, count) = parse_meta(&Arc::new(meta))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            index: Arc::new(index),
            first_key,
            last_key,
            count,
            size_in_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest user key in the table.
    pub fn min(&self) -> &[u8] {
        key::user_key(&self.first_key)
    }

    /// Largest user key in the table.
    pub fn max(&self) -> &[u8] {
        key::user_key(&self.last_key)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter {
            table: Arc::clone(self),
            index_iter: self.index.iter(),
            data_iter: None,
        }
    }

    /// Point lookup built from `seek` plus an equality check.
    pub fn query(self: &Arc<Self>, user_key: &[u8]) -> Result<Option<(KeyType, Vec<u8>)>> {
        if user_key < self.min() || user_key > self.max() {
            return Ok(None);
        }

        let mut iter = self.iter();
        iter.seek(user_key)?;
        if iter.is_eof() {
            return Ok(None);
        }

        let found = InternalKey::parse(iter.key())?;
        if found.user_key() != user_key {
            return Ok(None);
        }
        Ok(Some((found.kind(), iter.value().to_vec())))
    }

    fn load_block(&self, handle: BlockHandle) -> Result<Block> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        read_block(&mut file, handle, self.size_in_bytes)
    }
}

fn read_block(file: &mut File, handle: BlockHandle, limit: u64) -> Result<Block> {
    match handle.end() {
        Some(end) if end <= limit => {}
        _ => {
            return Err(Error::DataCorrupted(format!(
                "block handle {:?} out of range, table data ends at {}",
                handle, limit
            )))
        }
    }

    let mut data = vec![0u8; handle.length as usize];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut data)?;
    Block::new(data)
}

fn parse_meta(meta: &Arc<Block>) -> Result<(Vec<u8>, Vec<u8>, u64)> {
    let mut first_key = Vec::new();
    let mut last_key = Vec::new();
    let mut count = None;

    let mut iter = meta.iter();
    iter.seek_first()?;
    while !iter.is_eof() {
        match iter.key() {
            k if k == META_FIRST_KEY => first_key = iter.value().to_vec(),
            k if k == META_LAST_KEY => last_key = iter.value().to_vec(),
            k if k == META_ENTRY_COUNT => {
                if iter.value().len() != 8 {
                    return Err(Error::DataCorrupted(
                        "invalid entry_count in metablock".to_string(),
                    ));
                }
                count = Some(LittleEndian::read_u64(iter.value()));
            }
            _ => {}
        }
        iter.next()?;
    }

    let count =
        count.ok_or_else(|| Error::DataCorrupted("no entry_count in metablock".to_string()))?;
    if first_key.is_empty() || last_key.is_empty() {
        return Err(Error::DataCorrupted(
            "invalid first_key or last_key in metablock".to_string(),
        ));
    }
    Ok((first_key, last_key, count))
}

/// Two-level cursor over a table.
pub struct TableIter {
    table: Arc<Table>,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
}

impl TableIter {
    fn load_data_block(&mut self) -> Result<()> {
        let handle = BlockHandle::decode(self.index_iter.value())?;
        let block = Arc::new(self.table.load_block(handle)?);
        self.data_iter = Some(block.iter());
        Ok(())
    }

    // Skips forward over empty data blocks until positioned on an entry or exhausted.
    fn settle(&mut self) -> Result<()> {
        loop {
            if let Some(iter) = &self.data_iter {
                if !iter.is_eof() {
                    return Ok(());
                }
            }

            self.data_iter = None;
            if self.index_iter.is_eof() {
                return Ok(());
            }
            self.index_iter.next()?;
            if self.index_iter.is_eof() {
                return Ok(());
            }
            self.load_data_block()?;
            if let Some(iter) = self.data_iter.as_mut() {
                iter.seek_first()?;
            }
        }
    }
}

impl KvIter for TableIter {
    fn seek_first(&mut self) -> Result<()> {
        self.data_iter = None;
        self.index_iter.seek_first()?;
        if self.index_iter.is_eof() {
            return Ok(());
        }

        self.load_data_block()?;
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_first()?;
        }
        self.settle()
    }

    fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        self.data_iter = None;
        // Index keys are the last key of each block: the first one >= target
        // names the only block that can hold it.
        self.index_iter.seek(user_key)?;
        if self.index_iter.is_eof() {
            return Ok(());
        }

        self.load_data_block()?;
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek(user_key)?;
        }
        self.settle()
    }

    fn is_eof(&self) -> bool {
        self.data_iter.as_ref().map_or(true, |iter| iter.is_eof())
    }

    fn next(&mut self) -> Result<()> {
        match self.data_iter.as_mut() {
            Some(iter) => iter.next()?,
            None => return Ok(()),
        }
        self.settle()
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().map_or(&[], |iter| iter.key())
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().map_or(&[], |iter| iter.value())
    }
}
