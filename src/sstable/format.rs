//! Fixed-size footer and block handles.
//!
//! ```text
//! +----------------------------+----------------------------+-------------+
//! | data index handle          | meta index handle          | magic: u64  |
//! | offset: u64 | length: u64  | offset: u64 | length: u64  |             |
//! +----------------------------+----------------------------+-------------+
//! ```
//!
//! All integers are little-endian, for a fixed footer of 40 bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub const MAGIC: u64 = 2021122501;
pub const BLOCK_HANDLE_SIZE: usize = 16;
pub const FOOTER_SIZE: usize = 2 * BLOCK_HANDLE_SIZE + 8;

/// Meta block keys, listed in the order they are written.
pub const META_ENTRY_COUNT: &[u8] = b"entry_count";
pub const META_FIRST_KEY: &[u8] = b"first_key";
pub const META_LAST_KEY: &[u8] = b"last_key";

/// Location of a block inside a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        let mut raw = [0u8; BLOCK_HANDLE_SIZE];
        LittleEndian::write_u64(&mut raw[..8], self.offset);
        LittleEndian::write_u64(&mut raw[8..], self.length);
        buf.extend_from_slice(&raw);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_HANDLE_SIZE {
            return Err(Error::DataCorrupted(format!(
                "block handle too small: {} bytes",
                buf.len()
            )));
        }

        Ok(Self {
            offset: LittleEndian::read_u64(&buf[..8]),
            length: LittleEndian::read_u64(&buf[8..16]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub data_index: BlockHandle,
    pub meta_index: BlockHandle,
}

impl Footer {
    pub fn new(data_index: BlockHandle, meta_index: BlockHandle) -> Self {
        Self {
            data_index,
            meta_index,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        self.data_index.encode_to(&mut buf);
        self.meta_index.encode_to(&mut buf);

        let mut magic = [0u8; 8];
        LittleEndian::write_u64(&mut magic, MAGIC);
        buf.extend_from_slice(&magic);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(Error::DataCorrupted(format!(
                "invalid footer size {}, expect {}",
                buf.len(),
                FOOTER_SIZE
            )));
        }

        let magic = LittleEndian::read_u64(&buf[2 * BLOCK_HANDLE_SIZE..]);
        if magic != MAGIC {
            return Err(Error::DataCorrupted(format!(
                "footer corrupted, magic={}, expect={}",
                magic, MAGIC
            )));
        }

        Ok(Self {
            data_index: BlockHandle::decode(&buf[..BLOCK_HANDLE_SIZE])?,
            meta_index: BlockHandle::decode(&buf[BLOCK_HANDLE_SIZE..2 * BLOCK_HANDLE_SIZE])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer::new(BlockHandle::new(1024, 96), BlockHandle::new(1120, 64));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&encoded).expect("Failed to decode footer"), footer);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let mut encoded = Footer::new(BlockHandle::new(0, 1), BlockHandle::new(1, 1)).encode();
        encoded[FOOTER_SIZE - 1] ^= 0xff;

        let err = Footer::decode(&encoded).unwrap_err();
        assert!(matches!(err, Error::DataCorrupted(ref msg) if msg.contains("magic")));
    }

    #[test]
    fn test_footer_rejects_wrong_size() {
        assert!(matches!(Footer::decode(&[0u8; 39]), Err(Error::DataCorrupted(_))));
        assert!(matches!(Footer::decode(&[0u8; 41]), Err(Error::DataCorrupted(_))));
    }

    #[test]
    fn test_handle_too_small() {
        let err = BlockHandle::decode(&[0u8; 15]).unwrap_err();
        assert!(err.to_string().contains("block handle too small"));
    }
}
