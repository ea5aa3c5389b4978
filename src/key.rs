//! Internal key codec.
//!
//! An internal key is the user key followed by a single operation tag byte:
//!
//! ```text
//! +----------------+---------+
//! | user key bytes | tag: u8 |
//! +----------------+---------+
//! ```
//!
//! Ordering is defined on the user key alone. Containers hold at most one
//! entry per user key, so the tag never participates in deduplication.

use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Operation recorded for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    Value = 0,
    Tombstone = 1,
}

impl TryFrom<u8> for KeyType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(KeyType::Value),
            1 => Ok(KeyType::Tombstone),
            _ => Err(Error::DataCorrupted(format!("invalid key tag {}", tag))),
        }
    }
}

/// A decoded internal key borrowing its user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalKey<'a> {
    user_key: &'a [u8],
    kind: KeyType,
}

impl<'a> InternalKey<'a> {
    pub fn new(user_key: &'a [u8], kind: KeyType) -> Self {
        Self { user_key, kind }
    }

    /// Decodes `user_key || tag`. The user key must not be empty.
    pub fn parse(encoded: &'a [u8]) -> Result<Self> {
        let (tag, user_key) = match encoded.split_last() {
            Some((tag, user_key)) if !user_key.is_empty() => (*tag, user_key),
            _ => {
                return Err(Error::DataCorrupted(format!(
                    "internal key too short: {} bytes",
                    encoded.len()
                )))
            }
        };

        Ok(Self {
            user_key,
            kind: KeyType::try_from(tag)?,
        })
    }

    pub fn user_key(&self) -> &'a [u8] {
        self.user_key
    }

    pub fn kind(&self) -> KeyType {
        self.kind
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == KeyType::Tombstone
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(self.user_key, self.kind)
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.user_key);
        buf.push(self.kind as u8);
    }
}

pub fn encode(user_key: &[u8], kind: KeyType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(user_key.len() + 1);
    InternalKey::new(user_key, kind).encode_to(&mut buf);
    buf
}

/// User key portion of an encoded internal key, without validation.
pub fn user_key(encoded: &[u8]) -> &[u8] {
    encoded.split_last().map_or(encoded, |(_, user_key)| user_key)
}

/// Orders two encoded internal keys by user key, then by tag.
pub fn compare(a: &[u8], b: &[u8]) -> Ordering {
    user_key(a)
        .cmp(user_key(b))
        .then_with(|| a.last().cmp(&b.last()))
}
