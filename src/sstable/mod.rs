//! Sorted String Table (SSTable) implementation for persistent storage.
//!
//! A table is immutable once written. It holds internal keys in strictly
//! increasing user key order, at most one entry per user key.
//!
//! ## File Format
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |  ← cut once it reaches the configured block size
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Index Block       |  ← last key of each data block -> block handle
//! +-------------------+
//! | Meta Block        |  ← entry_count, first_key, last_key
//! +-------------------+
//! | Footer (40 bytes) |  ← index handle, meta handle, magic
//! +-------------------+
//! ```
//!
//! ## Block Format (`block.rs`)
//!
//! ```text
//! +---------+-----+-----------+-------+-----+------------------+-----------+
//! | klen:u32| key | vlen:u32  | value | ... | offset:u32 * N   | N: u32    |
//! +---------+-----+-----------+-------+-----+------------------+-----------+
//! ```
//!
//! The same block codec is used for data, index and meta blocks. Seeks use a
//! binary search over the offset table comparing user keys.

pub mod block;
pub mod builder;
pub mod format;
pub mod table;

pub use builder::TableBuilder;
pub use table::{Table, TableIter};
