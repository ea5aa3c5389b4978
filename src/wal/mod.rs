//! Write-ahead log segments.
//!
//! Every memtable generation is backed by one log segment stored at
//! `redo/<file_id>`. A segment is a plain sequence of length-prefixed records,
//! each holding one encoded write batch:
//!
//! ```text
//! +----------------+-------------------+----------------+-----
//! |record_len: u32 | record bytes      |record_len: u32 | ...
//! +----------------+-------------------+----------------+-----
//! ```
//!
//! The length is little-endian. There is no segment header; an empty file is a
//! valid, empty segment.
//!
//! # Durability
//!
//! A write is committed once `LogWriter::write` returns: the record has been
//! handed to the OS and, when syncing is enabled, forced to stable storage.
//!
//! # Torn tails
//!
//! A crash can leave a partially written record at the end of a segment. The
//! reader treats a short length header or a short payload as the end of the
//! usable log rather than as an error.

pub mod reader;
pub mod writer;

pub use reader::LogReader;
pub use writer::LogWriter;
