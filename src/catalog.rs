//! The catalog: which tables make up the database, and how far the log has
//! been folded into them.
//!
//! Catalog values are immutable. An update builds a new value with
//! [`Catalog::apply`], persists it with [`Catalog::store`] and only then
//! replaces the shared handle, so readers never see a half-applied change.
//!
//! ## File Format
//!
//! ```text
//! +-------------+-------------+------------------+-------------+---------+
//! | magic: [8]  | version:u32 | payload_len: u32 | crc32: u32  | payload |
//! +-------------+-------------+------------------+-------------+---------+
//! ```
//!
//! The payload is the bincode encoding of [`RawCatalog`]. The file is written
//! to a temporary sibling, synced, then renamed over `meta`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::paths::{self, DbPaths};
use crate::sstable::Table;

const MAGIC: &[u8; 8] = b"LSMKV\0CT";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 20;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Serialized form of a catalog. Tables are referenced by file id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCatalog {
    pub committed_file_id: u64,
    pub next_file_id: u64,
    pub sstable_ids: Vec<u64>,
    /// Leading tables that were written by compaction.
    pub compacted: u32,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    committed_file_id: u64,
    next_file_id: u64,
    /// Oldest first. Readers walk it in reverse.
    sstables: Vec<Arc<Table>>,
    // Length of the prefix of `sstables` produced by compaction. Checkpointed
    // tables are appended after it.
    compacted: usize,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            committed_file_id: 0,
            next_file_id: 1,
            sstables: Vec::new(),
            compacted: 0,
        }
    }

    /// Highest log segment id whose writes are all present in tables.
    pub fn committed_file_id(&self) -> u64 {
        self.committed_file_id
    }

    pub fn next_file_id(&self) -> u64 {
        self.next_file_id
    }

    pub fn sstables(&self) -> &[Arc<Table>] {
        &self.sstables
    }

    /// Tables written by compaction, oldest first.
    pub fn compacted_tables(&self) -> &[Arc<Table>] {
        &self.sstables[..self.compacted]
    }

    /// Tables checkpointed since the last compaction.
    pub fn fresh_tables(&self) -> &[Arc<Table>] {
        &self.sstables[self.compacted..]
    }

    /// Builds the successor catalog.
    ///
    /// `removed` must match a contiguous run of the current tables, compared by
    /// identity; `added` takes its place. With nothing removed, `added` is
    /// appended as the newest tables. A replacement that touches the
    /// compacted prefix extends it over `added`.
    pub fn apply(
        &self,
        added: &[Arc<Table>],
        removed: &[Arc<Table>],
        committed_file_id: u64,
        next_file_id: u64,
    ) -> Result<Catalog> {
        let mut sstables = self.sstables.clone();
        let mut compacted = self.compacted;

        if removed.is_empty() {
            sstables.extend(added.iter().cloned());
        } else {
            let start = sstables
                .iter()
                .position(|t| Arc::ptr_eq(t, &removed[0]))
                .ok_or_else(|| {
                    Error::InvalidState(format!(
                        "removed table {} not in catalog",
                        removed[0].path().display()
                    ))
                })?;

            let contiguous = start + removed.len() <= sstables.len()
                && sstables[start..start + removed.len()]
                    .iter()
                    .zip(removed)
                    .all(|(a, b)| Arc::ptr_eq(a, b));
            if !contiguous {
                return Err(Error::InvalidState(
                    "removed tables are not a contiguous range of the catalog".to_string(),
                ));
            }

            sstables.splice(start..start + removed.len(), added.iter().cloned());
            if start <= compacted {
                compacted = start + added.len() + compacted.saturating_sub(start + removed.len());
            }
        }

        let catalog = Catalog {
            committed_file_id: committed_file_id.max(self.committed_file_id),
            next_file_id: next_file_id.max(self.next_file_id),
            sstables,
            compacted,
        };
        if catalog.committed_file_id >= catalog.next_file_id {
            return Err(Error::InvalidState(format!(
                "committed id {} must be below next id {}",
                catalog.committed_file_id, catalog.next_file_id
            )));
        }
        Ok(catalog)
    }

    pub fn to_raw(&self) -> Result<RawCatalog> {
        let sstable_ids = self
            .sstables
            .iter()
            .map(|table| table_file_id(table))
            .collect::<Result<Vec<_>>>()?;

        Ok(RawCatalog {
            committed_file_id: self.committed_file_id,
            next_file_id: self.next_file_id,
            sstable_ids,
            compacted: self.compacted as u32,
        })
    }

    /// Persists the catalog with write-to-temp then rename.
    pub fn store(&self, paths: &DbPaths) -> Result<()> {
        let payload = bincode::serialize(&self.to_raw()?)?;

        let mut header = [0u8; HEADER_SIZE];
        header[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut header[8..12], VERSION);
        LittleEndian::write_u32(&mut header[12..16], payload.len() as u32);
        LittleEndian::write_u32(&mut header[16..20], CRC32.checksum(&payload));

        let target = paths.catalog_file();
        let tmp = target.with_file_name("meta~");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&header)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &target)?;

        // Make the rename itself durable.
        File::open(paths.root())?.sync_all()?;

        tracing::debug!(
            committed = self.committed_file_id,
            next = self.next_file_id,
            tables = self.sstables.len(),
            "Stored catalog"
        );
        Ok(())
    }

    /// Reads the catalog and opens every table it references.
    pub fn load(paths: &DbPaths) -> Result<Catalog> {
        let raw = read_raw(paths)?;

        let mut sstables = Vec::with_capacity(raw.sstable_ids.len());
        for id in &raw.sstable_ids {
            let path = paths.sst_path(*id);
            match Table::open(&path) {
                Ok(table) => sstables.push(Arc::new(table)),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::DbCorrupted(format!(
                        "catalog references missing table {}",
                        path.display()
                    )))
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Catalog {
            committed_file_id: raw.committed_file_id,
            next_file_id: raw.next_file_id,
            sstables,
            compacted: raw.compacted as usize,
        })
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

fn read_raw(paths: &DbPaths) -> Result<RawCatalog> {
    let path = paths.catalog_file();
    let data = fs::read(&path)?;
    let corrupted = |msg: &str| Error::DbCorrupted(format!("{}: {}", path.display(), msg));

    if data.len() < HEADER_SIZE {
        return Err(corrupted("catalog too short"));
    }
    if &data[0..8] != MAGIC {
        return Err(corrupted("invalid catalog magic"));
    }
    let version = LittleEndian::read_u32(&data[8..12]);
    if version != VERSION {
        return Err(corrupted(&format!("unsupported catalog version {}", version)));
    }
    let len = LittleEndian::read_u32(&data[12..16]) as usize;
    let payload = &data[HEADER_SIZE..];
    if payload.len() != len {
        return Err(corrupted(&format!(
            "payload length {} does not match header {}",
            payload.len(),
            len
        )));
    }
    if CRC32.checksum(payload) != LittleEndian::read_u32(&data[16..20]) {
        return Err(corrupted("checksum mismatch"));
    }

    let raw: RawCatalog =
        bincode::deserialize(payload).map_err(|e| corrupted(&e.to_string()))?;
    if raw.committed_file_id >= raw.next_file_id {
        return Err(corrupted("committed id is not below next id"));
    }
    if raw.compacted as usize > raw.sstable_ids.len() {
        return Err(corrupted("compacted prefix longer than table list"));
    }
    if !raw.sstable_ids.iter().all_unique() {
        return Err(corrupted("duplicate table id"));
    }
    Ok(raw)
}

/// File id encoded in a table's file name.
pub fn table_file_id(table: &Table) -> Result<u64> {
    table
        .path()
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(paths::parse_sst_name)
        .ok_or_else(|| {
            Error::InvalidState(format!(
                "table {} has no file id",
                table.path().display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{encode, KeyType};
    use crate::sstable::TableBuilder;
    use tempfile::TempDir;

    fn setup() -> (TempDir, DbPaths) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let paths = DbPaths::new(dir.path());
        paths.create_dirs().expect("Failed to create dirs");
        (dir, paths)
    }

    fn make_table(paths: &DbPaths, id: u64) -> Arc<Table> {
        let path = paths.sst_path(id);
        let mut builder = TableBuilder::create(&path, 4096).expect("Failed to create table");
        builder
            .add(&encode(format!("key{}", id).as_bytes(), KeyType::Value), b"v")
            .unwrap();
        builder.finish().unwrap();
        Arc::new(Table::open(&path).expect("Failed to open table"))
    }

    fn ids(catalog: &Catalog) -> Vec<u64> {
        catalog.to_raw().unwrap().sstable_ids
    }

    #[test]
    fn test_store_and_load() {
        let (_dir, paths) = setup();
        let t1 = make_table(&paths, 2);
        let t2 = make_table(&paths, 4);

        let catalog = Catalog::new().apply(&[t1, t2], &[], 3, 5).unwrap();
        catalog.store(&paths).unwrap();

        let loaded = Catalog::load(&paths).unwrap();
        assert_eq!(loaded.committed_file_id(), 3);
        assert_eq!(loaded.next_file_id(), 5);
        assert_eq!(ids(&loaded), vec![2, 4]);
        assert_eq!(loaded.sstables()[1].min(), b"key4");
        assert!(!paths.root().join("meta~").exists());
    }

    #[test]
    fn test_apply_replaces_contiguous_range() {
        let (_dir, paths) = setup();
        let tables: Vec<_> = (1..=4).map(|id| make_table(&paths, id)).collect();
        let catalog = Catalog::new().apply(&tables, &[], 0, 5).unwrap();

        let merged = make_table(&paths, 5);
        let next = catalog
            .apply(&[merged], &tables[0..3], 0, 6)
            .expect("Failed to apply compaction result");
        assert_eq!(ids(&next), vec![5, 4]);
        assert_eq!(next.compacted_tables().len(), 1);
        assert_eq!(next.fresh_tables().len(), 1);

        // The previous value is untouched.
        assert_eq!(ids(&catalog), vec![1, 2, 3, 4]);
        assert!(catalog.compacted_tables().is_empty());

        let gap = vec![tables[0].clone(), tables[2].clone()];
        assert!(matches!(
            catalog.apply(&[], &gap, 0, 6),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_compacted_prefix_survives_reload() {
        let (_dir, paths) = setup();
        let inputs: Vec<_> = (1..=3).map(|id| make_table(&paths, id)).collect();
        let catalog = Catalog::new().apply(&inputs, &[], 0, 4).unwrap();

        let outputs: Vec<_> = (4..=5).map(|id| make_table(&paths, id)).collect();
        let catalog = catalog.apply(&outputs, &inputs, 0, 6).unwrap();
        let newer = make_table(&paths, 6);
        let catalog = catalog.apply(&[newer], &[], 0, 7).unwrap();

        assert_eq!(ids(&catalog), vec![4, 5, 6]);
        assert_eq!(catalog.compacted_tables().len(), 2);
        assert_eq!(catalog.fresh_tables().len(), 1);

        catalog.store(&paths).unwrap();
        let loaded = Catalog::load(&paths).unwrap();
        assert_eq!(loaded.compacted_tables().len(), 2);
        assert_eq!(table_file_id(&loaded.fresh_tables()[0]).unwrap(), 6);
    }

    #[test]
    fn test_apply_with_empty_output() {
        let (_dir, paths) = setup();
        let tables: Vec<_> = (1..=2).map(|id| make_table(&paths, id)).collect();
        let catalog = Catalog::new().apply(&tables, &[], 0, 3).unwrap();

        let next = catalog.apply(&[], &tables, 0, 3).unwrap();
        assert!(next.sstables().is_empty());
    }

    #[test]
    fn test_ids_never_move_backwards() {
        let catalog = Catalog::new().apply(&[], &[], 4, 9).unwrap();
        let next = catalog.apply(&[], &[], 2, 3).unwrap();
        assert_eq!(next.committed_file_id(), 4);
        assert_eq!(next.next_file_id(), 9);

        assert!(matches!(
            Catalog::new().apply(&[], &[], 7, 7),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_corrupted_catalog() {
        let (_dir, paths) = setup();
        Catalog::new().store(&paths).unwrap();

        let mut data = fs::read(paths.catalog_file()).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        fs::write(paths.catalog_file(), &data).unwrap();
        assert!(matches!(Catalog::load(&paths), Err(Error::DbCorrupted(_))));

        fs::write(paths.catalog_file(), b"garbage").unwrap();
        assert!(matches!(Catalog::load(&paths), Err(Error::DbCorrupted(_))));
    }

    #[test]
    fn test_missing_table() {
        let (_dir, paths) = setup();
        let table = make_table(&paths, 2);
        Catalog::new().apply(&[table], &[], 0, 3).unwrap().store(&paths).unwrap();

        fs::remove_file(paths.sst_path(2)).unwrap();
        let err = Catalog::load(&paths).unwrap_err();
        assert!(matches!(err, Error::DbCorrupted(ref msg) if msg.contains("missing table")));
    }
}
