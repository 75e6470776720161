//! Anchored, versioned partitions of the on-disk key space.
//!
//! A version is an immutable snapshot of the table set: an ascending array
//! of anchor keys, each owning the key range up to the next anchor and at
//! most one table file. Versions are reference counted; readers pin the
//! version they started under and compaction publishes a successor without
//! disturbing them.
//!
//! Each version persists as a `NNNNNNNN.ver` descriptor (bincode body plus
//! a CRC32C trailer, written temp-then-rename). The `HEAD` symlink names
//! the live descriptor and `HEAD1` its predecessor, so recovery can pair
//! WAL files with the versions they were opened against.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::CRC32C;
use crate::record::Record;
use crate::zone::table::{BlockCache, Table, TableIter};
use crate::errdata;

pub struct Partition {
    /// First key of this partition's range; the range runs to the next
    /// partition's anchor.
    pub anchor: Vec<u8>,
    /// The partition's table; `None` only in the bootstrap version.
    pub table: Option<Arc<Table>>,
    /// Compaction disposition, set while this version is being superseded.
    rejected: AtomicBool,
}

impl Partition {
    pub fn new(anchor: Vec<u8>, table: Option<Arc<Table>>) -> Self {
        Self {
            anchor,
            table,
            rejected: AtomicBool::new(false),
        }
    }
}

/// An anchor key with its accept/reject disposition after a compaction.
pub struct Anchor {
    pub key: Vec<u8>,
    pub rejected: bool,
}

pub struct Version {
    pub seq: u64,
    pub partitions: Vec<Partition>,
}

#[derive(Serialize, Deserialize)]
struct VersionMeta {
    seq: u64,
    partitions: Vec<PartitionMeta>,
}

#[derive(Serialize, Deserialize)]
struct PartitionMeta {
    anchor: Vec<u8>,
    table_id: Option<u64>,
}

impl Version {
    /// The empty bootstrap version: one anchorless-range partition with no
    /// table.
    pub fn bootstrap() -> Self {
        Self {
            seq: 1,
            partitions: vec![Partition::new(Vec::new(), None)],
        }
    }

    /// Index of the partition owning `key`: the rightmost anchor <= `key`.
    /// The first anchor is the empty key, so every key has an owner.
    pub fn find_partition(&self, key: &[u8]) -> usize {
        let mut left = 0usize;
        let mut right = self.partitions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            if self.partitions[mid].anchor.as_slice() <= key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left.saturating_sub(1)
    }

    /// Point lookup observing tombstones: the stored record is returned
    /// as-is, the caller decides what a tombstone means.
    pub fn get(&self, key: &[u8], hash32: u32) -> Result<Option<Record>> {
        let partition = &self.partitions[self.find_partition(key)];
        match &partition.table {
            Some(table) => table.get(key, hash32),
            None => Ok(None),
        }
    }

    pub fn probe(&self, key: &[u8], hash32: u32) -> Result<bool> {
        Ok(self
            .get(key, hash32)?
            .map(|rec| !rec.tombstone)
            .unwrap_or(false))
    }

    /// The anchor array with per-partition dispositions, for the
    /// reinsert walk after a compaction.
    pub fn anchors(&self) -> Vec<Anchor> {
        self.partitions
            .iter()
            .map(|p| Anchor {
                key: p.anchor.clone(),
                rejected: p.rejected.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn mark_rejected(&self, partition: usize) {
        self.partitions[partition]
            .rejected
            .store(true, Ordering::Release);
    }

    pub fn rejected(&self, partition: usize) -> bool {
        self.partitions[partition].rejected.load(Ordering::Acquire)
    }

    /// Total on-disk bytes of this version's tables.
    pub fn on_disk_bytes(&self) -> u64 {
        self.partitions
            .iter()
            .filter_map(|p| p.table.as_ref())
            .map(|t| t.size())
            .sum()
    }

    pub fn iter(self: &Arc<Self>) -> VersionIter {
        VersionIter {
            version: Arc::clone(self),
            partition: 0,
            table_iter: None,
        }
    }

    pub fn descriptor_name(seq: u64) -> String {
        format!("{seq:08}.ver")
    }

    /// Persists the descriptor as `NNNNNNNN.ver`, temp-then-rename, and
    /// fsyncs it. Returns the descriptor file name.
    pub fn save(&self, dir: &Path) -> Result<String> {
        let meta = VersionMeta {
            seq: self.seq,
            partitions: self
                .partitions
                .iter()
                .map(|p| PartitionMeta {
                    anchor: p.anchor.clone(),
                    table_id: p.table.as_ref().map(|t| t.id()),
                })
                .collect(),
        };

        let body = bincode::serialize(&meta)?;
        let crc = CRC32C.checksum(&body);
        let name = Self::descriptor_name(self.seq);
        let tmp = dir.join(format!("{name}.tmp"));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.write_all(&crc.to_le_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, dir.join(&name))?;
        Ok(name)
    }

    /// Loads a descriptor and opens its tables.
    pub fn load(
        dir: &Path,
        name: &str,
        cache: &Arc<BlockCache>,
        reads: &Arc<AtomicU64>,
    ) -> Result<Self> {
        let raw = std::fs::read(dir.join(name))?;
        if raw.len() < 4 {
            return errdata!("version descriptor {name} too short");
        }
        let (body, trailer) = raw.split_at(raw.len() - 4);
        let stored = u32::from_le_bytes(trailer.try_into().expect("4-byte trailer"));
        if stored != CRC32C.checksum(body) {
            return errdata!("version descriptor {name} checksum mismatch");
        }
        let meta: VersionMeta = bincode::deserialize(body)?;

        let mut partitions = Vec::with_capacity(meta.partitions.len());
        for pm in &meta.partitions {
            let table = match pm.table_id {
                Some(id) => {
                    let path = dir.join(format!("{id:08}.sstx"));
                    Some(Arc::new(Table::open(
                        &path,
                        id,
                        Arc::clone(cache),
                        Arc::clone(reads),
                    )?))
                }
                None => None,
            };
            partitions.push(Partition::new(pm.anchor.clone(), table));
        }

        let version = Self {
            seq: meta.seq,
            partitions,
        };
        version.validate()?;
        Ok(version)
    }

    fn validate(&self) -> Result<()> {
        if self.partitions.is_empty() {
            return errdata!("version {} has no partitions", self.seq);
        }
        if !self.partitions[0].anchor.is_empty() {
            return errdata!("version {} first anchor is not the empty key", self.seq);
        }
        for pair in self.partitions.windows(2) {
            if pair[0].anchor >= pair[1].anchor {
                return Err(Error::InvalidData(format!(
                    "version {} anchors out of order",
                    self.seq
                )));
            }
        }
        Ok(())
    }
}

/// Ordered cursor over every record of a version, crossing partition
/// boundaries transparently.
pub struct VersionIter {
    version: Arc<Version>,
    partition: usize,
    table_iter: Option<TableIter>,
}

impl VersionIter {
    /// Positions at the first record with key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.partition = self.version.find_partition(key);
        self.table_iter = None;
        if let Some(table) = &self.version.partitions[self.partition].table {
            let mut iter = table.iter();
            iter.seek(key)?;
            self.table_iter = Some(iter);
        }
        self.skip_empty_partitions()
    }

    pub fn peek(&self) -> Option<&Record> {
        self.table_iter.as_ref().and_then(|i| i.peek())
    }

    pub fn advance(&mut self) -> Result<()> {
        if let Some(iter) = &mut self.table_iter {
            iter.advance()?;
        }
        self.skip_empty_partitions()
    }

    /// Moves to the next partition with records whenever the current
    /// cursor is exhausted. Later partitions hold strictly greater keys.
    fn skip_empty_partitions(&mut self) -> Result<()> {
        loop {
            if self.table_iter.as_ref().is_some_and(|i| i.peek().is_some()) {
                return Ok(());
            }
            if self.partition + 1 >= self.version.partitions.len() {
                self.table_iter = None;
                return Ok(());
            }
            self.partition += 1;
            self.table_iter = match &self.version.partitions[self.partition].table {
                Some(table) => {
                    let mut iter = table.iter();
                    iter.rewind()?;
                    Some(iter)
                }
                None => None,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::key_hash32;
    use crate::zone::table::TableWriter;
    use tempfile::TempDir;

    fn cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::new(1024))
    }

    fn write_table(dir: &TempDir, id: u64, keys: &[&[u8]]) -> Arc<Table> {
        let path = dir.path().join(format!("{id:08}.sstx"));
        let mut writer = TableWriter::create(path, id, true, true).expect("create");
        for key in keys {
            writer
                .add(&Record::put(key.to_vec(), format!("v-{id}").into_bytes()))
                .expect("add");
        }
        writer
            .finish(cache(), Arc::new(AtomicU64::new(0)))
            .expect("finish")
            .expect("non-empty")
            .0
    }

    fn two_partition_version(dir: &TempDir) -> Arc<Version> {
        let t1 = write_table(dir, 1, &[b"aaa", b"bbb", b"ccc"]);
        let t2 = write_table(dir, 2, &[b"mmm", b"nnn", b"zzz"]);
        Arc::new(Version {
            seq: 2,
            partitions: vec![
                Partition::new(Vec::new(), Some(t1)),
                Partition::new(b"mmm".to_vec(), Some(t2)),
            ],
        })
    }

    #[test]
    fn test_bootstrap_lookup() {
        let version = Version::bootstrap();
        assert_eq!(version.seq, 1);
        assert!(version.get(b"anything", key_hash32(b"anything")).unwrap().is_none());
        assert!(!version.probe(b"anything", key_hash32(b"anything")).unwrap());
    }

    #[test]
    fn test_find_partition() {
        let dir = TempDir::new().expect("tempdir");
        let version = two_partition_version(&dir);

        assert_eq!(version.find_partition(b""), 0);
        assert_eq!(version.find_partition(b"bbb"), 0);
        assert_eq!(version.find_partition(b"lzz"), 0);
        assert_eq!(version.find_partition(b"mmm"), 1);
        assert_eq!(version.find_partition(b"zzzz"), 1);
    }

    #[test]
    fn test_get_routes_to_partition() {
        let dir = TempDir::new().expect("tempdir");
        let version = two_partition_version(&dir);

        let rec = version.get(b"bbb", key_hash32(b"bbb")).unwrap().unwrap();
        assert_eq!(rec.value, b"v-1");
        let rec = version.get(b"nnn", key_hash32(b"nnn")).unwrap().unwrap();
        assert_eq!(rec.value, b"v-2");
        assert!(version.get(b"qqq", key_hash32(b"qqq")).unwrap().is_none());
    }

    #[test]
    fn test_iter_crosses_partitions() {
        let dir = TempDir::new().expect("tempdir");
        let version = two_partition_version(&dir);

        let mut iter = version.iter();
        iter.seek(b"").expect("seek");
        let mut keys = Vec::new();
        while let Some(rec) = iter.peek() {
            keys.push(rec.key.clone());
            iter.advance().expect("advance");
        }
        assert_eq!(
            keys,
            vec![
                b"aaa".to_vec(),
                b"bbb".to_vec(),
                b"ccc".to_vec(),
                b"mmm".to_vec(),
                b"nnn".to_vec(),
                b"zzz".to_vec()
            ]
        );

        // Seeking into the gap lands on the next partition.
        iter.seek(b"ddd").expect("seek");
        assert_eq!(iter.peek().unwrap().key, b"mmm");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let version = two_partition_version(&dir);

        let name = version.save(dir.path()).expect("save");
        assert_eq!(name, "00000002.ver");

        let loaded = Version::load(dir.path(), &name, &cache(), &Arc::new(AtomicU64::new(0)))
            .expect("load");
        assert_eq!(loaded.seq, 2);
        assert_eq!(loaded.partitions.len(), 2);
        assert_eq!(loaded.partitions[1].anchor, b"mmm");
        let rec = loaded.get(b"aaa", key_hash32(b"aaa")).unwrap().unwrap();
        assert_eq!(rec.value, b"v-1");
    }

    #[test]
    fn test_load_rejects_corrupt_descriptor() {
        let dir = TempDir::new().expect("tempdir");
        let version = two_partition_version(&dir);
        let name = version.save(dir.path()).expect("save");

        let mut raw = std::fs::read(dir.path().join(&name)).expect("read");
        let mid = raw.len() / 2;
        raw[mid] ^= 0xFF;
        std::fs::write(dir.path().join(&name), &raw).expect("write");

        assert!(
            Version::load(dir.path(), &name, &cache(), &Arc::new(AtomicU64::new(0))).is_err()
        );
    }

    #[test]
    fn test_anchors_carry_dispositions() {
        let dir = TempDir::new().expect("tempdir");
        let version = two_partition_version(&dir);
        version.mark_rejected(1);

        let anchors = version.anchors();
        assert_eq!(anchors.len(), 2);
        assert!(!anchors[0].rejected);
        assert!(anchors[1].rejected);
        assert_eq!(anchors[1].key, b"mmm");
    }
}
