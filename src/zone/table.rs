//! Single-file sorted tables.
//!
//! A table file (`NNNNNNNN.sstx`) holds the data blocks of one partition,
//! followed by an index block (first key, offset, and length of every data
//! block) and a fixed footer. The index is loaded into memory when the
//! table opens; data blocks are read on demand through the shared block
//! cache.
//!
//! ```text
//! +-------------------+
//! | data block 1..N   |
//! +-------------------+
//! | index entries     |  varint klen, key, offset u64 LE, len u32 LE
//! +-------------------+
//! | footer            |  index_offset u64, index_count u32,
//! |                   |  entry_count u64, flags u8, magic u32 (all LE)
//! +-------------------+
//! ```
//!
//! Tables are immutable once finished. A table superseded by a newer
//! version is marked obsolete and its file is removed when the last
//! reference drops.

use std::fs::File;
use std::io::Cursor;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use varint_rs::{VarintReader, VarintWriter};

use crate::error::{Error, Result};
use crate::record::Record;
use crate::zone::block::{Block, BlockBuilder, BlockIter};
use crate::errdata;

/// Target data block size; a block may exceed it by one entry.
pub const MAX_BLOCK_SIZE: usize = 4096;

const FOOTER_SIZE: usize = 8 + 4 + 8 + 1 + 4;
const MAGIC: u32 = 0x454D_4254;
const FLAG_TAGS: u8 = 0x01;

/// Shared cache of decoded data blocks, keyed by (table id, block index).
pub type BlockCache = quick_cache::sync::Cache<(u64, u32), Arc<Block>>;

struct IndexEntry {
    first_key: Vec<u8>,
    offset: u64,
    len: u32,
}

/// Builder for a new table file.
pub struct TableWriter {
    file: File,
    path: PathBuf,
    id: u64,
    builder: BlockBuilder,
    block_first_key: Option<Vec<u8>>,
    index: Vec<IndexEntry>,
    offset: u64,
    entry_count: u64,
    ckeys: bool,
    tags: bool,
}

impl TableWriter {
    pub fn create(path: PathBuf, id: u64, ckeys: bool, tags: bool) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            id,
            builder: BlockBuilder::new(ckeys, tags),
            block_first_key: None,
            index: Vec::new(),
            offset: 0,
            entry_count: 0,
            ckeys,
            tags,
        })
    }

    /// Appends a record. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, record: &Record) -> Result<()> {
        if self.block_first_key.is_none() {
            self.block_first_key = Some(record.key.clone());
        }
        self.builder.add(record);
        self.entry_count += 1;

        if self.builder.len() >= MAX_BLOCK_SIZE {
            self.finish_block()?;
        }
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        let builder = std::mem::replace(&mut self.builder, BlockBuilder::new(self.ckeys, self.tags));
        let data = builder.finish();
        let first_key = self
            .block_first_key
            .take()
            .ok_or_else(|| Error::InvalidData("data block without a first key".into()))?;

        self.file.write_all_at(&data, self.offset)?;
        self.index.push(IndexEntry {
            first_key,
            offset: self.offset,
            len: data.len() as u32,
        });
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Bytes of data blocks written so far; used by compaction to decide
    /// partition splits.
    pub fn data_bytes(&self) -> u64 {
        self.offset + self.builder.len() as u64
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Writes index and footer, fsyncs, and reopens the table for reads.
    /// An empty table writes nothing and removes its file.
    pub fn finish(
        mut self,
        cache: Arc<BlockCache>,
        reads: Arc<AtomicU64>,
    ) -> Result<Option<(Arc<Table>, u64)>> {
        if !self.builder.is_empty() {
            self.finish_block()?;
        }
        if self.entry_count == 0 {
            drop(self.file);
            std::fs::remove_file(&self.path)?;
            return Ok(None);
        }

        let index_offset = self.offset;
        let mut tail = Vec::new();
        for entry in &self.index {
            tail.write_u32_varint(entry.first_key.len() as u32).unwrap();
            tail.extend_from_slice(&entry.first_key);
            tail.write_u64::<LittleEndian>(entry.offset).unwrap();
            tail.write_u32::<LittleEndian>(entry.len).unwrap();
        }
        tail.write_u64::<LittleEndian>(index_offset).unwrap();
        tail.write_u32::<LittleEndian>(self.index.len() as u32)
            .unwrap();
        tail.write_u64::<LittleEndian>(self.entry_count).unwrap();
        tail.push(if self.tags { FLAG_TAGS } else { 0 });
        tail.write_u32::<LittleEndian>(MAGIC).unwrap();

        self.file.write_all_at(&tail, index_offset)?;
        self.file.sync_all()?;

        let written = index_offset + tail.len() as u64;
        let table = Table::open(&self.path, self.id, cache, reads)?;
        Ok(Some((Arc::new(table), written)))
    }
}

/// An immutable, open table.
pub struct Table {
    id: u64,
    path: PathBuf,
    file: File,
    index: Vec<IndexEntry>,
    entry_count: u64,
    size: u64,
    cache: Arc<BlockCache>,
    /// Logical bytes loaded from disk, shared with the zone's read counter.
    reads: Arc<AtomicU64>,
    obsolete: AtomicBool,
}

impl Table {
    pub fn open(
        path: &Path,
        id: u64,
        cache: Arc<BlockCache>,
        reads: Arc<AtomicU64>,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE as u64 {
            return errdata!("table {path:?} too short: {size} bytes");
        }

        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact_at(&mut footer, size - FOOTER_SIZE as u64)?;
        let mut cursor = Cursor::new(&footer[..]);
        let index_offset = cursor.read_u64::<LittleEndian>()?;
        let index_count = cursor.read_u32::<LittleEndian>()? as usize;
        let entry_count = cursor.read_u64::<LittleEndian>()?;
        let _flags = cursor.read_u8()?;
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return errdata!("table {path:?} bad magic {magic:#x}");
        }
        let index_end = size - FOOTER_SIZE as u64;
        if index_offset > index_end {
            return errdata!("table {path:?} index offset out of bounds");
        }

        let mut raw = vec![0u8; (index_end - index_offset) as usize];
        file.read_exact_at(&mut raw, index_offset)?;
        let mut cursor = Cursor::new(&raw[..]);
        let mut index = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            let klen = cursor.read_u32_varint()? as usize;
            let mut first_key = vec![0u8; klen];
            std::io::Read::read_exact(&mut cursor, &mut first_key)?;
            let offset = cursor.read_u64::<LittleEndian>()?;
            let len = cursor.read_u32::<LittleEndian>()?;
            index.push(IndexEntry {
                first_key,
                offset,
                len,
            });
        }

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file,
            index,
            entry_count,
            size,
            cache,
            reads,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Flags the backing file for removal once the last reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Point lookup; tombstone records are returned as such, the caller
    /// interprets them.
    pub fn get(self: &Arc<Self>, key: &[u8], hash32: u32) -> Result<Option<Record>> {
        let Some(block_idx) = self.block_for(key) else {
            return Ok(None);
        };
        let block = self.load_block(block_idx)?;
        block.get(key, hash32)
    }

    /// Index of the rightmost block whose first key is <= `key`; `None`
    /// when `key` sorts before the whole table.
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        let mut left = 0usize;
        let mut right = self.index.len();
        while left < right {
            let mid = left + (right - left) / 2;
            if self.index[mid].first_key.as_slice() <= key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        left.checked_sub(1)
    }

    fn load_block(self: &Arc<Self>, block_idx: usize) -> Result<Arc<Block>> {
        let cache_key = (self.id, block_idx as u32);
        if let Some(block) = self.cache.get(&cache_key) {
            return Ok(block);
        }
        let entry = &self.index[block_idx];
        let mut raw = vec![0u8; entry.len as usize];
        self.file.read_exact_at(&mut raw, entry.offset)?;
        self.reads.fetch_add(entry.len as u64, Ordering::Relaxed);
        let block = Arc::new(Block::decode(raw)?);
        self.cache.insert(cache_key, Arc::clone(&block));
        Ok(block)
    }

    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter {
            table: Arc::clone(self),
            block_idx: 0,
            iter: None,
        }
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            tracing::debug!(id = self.id, "removing obsolete table file");
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Cursor over all records of a table, in key order.
pub struct TableIter {
    table: Arc<Table>,
    /// Block holding the current record.
    block_idx: usize,
    iter: Option<BlockIter>,
}

impl TableIter {
    pub fn rewind(&mut self) -> Result<()> {
        self.enter_block(0)?;
        Ok(())
    }

    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        let block_idx = self.table.block_for(key).unwrap_or(0);
        self.enter_block(block_idx)?;
        if let Some(iter) = &mut self.iter {
            iter.seek(key)?;
        }
        // The target may sort past everything in this block; the next
        // block (if any) starts strictly above the target.
        if self.iter.as_ref().is_some_and(|i| i.peek().is_none()) {
            self.enter_block(block_idx + 1)?;
        }
        Ok(())
    }

    fn enter_block(&mut self, block_idx: usize) -> Result<()> {
        if block_idx >= self.table.index.len() {
            self.iter = None;
            self.block_idx = block_idx;
            return Ok(());
        }
        let block = self.table.load_block(block_idx)?;
        let mut iter = BlockIter::new(block);
        iter.rewind()?;
        self.block_idx = block_idx;
        self.iter = Some(iter);
        Ok(())
    }

    pub fn peek(&self) -> Option<&Record> {
        self.iter.as_ref().and_then(|i| i.peek())
    }

    pub fn advance(&mut self) -> Result<()> {
        let Some(iter) = &mut self.iter else {
            return Ok(());
        };
        iter.advance()?;
        if iter.peek().is_none() {
            self.enter_block(self.block_idx + 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::key_hash32;
    use tempfile::TempDir;

    fn test_cache() -> Arc<BlockCache> {
        Arc::new(BlockCache::new(1024))
    }

    fn build_table(dir: &TempDir, n: usize) -> Arc<Table> {
        let path = dir.path().join("00000001.sstx");
        let mut writer = TableWriter::create(path, 1, true, true).expect("create");
        for i in 0..n {
            writer
                .add(&Record::put(
                    format!("key{i:06}").into_bytes(),
                    format!("value{i}").into_bytes(),
                ))
                .expect("add");
        }
        let (table, _written) = writer
            .finish(test_cache(), Arc::new(AtomicU64::new(0)))
            .expect("finish")
            .expect("non-empty");
        table
    }

    #[test]
    fn test_write_read_small() {
        let dir = TempDir::new().expect("tempdir");
        let table = build_table(&dir, 10);
        assert_eq!(table.entry_count(), 10);

        for i in 0..10 {
            let key = format!("key{i:06}").into_bytes();
            let rec = table
                .get(&key, key_hash32(&key))
                .expect("get")
                .expect("present");
            assert_eq!(rec.value, format!("value{i}").into_bytes());
        }
        let missing = b"key999999";
        assert!(table
            .get(missing, key_hash32(missing))
            .expect("get")
            .is_none());
        assert!(table.get(b"aaa", key_hash32(b"aaa")).expect("get").is_none());
    }

    #[test]
    fn test_multi_block_get_and_iter() {
        let dir = TempDir::new().expect("tempdir");
        let n = 2000;
        let table = build_table(&dir, n);
        assert!(table.index.len() > 1, "expected several blocks");

        for i in (0..n).step_by(97) {
            let key = format!("key{i:06}").into_bytes();
            assert!(table.get(&key, key_hash32(&key)).expect("get").is_some());
        }

        let mut iter = table.iter();
        iter.rewind().expect("rewind");
        let mut count = 0;
        let mut last: Option<Vec<u8>> = None;
        while let Some(rec) = iter.peek() {
            if let Some(prev) = &last {
                assert!(prev < &rec.key, "iteration must be strictly ascending");
            }
            last = Some(rec.key.clone());
            count += 1;
            iter.advance().expect("advance");
        }
        assert_eq!(count, n);
    }

    #[test]
    fn test_seek_positions() {
        let dir = TempDir::new().expect("tempdir");
        let table = build_table(&dir, 2000);

        let mut iter = table.iter();
        iter.seek(b"key001000").expect("seek");
        assert_eq!(iter.peek().unwrap().key, b"key001000");

        iter.seek(b"key000999x").expect("seek");
        assert_eq!(iter.peek().unwrap().key, b"key001000");

        iter.seek(b"zzz").expect("seek");
        assert!(iter.peek().is_none());

        iter.seek(b"").expect("seek");
        assert_eq!(iter.peek().unwrap().key, b"key000000");
    }

    #[test]
    fn test_empty_writer_removes_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("00000009.sstx");
        let writer = TableWriter::create(path.clone(), 9, true, true).expect("create");
        let out = writer
            .finish(test_cache(), Arc::new(AtomicU64::new(0)))
            .expect("finish");
        assert!(out.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_obsolete_table_removes_file_on_drop() {
        let dir = TempDir::new().expect("tempdir");
        let table = build_table(&dir, 10);
        let path = dir.path().join("00000001.sstx");
        assert!(path.exists());

        table.mark_obsolete();
        drop(table);
        assert!(!path.exists());
    }

    #[test]
    fn test_read_counter_grows() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("00000002.sstx");
        let mut writer = TableWriter::create(path.clone(), 2, false, false).expect("create");
        for i in 0..500 {
            writer
                .add(&Record::put(
                    format!("key{i:06}").into_bytes(),
                    vec![0u8; 64],
                ))
                .expect("add");
        }
        let reads = Arc::new(AtomicU64::new(0));
        let (table, _) = writer
            .finish(test_cache(), Arc::clone(&reads))
            .expect("finish")
            .expect("non-empty");

        let key = b"key000123";
        table.get(key, key_hash32(key)).expect("get");
        assert!(reads.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bad.sstx");
        std::fs::write(&path, b"not a table file, definitely").expect("write");
        assert!(Table::open(&path, 3, test_cache(), Arc::new(AtomicU64::new(0))).is_err());
    }
}
