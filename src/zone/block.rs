//! Table data blocks.
//!
//! A block packs sorted records back to back, with restart points every
//! [`RESTART_INTERVAL`] entries. When prefix compression is on, an entry
//! between restarts stores only the suffix it does not share with its
//! predecessor; a restart entry always stores the whole key, which is what
//! makes restart points binary-searchable. When hash tags are on, one byte
//! of each key's hash is kept per entry so a point lookup can skip key
//! comparisons inside a restart region.
//!
//! ```text
//! +----------------------------------------------+
//! | entry*: shared | unshared | vlen_ts varints, |
//! |         key suffix, value                    |
//! +----------------------------------------------+
//! | tag bytes (entry_count, if tags)             |
//! +----------------------------------------------+
//! | restart offsets (u32 LE each)                |
//! +----------------------------------------------+
//! | restart count u32 | entry count u32 | flags  |
//! +----------------------------------------------+
//! ```

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use varint_rs::{VarintReader, VarintWriter};

use crate::error::{Error, Result};
use crate::hash::key_hash32;
use crate::record::{Record, VLEN_MASK, VLEN_TS};
use crate::errdata;

pub const RESTART_INTERVAL: usize = 16;

const FLAG_TAGS: u8 = 0x01;

pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    tags: Vec<u8>,
    entry_count: usize,
    last_key: Vec<u8>,
    ckeys: bool,
    emit_tags: bool,
}

impl BlockBuilder {
    pub fn new(ckeys: bool, tags: bool) -> Self {
        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            tags: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
            ckeys,
            emit_tags: tags,
        }
    }

    /// Appends a record. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, record: &Record) {
        let key = &record.key;
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else if self.ckeys {
            shared_prefix(&self.last_key, key)
        } else {
            0
        };

        self.buf.write_u32_varint(shared as u32).unwrap();
        self.buf
            .write_u32_varint((key.len() - shared) as u32)
            .unwrap();
        self.buf.write_u32_varint(record.vlen_ts()).unwrap();
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(&record.value);

        if self.emit_tags {
            self.tags.push(key_hash32(key) as u8);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    /// Current encoded size, trailer included.
    pub fn len(&self) -> usize {
        self.buf.len() + self.tags.len() + self.restarts.len() * 4 + 9
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.emit_tags {
            self.buf.extend_from_slice(&self.tags);
        }
        for pos in &self.restarts {
            self.buf.write_u32::<LittleEndian>(*pos).unwrap();
        }
        self.buf
            .write_u32::<LittleEndian>(self.restarts.len() as u32)
            .unwrap();
        self.buf
            .write_u32::<LittleEndian>(self.entry_count as u32)
            .unwrap();
        self.buf.push(if self.emit_tags { FLAG_TAGS } else { 0 });
        self.buf
    }
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(x, y)| x == y).count()
}

pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
    tags: Option<Vec<u8>>,
    entry_count: usize,
}

impl Block {
    pub fn decode(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 9 {
            return errdata!("block too short: {} bytes", raw.len());
        }
        let flags = raw[raw.len() - 1];
        let mut cursor = Cursor::new(&raw[raw.len() - 9..raw.len() - 1]);
        let restart_count = cursor.read_u32::<LittleEndian>()? as usize;
        let entry_count = cursor.read_u32::<LittleEndian>()? as usize;

        let restarts_off = (raw.len() - 9)
            .checked_sub(restart_count * 4)
            .ok_or_else(|| Error::InvalidData("block restart array out of bounds".into()))?;
        let mut cursor = Cursor::new(&raw[restarts_off..raw.len() - 9]);
        let mut restarts = Vec::with_capacity(restart_count);
        for _ in 0..restart_count {
            restarts.push(cursor.read_u32::<LittleEndian>()?);
        }

        let (data_end, tags) = if flags & FLAG_TAGS != 0 {
            let tags_off = restarts_off
                .checked_sub(entry_count)
                .ok_or_else(|| Error::InvalidData("block tag array out of bounds".into()))?;
            (tags_off, Some(raw[tags_off..restarts_off].to_vec()))
        } else {
            (restarts_off, None)
        };

        if restarts.first().copied().unwrap_or(0) != 0 {
            return errdata!("block restart array does not start at zero");
        }
        if restarts.iter().any(|&r| r as usize >= data_end.max(1)) {
            return errdata!("block restart offset out of bounds");
        }

        Ok(Self {
            data: raw[..data_end].to_vec(),
            restarts,
            tags,
            entry_count,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Point lookup. `hash32` is the caller-computed key hash used for tag
    /// filtering.
    pub fn get(self: &Arc<Self>, key: &[u8], hash32: u32) -> Result<Option<Record>> {
        if self.entry_count == 0 {
            return Ok(None);
        }
        let restart = self.restart_for(key)?;
        let mut iter = BlockIter::new(Arc::clone(self));
        iter.position_at_restart(restart)?;

        let region_end = (restart + 1) * RESTART_INTERVAL;
        let tag = hash32 as u8;
        while let Some(rec) = iter.peek() {
            if iter.ordinal() > region_end {
                break;
            }
            if let Some(tags) = &self.tags {
                // A tag mismatch proves this is not our key.
                if tags[iter.ordinal() - 1] != tag {
                    iter.advance()?;
                    continue;
                }
            }
            match rec.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => iter.advance()?,
                std::cmp::Ordering::Equal => return Ok(iter.take()),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Index of the rightmost restart whose key is <= `key`.
    fn restart_for(&self, key: &[u8]) -> Result<usize> {
        let mut left = 0usize;
        let mut right = self.restarts.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let restart_key = self.key_at_restart(mid)?;
            if restart_key.as_slice() <= key {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        Ok(left.saturating_sub(1))
    }

    fn key_at_restart(&self, restart: usize) -> Result<Vec<u8>> {
        let mut cursor = Cursor::new(&self.data[self.restarts[restart] as usize..]);
        let shared = cursor.read_u32_varint()? as usize;
        let unshared = cursor.read_u32_varint()? as usize;
        let _vlen_ts = cursor.read_u32_varint()?;
        if shared != 0 {
            return errdata!("restart entry carries a shared prefix");
        }
        let start = self.restarts[restart] as usize + cursor.position() as usize;
        let end = start + unshared;
        if end > self.data.len() {
            return errdata!("restart entry out of bounds");
        }
        Ok(self.data[start..end].to_vec())
    }
}

/// Cursor over a block's records.
pub struct BlockIter {
    block: Arc<Block>,
    next_offset: usize,
    /// Entries decoded so far; `current` is entry `ordinal - 1`.
    ordinal: usize,
    last_key: Vec<u8>,
    current: Option<Record>,
}

impl BlockIter {
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            next_offset: 0,
            ordinal: 0,
            last_key: Vec::new(),
            current: None,
        }
    }

    /// Positions at the first record.
    pub fn rewind(&mut self) -> Result<()> {
        self.position_at_restart(0)
    }

    fn position_at_restart(&mut self, restart: usize) -> Result<()> {
        if restart >= self.block.restarts.len() {
            self.current = None;
            return Ok(());
        }
        self.next_offset = self.block.restarts[restart] as usize;
        self.ordinal = restart * RESTART_INTERVAL;
        self.last_key.clear();
        self.current = None;
        self.advance()
    }

    /// Positions at the first record with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        let restart = self.block.restart_for(target)?;
        self.position_at_restart(restart)?;
        while let Some(rec) = self.peek() {
            if rec.key.as_slice() >= target {
                break;
            }
            self.advance()?;
        }
        Ok(())
    }

    pub fn peek(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    /// Consumes and returns the current record.
    pub fn take(&mut self) -> Option<Record> {
        self.current.take()
    }

    /// 1-based ordinal of the current record.
    fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Decodes the next record into `current`; at the end of the block,
    /// `peek` turns `None`.
    pub fn advance(&mut self) -> Result<()> {
        if self.next_offset >= self.block.data.len() {
            self.current = None;
            return Ok(());
        }

        let mut cursor = Cursor::new(&self.block.data[self.next_offset..]);
        let shared = cursor.read_u32_varint()? as usize;
        let unshared = cursor.read_u32_varint()? as usize;
        let vlen_ts = cursor.read_u32_varint()?;
        let vlen = (vlen_ts & VLEN_MASK) as usize;
        let head = self.next_offset + cursor.position() as usize;

        if shared > self.last_key.len() || head + unshared + vlen > self.block.data.len() {
            return errdata!("block entry out of bounds at offset {}", self.next_offset);
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&self.block.data[head..head + unshared]);
        let value = self.block.data[head + unshared..head + unshared + vlen].to_vec();

        self.last_key.clear();
        self.last_key.extend_from_slice(&key);
        self.next_offset = head + unshared + vlen;
        self.ordinal += 1;
        self.current = Some(Record {
            key,
            value,
            tombstone: vlen_ts & VLEN_TS != 0,
        });
        Ok(())
    }
}
