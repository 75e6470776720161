//! Key-value records and their wire form.
//!
//! A record is a key, a value, and a tombstone flag. On disk (WAL records
//! and table block entries) the tombstone rides in the value-length field:
//! bit 16 (`VLEN_TS`) marks a delete, the low 16 bits carry the value
//! length. All fixed-width on-disk integers are little-endian; lengths are
//! varint-coded.
//!
//! WAL record layout:
//!
//! ```text
//! +-------------+----------------+-----+-------+------------------+
//! | klen varint | vlen_ts varint | key | value | crc32c(key) u32  |
//! +-------------+----------------+-----+-------+------------------+
//! ```
//!
//! The checksum is the seeded CRC32C of the key, which doubles as the
//! record's key hash. Block entries use the same prefix without the
//! checksum (blocks are checked at a different granularity).

use std::io::Cursor;

use varint_rs::{VarintReader, VarintWriter};

use crate::error::Result;
use crate::hash::key_hash32;
use crate::errinput;

/// Maximum combined key+value length accepted by the public API.
pub const MAX_KV_LEN: usize = 65_500;

/// Tombstone bit in the on-disk value-length field.
pub const VLEN_TS: u32 = 0x10000;

/// Mask extracting the effective value length.
pub const VLEN_MASK: u32 = 0xFFFF;

/// Per-record memory overhead charged to the memtable size accounting,
/// approximating the skiplist node and the two Vec headers.
const RECORD_OVERHEAD: usize = 48;

/// An owned key-value record. `tombstone` records delete the key at lookup
/// and are garbage-collected during compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub tombstone: bool,
}

/// A non-owning view of a record stored in a memtable.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub tombstone: bool,
}

impl Record {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            tombstone: false,
        }
    }

    pub fn tombstone(key: Vec<u8>) -> Self {
        Self {
            key,
            value: Vec::new(),
            tombstone: true,
        }
    }

    /// Rejects a key/value pair that exceeds the combined size limit,
    /// before any state change.
    pub fn check_len(klen: usize, vlen: usize) -> Result<()> {
        if klen + vlen > MAX_KV_LEN {
            return errinput!("key+value length {} exceeds {MAX_KV_LEN}", klen + vlen);
        }
        Ok(())
    }

    /// The on-disk value-length field: effective length plus the TS bit.
    pub fn vlen_ts(&self) -> u32 {
        let vlen = self.value.len() as u32;
        if self.tombstone {
            vlen | VLEN_TS
        } else {
            vlen
        }
    }

    /// Size charged against the memtable budget.
    pub fn footprint(&self) -> usize {
        self.key.len() + self.value.len() + RECORD_OVERHEAD
    }

    pub fn key_hash32(&self) -> u32 {
        key_hash32(&self.key)
    }

    pub fn as_ref(&self) -> RecordRef<'_> {
        RecordRef {
            key: &self.key,
            value: &self.value,
            tombstone: self.tombstone,
        }
    }

    /// Encoded WAL size, checksum included.
    pub fn wal_encoded_len(&self) -> usize {
        varint_len(self.key.len() as u32)
            + varint_len(self.vlen_ts())
            + self.key.len()
            + self.value.len()
            + 4
    }

    /// Appends the WAL form of this record to `out`.
    pub fn encode_wal(&self, out: &mut Vec<u8>) {
        out.write_u32_varint(self.key.len() as u32).unwrap();
        out.write_u32_varint(self.vlen_ts()).unwrap();
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out.extend_from_slice(&self.key_hash32().to_le_bytes());
    }

    /// Decodes one WAL record from the head of `input`.
    ///
    /// Returns the record and the number of bytes consumed. Any truncation,
    /// length overflow, or checksum mismatch yields `None`: replay treats
    /// the log as ending at that point.
    pub fn decode_wal(input: &[u8]) -> Option<(Record, usize)> {
        let mut cursor = Cursor::new(input);
        let klen = cursor.read_u32_varint().ok()? as usize;
        let vlen_ts = cursor.read_u32_varint().ok()?;
        let vlen = (vlen_ts & VLEN_MASK) as usize;
        let head = cursor.position() as usize;

        let end = head.checked_add(klen + vlen + 4)?;
        if end > input.len() {
            return None;
        }

        let key = &input[head..head + klen];
        let value = &input[head + klen..head + klen + vlen];
        let stored = u32::from_le_bytes(input[head + klen + vlen..end].try_into().ok()?);
        if stored != key_hash32(key) {
            return None;
        }

        let record = Record {
            key: key.to_vec(),
            value: value.to_vec(),
            tombstone: vlen_ts & VLEN_TS != 0,
        };
        Some((record, end))
    }
}

impl RecordRef<'_> {
    pub fn footprint(&self) -> usize {
        self.key.len() + self.value.len() + RECORD_OVERHEAD
    }

    pub fn to_record(&self) -> Record {
        Record {
            key: self.key.to_vec(),
            value: self.value.to_vec(),
            tombstone: self.tombstone,
        }
    }
}

/// Encoded length of a u32 varint.
pub fn varint_len(v: u32) -> usize {
    match v {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0xFFF_FFFF => 4,
        _ => 5,
    }
}
