//! Write-ahead log over two rotating files.
//!
//! Every memtable-visible mutation is appended here before the write
//! returns. Exactly one of the two files (`wal1`, `wal2`) is current at
//! any time; compaction switches to the other file and, once the new
//! table version and the new log are durable, truncates the retired one.
//!
//! # File format
//!
//! An 8-byte little-endian version number leads the file, pairing it with
//! the table version it was opened against. The rest is a stream of
//! records in the [`Record`](crate::record::Record) WAL encoding, packed
//! into page-aligned blocks: a partially filled block is zero-padded to
//! the next page boundary before submission, and replay skips the zero
//! padding between records.
//!
//! # Write ring
//!
//! Writes and fsyncs are submitted to a dedicated writer thread over a
//! channel and executed in order at ascending offsets, so submission never
//! blocks the engine lock on disk latency. `flush_sync` enqueues an fsync
//! without waiting; `flush_sync_wait` also drains the ring. Any ring I/O
//! failure aborts the process: continuing without the log would silently
//! give up durability.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::memtable::{Memtable, MergeDecision};
use crate::record::Record;

/// Page size; WAL blocks and file write offsets are multiples of this.
pub const PGSZ: usize = 4096;

/// WAL block buffer size (64 pages).
pub const WAL_BLKSZ: usize = PGSZ << 6;

/// Unsynced bytes after which a flush opportunistically enqueues an fsync.
const SYNC_SIZE: u64 = 1 << 26;

enum RingOp {
    Write {
        file: Arc<File>,
        off: u64,
        buf: Vec<u8>,
    },
    Sync {
        file: Arc<File>,
    },
    Barrier(mpsc::SyncSender<()>),
}

/// Ordered asynchronous writer: a thread draining a FIFO of writes and
/// fsyncs. Ordering is preserved because ops execute one at a time and
/// writes to a file always target ascending, non-overlapping offsets.
struct Ring {
    tx: Option<mpsc::Sender<RingOp>>,
    handle: Option<JoinHandle<()>>,
}

impl Ring {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<RingOp>();
        let handle = std::thread::Builder::new()
            .name("ember-wal-ring".into())
            .spawn(move || {
                for op in rx {
                    match op {
                        RingOp::Write { file, off, buf } => {
                            if let Err(err) = file.write_all_at(&buf, off) {
                                ring_fatal("write", &err);
                            }
                        }
                        RingOp::Sync { file } => {
                            if let Err(err) = file.sync_data() {
                                ring_fatal("fsync", &err);
                            }
                        }
                        RingOp::Barrier(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .expect("spawn wal ring thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn submit(&self, op: RingOp) {
        self.tx
            .as_ref()
            .expect("wal ring running")
            .send(op)
            .expect("wal ring alive");
    }

    /// Round-trips a barrier through the ring, waiting out every prior op.
    fn drain(&self) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(0);
        self.submit(RingOp::Barrier(ack_tx));
        ack_rx.recv().expect("wal ring alive");
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn ring_fatal(what: &str, err: &std::io::Error) -> ! {
    // Losing a WAL write means losing durability; there is no good way to
    // continue from here.
    tracing::error!(error = %err, "fatal wal ring {what} failure");
    std::process::abort();
}

pub struct Wal {
    /// The two log files; index 0 is current, index 1 is the retired one.
    files: [Arc<File>; 2],
    ring: Ring,
    /// Block buffer for the tail of the current file.
    buf: Vec<u8>,
    /// Write offset into the current file, always page-aligned.
    woff: u64,
    /// Offset up to which an fsync has been enqueued.
    soff: u64,
    /// Version number written at the head of the current file.
    version: u64,
    /// Per-file size cap; reaching it triggers compaction.
    pub maxsz: u64,
    /// User-visible bytes appended (for write-amplification stats).
    pub write_user: u64,
    /// Physical bytes submitted to the current file.
    pub write_nbytes: u64,
}

impl Wal {
    pub fn open(dir: &Path, maxsz: u64) -> Result<Self> {
        let open = |name: &str| -> Result<Arc<File>> {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(dir.join(name))?;
            Ok(Arc::new(file))
        };
        Ok(Self {
            files: [open("wal1")?, open("wal2")?],
            ring: Ring::new(),
            buf: Vec::with_capacity(WAL_BLKSZ),
            woff: 0,
            soff: 0,
            version: 0,
            maxsz,
            write_user: 0,
            write_nbytes: 0,
        })
    }

    pub fn write_offset(&self) -> u64 {
        self.woff
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Appends one record to the block buffer, flushing a full buffer
    /// first. Called while holding the engine lock.
    pub fn append(&mut self, record: &Record) {
        let estsz = record.wal_encoded_len();
        debug_assert!(estsz <= WAL_BLKSZ);
        if self.buf.len() + estsz > WAL_BLKSZ {
            self.flush();
        }
        record.encode_wal(&mut self.buf);
    }

    /// Zero-pads the buffer to a page boundary and submits it at the
    /// current write offset.
    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let wsize = self.buf.len().div_ceil(PGSZ) * PGSZ;
        self.buf.resize(wsize, 0);
        let block = std::mem::replace(&mut self.buf, Vec::with_capacity(WAL_BLKSZ));
        self.ring.submit(RingOp::Write {
            file: Arc::clone(&self.files[0]),
            off: self.woff,
            buf: block,
        });
        self.woff += wsize as u64;
        self.write_nbytes += wsize as u64;

        if self.woff - self.soff >= SYNC_SIZE {
            self.ring.submit(RingOp::Sync {
                file: Arc::clone(&self.files[0]),
            });
            self.soff = self.woff;
        }
    }

    /// Flush plus an enqueued fsync; does not wait for completion.
    pub fn flush_sync(&mut self) {
        self.flush();
        if self.woff != self.soff {
            self.ring.submit(RingOp::Sync {
                file: Arc::clone(&self.files[0]),
            });
            self.soff = self.woff;
        }
    }

    /// Flush, fsync, and drain the ring: on return every prior append is
    /// durable.
    pub fn flush_sync_wait(&mut self) {
        self.flush_sync();
        self.ring.drain();
    }

    /// Waits out all submitted ring operations.
    pub fn io_complete(&self) {
        self.ring.drain();
    }

    /// Rotates to the other file, durably finishing the current one first.
    /// The new file starts with `version` at offset zero. Returns the size
    /// of the just-retired file. Called under the engine lock.
    pub fn switch(&mut self, version: u64) -> u64 {
        self.flush_sync_wait();
        let woff0 = self.woff;
        self.woff = 0;
        self.soff = 0;
        self.files.swap(0, 1);
        self.seed_version(version);
        woff0
    }

    /// Starts a fresh current file: the version header becomes the first
    /// buffered bytes. Only valid when the buffer is empty.
    pub fn seed_version(&mut self, version: u64) {
        debug_assert!(self.buf.is_empty());
        self.buf.extend_from_slice(&version.to_le_bytes());
        self.version = version;
    }

    /// Adopts the version of a recovered, partially filled current file
    /// whose header is already on disk.
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Reads the leading version number of both files; 0 for a file too
    /// short to carry one.
    pub fn read_versions(&self) -> [u64; 2] {
        let mut versions = [0u64; 2];
        for (i, file) in self.files.iter().enumerate() {
            if file.metadata().map(|m| m.len()).unwrap_or(0) > 8 {
                let mut head = [0u8; 8];
                if file.read_exact_at(&mut head, 0).is_ok() {
                    versions[i] = u64::from_le_bytes(head);
                }
            }
        }
        versions
    }

    /// Swaps which file is current. Used by recovery before any writes.
    pub fn swap_files(&mut self) {
        self.files.swap(0, 1);
    }

    /// Replays one file into a memtable through the merge path, updating
    /// the memtable size accounting. Stops at the first torn or
    /// checksum-failing record. Returns the number of bytes consumed, 0
    /// for an empty or headerless file.
    pub fn replay(&self, idx: usize, mt: &Memtable, mtsz: &mut u64) -> Result<u64> {
        let file = &self.files[idx];
        let fsize = file.metadata()?.len() as usize;
        if fsize <= 8 {
            return Ok(0);
        }

        let mut data = vec![0u8; fsize];
        file.read_exact_at(&mut data, 0)?;

        let mut pos = 8usize;
        let mut nkeys = 0u64;
        while pos < fsize {
            // Decode before treating a zero byte as padding: a record for
            // the empty key also starts with 0x00, and only its checksum
            // tells the two apart.
            if let Some((record, consumed)) = Record::decode_wal(&data[pos..]) {
                pos += consumed;
                nkeys += 1;

                let key = record.key.clone();
                let mut pending = Some(record);
                mt.merge(&key, |old| {
                    let record = pending.take().expect("record pending");
                    let oldsz = old.map(|o| o.footprint() as u64).unwrap_or(0);
                    *mtsz = *mtsz + record.footprint() as u64 - oldsz;
                    MergeDecision::Insert(record)
                });
            } else if data[pos] == 0 {
                pos += 1;
            } else {
                break;
            }
        }

        tracing::debug!(idx, fsize, rsize = pos, nkeys, "wal replay");
        Ok(pos as u64)
    }

    /// After replaying `rsize` bytes of the current file, resumes appending
    /// at the next page boundary, zero-filling the gap so the tail parses
    /// as padding.
    pub fn set_recovered_offset(&mut self, rsize: u64) -> Result<()> {
        let woff = rsize.div_ceil(PGSZ as u64) * PGSZ as u64;
        if woff > rsize {
            let zeroes = vec![0u8; (woff - rsize) as usize];
            self.files[0].write_all_at(&zeroes, rsize)?;
            self.files[0].sync_data()?;
        }
        self.woff = woff;
        self.soff = woff;
        Ok(())
    }

    /// Truncates one file to zero and makes the truncation durable.
    pub fn truncate_file(&self, idx: usize) -> Result<()> {
        self.files[idx].set_len(0)?;
        self.files[idx].sync_data()?;
        Ok(())
    }

    /// Truncates the retired file. Only called after the durability
    /// sequence of a compaction or recovery has completed.
    pub fn truncate_old(&self) -> Result<()> {
        self.truncate_file(1)
    }

    pub fn file_size(&self, idx: usize) -> u64 {
        self.files[idx].metadata().map(|m| m.len()).unwrap_or(0)
    }

    /// Durably finishes the current file. Called on close.
    pub fn close(&mut self) {
        self.flush_sync_wait();
    }
}
