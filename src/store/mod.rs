//! The engine composite and public operation surface.
//!
//! [`Db`] owns the whole engine: the memtable view ring, the rotating WAL,
//! the table zone, the quiescence tracker, and the background compaction
//! worker. Threads interact through per-thread [`DbRef`] handles that
//! cache the view they operate under and refresh lazily whenever
//! compaction rotates it.
//!
//! Write path: wait while the engine is full, then read-modify-write into
//! the writable memtable; the merge callback takes the engine lock,
//! verifies the view has not rotated mid-flight (retrying from the top if
//! it has), bumps the size accounting, and appends to the WAL before the
//! record becomes visible. Read path: writable memtable, then the
//! immutable one if a compaction is in flight, then the table version.
//! The first layer that knows the key answers, and a tombstone answers
//! "absent".

pub mod compaction;
pub mod iterator;
pub mod recovery;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{Config, WorkerCores};
use crate::error::Result;
use crate::flock::FileLock;
use crate::hash::key_hash32;
use crate::memtable::{Memtable, MergeDecision};
use crate::qsbr::{Qsbr, ReaderSlot};
use crate::record::Record;
use crate::store::iterator::{MergeIter, Source};
use crate::view::ViewRing;
use crate::wal::Wal;
use crate::zone::version::Version;
use crate::zone::Zone;

const LOCK_FILE: &str = "ember.lock";

/// Memtable budget fraction that may be rejected per compaction (1/16).
const REJECT_SIZE_SHIFT: u32 = 4;

/// A snapshot of engine counters for monitoring and debugging.
#[derive(Debug, Clone)]
pub struct Stats {
    /// Bytes currently accounted to the writable memtable.
    pub memtable_bytes: u64,
    /// Write offset into the current WAL file.
    pub wal_offset: u64,
    /// User-visible bytes appended to the WAL since open.
    pub wal_user_bytes: u64,
    /// Physical bytes submitted to the WAL since open.
    pub wal_written_bytes: u64,
    /// Live table version id.
    pub table_version: u64,
    /// Partitions in the live version.
    pub partitions: usize,
    /// Bytes written into table files since open.
    pub table_written_bytes: u64,
    /// Logical bytes loaded from table files since open.
    pub table_read_bytes: u64,
}

/// What a user merge function wants done with the key.
pub enum MergeUpdate {
    /// Replace the value.
    Put(Vec<u8>),
    /// Delete the key.
    Delete,
    /// Leave the key untouched.
    Keep,
}

/// State mutated under the engine lock: the WAL tail and the memtable
/// size accounting. The lock is held briefly and never across ring waits,
/// except for explicit `sync`.
pub(crate) struct Shared {
    pub(crate) wal: Wal,
    pub(crate) mtsz: u64,
}

pub(crate) struct Engine {
    pub(crate) views: ViewRing,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) zone: Zone,
    pub(crate) qsbr: Qsbr,
    pub(crate) running: AtomicBool,
    pub(crate) max_mtsz: u64,
    pub(crate) max_rejsz: u64,
    pub(crate) nr_workers: u32,
    pub(crate) co_per_worker: u32,
    pub(crate) worker_cores: WorkerCores,
}

impl Engine {
    /// Writers must wait and compaction must start while this holds.
    pub(crate) fn mt_wal_full(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.mtsz >= self.max_mtsz || shared.wal.write_offset() >= shared.wal.maxsz
    }
}

/// An open database. Dropping it stops the background worker, drains the
/// WAL, and releases the directory lock.
pub struct Db {
    engine: Arc<Engine>,
    _lock: FileLock,
    worker: Option<JoinHandle<()>>,
}

impl Db {
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;

        let zone = Zone::open(&config.dir, &config)?;
        let mt_a = Arc::new(Memtable::new());
        let mt_b = Arc::new(Memtable::new());

        let mut wal = Wal::open(&config.dir, config.max_walsz())?;
        let mtsz = recovery::recover(&mut wal, &mt_a, &zone, &config)?;

        let engine = Arc::new(Engine {
            views: ViewRing::new(mt_a, mt_b),
            shared: Mutex::new(Shared { wal, mtsz }),
            zone,
            qsbr: Qsbr::new(),
            running: AtomicBool::new(true),
            max_mtsz: config.max_mtsz(),
            max_rejsz: config.max_mtsz() >> REJECT_SIZE_SHIFT,
            nr_workers: config.nr_workers,
            co_per_worker: config.co_per_worker,
            worker_cores: config.worker_cores.clone(),
        });

        let worker = {
            let engine = Arc::clone(&engine);
            std::thread::Builder::new()
                .name("ember-comp".into())
                .spawn(move || compaction::worker_loop(engine))
                .expect("spawn compaction worker")
        };

        tracing::info!(dir = %config.dir.display(), "database opened");
        Ok(Self {
            engine,
            _lock: lock,
            worker: Some(worker),
        })
    }

    /// Opens with the space-saving profile: no prefix-compressed key
    /// blocks, no hash tags, more cooperative tasks per worker.
    pub fn open_compact(dir: impl Into<std::path::PathBuf>, cache_mb: usize, mt_mb: usize) -> Result<Self> {
        Self::open(
            Config::new(dir)
                .cache_size_mb(cache_mb)
                .mt_size_mb(mt_mb)
                .ckeys(false)
                .tags(false)
                .co_per_worker(4),
        )
    }

    /// A per-thread handle. Handles are cheap; each thread should hold its
    /// own and drop it before the database closes.
    pub fn reference(&self) -> DbRef<'_> {
        let engine = &*self.engine;
        let gen = engine.views.generation();
        let view = engine.views.view_at(gen);
        let mut r = DbRef {
            engine,
            slot: engine.qsbr.register(),
            gen,
            wmt: Arc::clone(&view.wmt),
            imt: view.imt.clone(),
            version: engine.zone.getv(),
        };
        r.refresh();
        r
    }

    /// Current engine counters.
    pub fn stats(&self) -> Stats {
        let (memtable_bytes, wal_offset, wal_user_bytes, wal_written_bytes) = {
            let shared = self.engine.shared.lock().unwrap();
            (
                shared.mtsz,
                shared.wal.write_offset(),
                shared.wal.write_user,
                shared.wal.write_nbytes,
            )
        };
        let version = self.engine.zone.getv();
        Stats {
            memtable_bytes,
            wal_offset,
            wal_user_bytes,
            wal_written_bytes,
            table_version: version.seq,
            partitions: version.partitions.len(),
            table_written_bytes: self.engine.zone.stat_writes(),
            table_read_bytes: self.engine.zone.stat_reads(),
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.engine.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Ok(mut shared) = self.engine.shared.lock() {
            shared.wal.close();
        }
        tracing::info!("database closed");
    }
}

/// A per-thread database handle: caches the view it operates under and a
/// quiescence slot, and carries every public operation.
pub struct DbRef<'db> {
    engine: &'db Engine,
    slot: ReaderSlot,
    gen: u64,
    wmt: Arc<Memtable>,
    imt: Option<Arc<Memtable>>,
    version: Arc<Version>,
}

impl<'db> DbRef<'db> {
    /// Publishes the generation this handle operates under and re-acquires
    /// the view's layers if compaction moved it. The publish is validated
    /// against a concurrent rotation so a parked or lagging reader can
    /// never resume into a view that already quiesced without it.
    fn refresh(&mut self) {
        loop {
            let gen = self.engine.views.generation();
            self.slot.update(gen);
            if self.engine.views.generation() != gen {
                continue;
            }
            if gen != self.gen {
                let view = self.engine.views.view_at(gen);
                self.wmt = Arc::clone(&view.wmt);
                self.imt = view.imt.clone();
                self.version = self.engine.zone.getv();
                self.gen = gen;
            }
            return;
        }
    }

    /// Bounded wait while the engine is full; the background worker is
    /// responsible for making room.
    fn write_enter(&mut self) {
        while self.engine.mt_wal_full() {
            self.refresh();
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Point lookup. A tombstone in a newer layer hides older values.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.refresh();
        if let Some(rec) = self.wmt.get(key) {
            return Ok(live_value(rec));
        }
        if let Some(imt) = &self.imt {
            if let Some(rec) = imt.get(key) {
                return Ok(live_value(rec));
            }
        }
        Ok(self.version.get(key, key_hash32(key))?.and_then(live_value))
    }

    /// Presence probe with the same layer semantics as `get`.
    pub fn probe(&mut self, key: &[u8]) -> Result<bool> {
        self.refresh();
        if let Some(live) = self.wmt.probe(key) {
            return Ok(live);
        }
        if let Some(imt) = &self.imt {
            if let Some(live) = imt.probe(key) {
                return Ok(live);
            }
        }
        self.version.probe(key, key_hash32(key))
    }

    /// Blind insert or overwrite.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Record::check_len(key.len(), value.len())?;
        self.update(Record::put(key.to_vec(), value.to_vec()))
    }

    /// Tombstone delete; succeeds whether or not the key exists.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        Record::check_len(key.len(), 0)?;
        self.update(Record::tombstone(key.to_vec()))
    }

    fn update(&mut self, record: Record) -> Result<()> {
        self.write_enter();
        let key = record.key.clone();
        let mut pending = Some(record);
        loop {
            self.refresh();
            let gen = self.gen;
            let engine = self.engine;
            let committed = self.wmt.merge(&key, |current| {
                let record = pending.take().expect("record pending");
                let oldsz = current.map(|c| c.footprint() as u64).unwrap_or(0);
                if wal_commit(engine, gen, oldsz, &record) {
                    MergeDecision::Insert(record)
                } else {
                    // The view rotated under us; retry against the new one.
                    pending = Some(record);
                    MergeDecision::Abort
                }
            });
            if committed {
                return Ok(());
            }
        }
    }

    /// Atomic read-modify-write. `uf` sees the key's current visible value
    /// and decides; it may run more than once if the operation races a
    /// view rotation or a concurrent writer, and only the final run takes
    /// effect.
    pub fn merge<F>(&mut self, key: &[u8], mut uf: F) -> Result<()>
    where
        F: FnMut(Option<&[u8]>) -> MergeUpdate,
    {
        Record::check_len(key.len(), 0)?;
        self.write_enter();

        // Phase 1: the key is already in the WMT; merge in place.
        enum Phase1 {
            Committed,
            Absent,
            Retry,
        }
        loop {
            self.refresh();
            let gen = self.gen;
            let engine = self.engine;
            let mut outcome = Phase1::Retry;
            let mut failure = None;
            self.wmt.merge(key, |current| {
                let Some(current) = current else {
                    outcome = Phase1::Absent;
                    return MergeDecision::Keep;
                };
                let visible = (!current.tombstone).then_some(current.value);
                let oldsz = current.footprint() as u64;
                match build_update(key, uf(visible)) {
                    Ok(None) => {
                        outcome = Phase1::Committed;
                        MergeDecision::Keep
                    }
                    Ok(Some(record)) => {
                        if wal_commit(engine, gen, oldsz, &record) {
                            outcome = Phase1::Committed;
                            MergeDecision::Insert(record)
                        } else {
                            MergeDecision::Abort
                        }
                    }
                    Err(err) => {
                        failure = Some(err);
                        MergeDecision::Keep
                    }
                }
            });
            if let Some(err) = failure {
                return Err(err);
            }
            match outcome {
                Phase1::Committed => return Ok(()),
                Phase1::Absent => break,
                Phase1::Retry => continue,
            }
        }

        // Phase 2: fetch the older version from the IMT or the tables,
        // then merge into the WMT, honoring any racing insert.
        loop {
            self.refresh();
            let older = self.get_older(key)?;
            let gen = self.gen;
            let engine = self.engine;
            let mut done = false;
            let mut failure = None;
            self.wmt.merge(key, |current| {
                let (visible, oldsz): (Option<&[u8]>, u64) = match &current {
                    Some(cur) => (
                        (!cur.tombstone).then_some(cur.value),
                        cur.footprint() as u64,
                    ),
                    None => (older.as_deref(), 0),
                };
                match build_update(key, uf(visible)) {
                    Ok(None) => {
                        done = true;
                        MergeDecision::Keep
                    }
                    Ok(Some(record)) => {
                        if wal_commit(engine, gen, oldsz, &record) {
                            done = true;
                            MergeDecision::Insert(record)
                        } else {
                            MergeDecision::Abort
                        }
                    }
                    Err(err) => {
                        failure = Some(err);
                        MergeDecision::Keep
                    }
                }
            });
            if let Some(err) = failure {
                return Err(err);
            }
            if done {
                return Ok(());
            }
        }
    }

    /// The key's visible value below the WMT, for merge phase 2.
    fn get_older(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(imt) = &self.imt {
            if let Some(rec) = imt.get(key) {
                return Ok(live_value(rec));
            }
        }
        Ok(self.version.get(key, key_hash32(key))?.and_then(live_value))
    }

    /// Deletes every key in `[start, end)` by writing a tombstone per live
    /// key. The scan and the deletes are not one atomic unit: keys written
    /// into the range by concurrent writers after the scan passed them may
    /// survive.
    pub fn del_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut doomed = Vec::new();
        {
            let mut iter = self.iter();
            iter.seek(start)?;
            loop {
                let key = match iter.entry_ref() {
                    Some((key, _)) if key < end => key.to_vec(),
                    _ => break,
                };
                doomed.push(key);
                iter.skip1()?;
            }
        }
        for key in doomed {
            self.del(&key)?;
        }
        Ok(())
    }

    /// Drains and fsyncs the WAL; on return every prior acknowledged write
    /// is durable.
    pub fn sync(&mut self) -> Result<()> {
        let mut shared = self.engine.shared.lock()?;
        shared.wal.flush_sync_wait();
        Ok(())
    }

    /// An ordered, tombstone-hiding iterator over the whole store.
    pub fn iter(&mut self) -> DbIter<'_, 'db> {
        self.refresh();
        DbIter {
            gen: self.gen,
            merge: MergeIter::new(self.sources(), true),
            parked: false,
            r: self,
        }
    }

    /// Merge sources oldest to newest; ranks follow position.
    fn sources(&self) -> Vec<Source> {
        let mut sources = vec![Source::Version(self.version.iter())];
        if let Some(imt) = &self.imt {
            sources.push(Source::Mem(imt.iter()));
        }
        sources.push(Source::Mem(self.wmt.iter()));
        sources
    }
}

fn live_value(record: Record) -> Option<Vec<u8>> {
    if record.tombstone {
        None
    } else {
        Some(record.value)
    }
}

/// Validates a user merge decision into a record; `None` means no write.
fn build_update(key: &[u8], update: MergeUpdate) -> Result<Option<Record>> {
    match update {
        MergeUpdate::Keep => Ok(None),
        MergeUpdate::Delete => Ok(Some(Record::tombstone(key.to_vec()))),
        MergeUpdate::Put(value) => {
            Record::check_len(key.len(), value.len())?;
            Ok(Some(Record::put(key.to_vec(), value)))
        }
    }
}

/// The commit point of every write: under the engine lock, verify the
/// writer's view is still current, account the size delta, and append to
/// the WAL. Returns false when the view rotated and the caller must retry.
fn wal_commit(engine: &Engine, gen: u64, oldsz: u64, record: &Record) -> bool {
    let mut shared = engine.shared.lock().unwrap();
    if engine.views.generation() != gen {
        return false;
    }
    let newsz = record.footprint() as u64;
    debug_assert!(shared.mtsz >= oldsz);
    shared.mtsz = shared.mtsz + newsz - oldsz;
    shared.wal.write_user += newsz;
    shared.wal.append(record);
    true
}

/// An ordered cursor over the unified store view.
///
/// The iterator snapshots the view it was built against; every `seek`
/// checks whether compaction has moved the engine past that view and
/// rebuilds its merge sources if so. `park` releases the reader's claim on
/// the view (letting compaction retire it) until the next `seek`.
pub struct DbIter<'r, 'db> {
    r: &'r mut DbRef<'db>,
    gen: u64,
    merge: MergeIter,
    parked: bool,
}

impl DbIter<'_, '_> {
    /// Positions at the first live key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        if self.parked || self.r.engine.views.generation() != self.gen {
            self.r.refresh();
            self.gen = self.r.gen;
            self.merge = MergeIter::new(self.r.sources(), true);
            self.parked = false;
        }
        self.merge.seek(key)
    }

    pub fn valid(&self) -> bool {
        !self.parked && self.merge.valid()
    }

    /// The current key/value, copied out.
    pub fn peek(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        self.entry_ref().map(|(k, v)| (k.to_vec(), v.to_vec()))
    }

    /// Borrowed view of the current key/value.
    pub fn entry_ref(&self) -> Option<(&[u8], &[u8])> {
        if self.parked {
            return None;
        }
        self.merge
            .peek()
            .map(|rec| (rec.key.as_slice(), rec.value.as_slice()))
    }

    /// The current entry, advancing past it.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let entry = self.peek();
        if entry.is_some() {
            self.skip1()?;
        }
        Ok(entry)
    }

    /// Advances one unique key.
    pub fn skip1(&mut self) -> Result<()> {
        self.merge.skip_unique()
    }

    /// Advances up to `n` unique keys, stopping early at the end.
    pub fn skip(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            if !self.valid() {
                break;
            }
            self.skip1()?;
        }
        Ok(())
    }

    /// Releases the iterator's claim on its view without destroying it.
    /// The next `seek` reacquires the live view.
    pub fn park(&mut self) {
        self.merge.clear();
        self.parked = true;
        self.r.slot.park();
    }
}
