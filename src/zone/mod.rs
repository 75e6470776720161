//! The table zone: the on-disk half of the engine.
//!
//! Owns the live [`Version`], the shared block cache, table id allocation,
//! and the compaction entry point that merges an immutable memtable into a
//! new version. For each partition of the outgoing version, compaction
//! either *accepts* it, rewriting the partition from the merge of the
//! memtable range and the old table, or *rejects* it, keeping the old
//! table untouched so the engine can route the memtable's keys for that
//! range back into the writable memtable instead. Rejection caps write
//! amplification for partitions receiving little fresh data; the aggregate
//! rejected bytes never exceed the caller's budget.

pub mod block;
pub mod table;
pub mod version;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::record::Record;
use crate::zone::table::{BlockCache, TableIter, TableWriter, MAX_BLOCK_SIZE};
use crate::zone::version::{Partition, Version};

/// Output partitions larger than this are split, adding a new anchor.
const TABLE_SPLIT_SIZE: u64 = 64 << 20;

/// A partition is a rejection candidate when its incoming bytes are less
/// than this fraction (1/8) of its on-disk size.
const REJECT_CANDIDATE_SHIFT: u32 = 3;

pub struct Zone {
    dir: PathBuf,
    current: RwLock<Arc<Version>>,
    next_table_id: AtomicU64,
    cache: Arc<BlockCache>,
    ckeys: bool,
    tags: bool,
    writes: AtomicU64,
    reads: Arc<AtomicU64>,
}

impl Zone {
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        let cache_blocks = (config.cache_size_mb << 20) / MAX_BLOCK_SIZE;
        let cache = Arc::new(BlockCache::new(cache_blocks.max(64)));
        let reads = Arc::new(AtomicU64::new(0));

        let version = match std::fs::read_link(dir.join("HEAD")) {
            Ok(target) => {
                let name = target
                    .to_str()
                    .ok_or_else(|| Error::InvalidData("HEAD target is not utf-8".into()))?;
                Version::load(dir, name, &cache, &reads)?
            }
            Err(_) => {
                let version = Version::bootstrap();
                let name = version.save(dir)?;
                set_symlink(dir, "HEAD", &name)?;
                sync_dir(dir)?;
                version
            }
        };

        let mut max_table_id = 0u64;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".sstx") {
                if let Ok(id) = stem.parse::<u64>() {
                    max_table_id = max_table_id.max(id);
                }
            }
        }

        tracing::info!(
            seq = version.seq,
            partitions = version.partitions.len(),
            "zone opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            current: RwLock::new(Arc::new(version)),
            next_table_id: AtomicU64::new(max_table_id + 1),
            cache,
            ckeys: config.ckeys,
            tags: config.tags,
            writes: AtomicU64::new(0),
            reads,
        })
    }

    /// Numeric id of the live version.
    pub fn version_seq(&self) -> u64 {
        self.current.read().unwrap().seq
    }

    /// Acquires a handle on the live version. Dropping the handle releases
    /// it; a superseded version retires once its last handle drops.
    pub fn getv(&self) -> Arc<Version> {
        Arc::clone(&self.current.read().unwrap())
    }

    /// Bytes written into table files, for write-amplification stats.
    pub fn stat_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Logical bytes loaded from table files.
    pub fn stat_reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn alloc_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::Relaxed)
    }

    fn table_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id:08}.sstx"))
    }

    /// Merges `imt` into a new version, deciding accept/reject per
    /// partition of the outgoing one. Rejected incoming bytes stay under
    /// `max_reject`; `max_reject == 0` accepts everything. On return the
    /// new version is published and durable; the outgoing version's anchor
    /// array carries the dispositions.
    pub fn compact(
        &self,
        imt: &Arc<Memtable>,
        nr_workers: u32,
        co_per_worker: u32,
        max_reject: u64,
    ) -> Result<()> {
        let oldv = self.getv();
        let nparts = oldv.partitions.len();

        // One ordered pass buckets the incoming bytes by partition.
        let mut incoming = vec![0u64; nparts];
        let mut pending = vec![0u64; nparts];
        {
            let mut iter = imt.iter();
            iter.seek(b"");
            let mut p = 0usize;
            while let Some(rec) = iter.peek() {
                while p + 1 < nparts
                    && oldv.partitions[p + 1].anchor.as_slice() <= rec.key.as_slice()
                {
                    p += 1;
                }
                incoming[p] += rec.footprint() as u64;
                pending[p] += 1;
                iter.advance();
            }
        }

        // Reject the partitions where a rewrite buys the least, smallest
        // incoming first, within the budget.
        let mut candidates: Vec<usize> = (0..nparts)
            .filter(|&p| {
                pending[p] > 0
                    && oldv.partitions[p]
                        .table
                        .as_ref()
                        .is_some_and(|t| incoming[p] < t.size() >> REJECT_CANDIDATE_SHIFT)
            })
            .collect();
        candidates.sort_by_key(|&p| incoming[p]);
        let mut budget = max_reject;
        for p in candidates {
            if incoming[p] <= budget {
                budget -= incoming[p];
                oldv.mark_rejected(p);
            }
        }

        // Rewrite the accepted partitions that received data, fanning the
        // work across the compaction workers.
        let tasks: Vec<usize> = (0..nparts)
            .filter(|&p| pending[p] > 0 && !oldv.rejected(p))
            .collect();
        let workers = (nr_workers as usize).clamp(1, tasks.len().max(1));
        tracing::debug!(
            tasks = tasks.len(),
            workers,
            co_per_worker,
            "partition rewrite starting"
        );

        let results: Mutex<Vec<Option<Vec<(Vec<u8>, Option<Arc<table::Table>>)>>>> =
            Mutex::new(vec![None; nparts]);
        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(workers);
            for w in 0..workers {
                let tasks = &tasks;
                let results = &results;
                let oldv = &oldv;
                handles.push(scope.spawn(move || -> Result<()> {
                    for &p in tasks.iter().skip(w).step_by(workers) {
                        let outputs = self.rewrite_partition(imt, oldv, p)?;
                        results.lock().unwrap()[p] = Some(outputs);
                    }
                    Ok(())
                }));
            }
            for handle in handles {
                handle.join().expect("compaction worker panicked")?;
            }
            Ok(())
        })?;

        // Assemble the successor: rewritten partitions contribute their
        // outputs, everything else (untouched or rejected) carries over.
        let results = results.into_inner().unwrap();
        let mut partitions: Vec<Partition> = Vec::with_capacity(nparts);
        let mut superseded: Vec<Arc<table::Table>> = Vec::new();
        for (p, old) in oldv.partitions.iter().enumerate() {
            match &results[p] {
                Some(outputs) => {
                    if let Some(table) = &old.table {
                        superseded.push(Arc::clone(table));
                    }
                    for (anchor, table) in outputs {
                        partitions.push(Partition::new(anchor.clone(), table.clone()));
                    }
                }
                None => partitions.push(Partition::new(old.anchor.clone(), old.table.clone())),
            }
        }
        // A rewrite that emitted nothing dissolves its partition; keep the
        // key space covered from the empty key up.
        if partitions.first().map_or(true, |p| !p.anchor.is_empty()) {
            partitions.insert(0, Partition::new(Vec::new(), None));
        }

        let newv = Arc::new(Version {
            seq: oldv.seq + 1,
            partitions,
        });

        let name = newv.save(&self.dir)?;
        set_symlink(&self.dir, "HEAD1", &Version::descriptor_name(oldv.seq))?;
        set_symlink(&self.dir, "HEAD", &name)?;
        sync_dir(&self.dir)?;

        *self.current.write().unwrap() = Arc::clone(&newv);

        for table in superseded {
            table.mark_obsolete();
        }
        if oldv.seq >= 2 {
            let _ = std::fs::remove_file(self.dir.join(Version::descriptor_name(oldv.seq - 1)));
        }

        tracing::info!(
            seq = newv.seq,
            partitions = newv.partitions.len(),
            disk_bytes = newv.on_disk_bytes(),
            "version published"
        );
        Ok(())
    }

    /// Merges one partition's memtable range with its table into fresh
    /// tables, splitting when an output grows past the size threshold.
    /// Tombstones are dropped: the partition owns its whole on-disk key
    /// range, so nothing older can resurface.
    fn rewrite_partition(
        &self,
        imt: &Arc<Memtable>,
        oldv: &Arc<Version>,
        p: usize,
    ) -> Result<Vec<(Vec<u8>, Option<Arc<table::Table>>)>> {
        let partition = &oldv.partitions[p];
        let start: &[u8] = &partition.anchor;
        let end: Option<&[u8]> = oldv.partitions.get(p + 1).map(|n| n.anchor.as_slice());

        let mut mem = imt.iter();
        mem.seek(start);
        let mut tab: Option<TableIter> = match &partition.table {
            Some(table) => {
                let mut iter = table.iter();
                iter.rewind()?;
                Some(iter)
            }
            None => None,
        };

        let mut outputs: Vec<(Vec<u8>, Option<Arc<table::Table>>)> = Vec::new();
        let mut writer: Option<(Vec<u8>, TableWriter)> = None;

        enum Take {
            Mem,
            Tab,
            Both,
        }

        loop {
            let mem_key = mem
                .peek()
                .map(|rec| rec.key.as_slice())
                .filter(|key| end.map_or(true, |e| *key < e));
            let tab_key = tab.as_ref().and_then(|i| i.peek()).map(|r| r.key.as_slice());

            // Newest wins: the memtable shadows the table on equal keys.
            let take = match (mem_key, tab_key) {
                (None, None) => break,
                (Some(_), None) => Take::Mem,
                (None, Some(_)) => Take::Tab,
                (Some(mk), Some(tk)) => match mk.cmp(tk) {
                    std::cmp::Ordering::Less => Take::Mem,
                    std::cmp::Ordering::Equal => Take::Both,
                    std::cmp::Ordering::Greater => Take::Tab,
                },
            };

            let record: Record = match take {
                Take::Mem => {
                    let rec = mem.peek().expect("source has a record").clone();
                    mem.advance();
                    rec
                }
                Take::Tab => {
                    let iter = tab.as_mut().expect("table iter");
                    let rec = iter.peek().expect("source has a record").clone();
                    iter.advance()?;
                    rec
                }
                Take::Both => {
                    let rec = mem.peek().expect("source has a record").clone();
                    mem.advance();
                    tab.as_mut().expect("table iter").advance()?;
                    rec
                }
            };

            if record.tombstone {
                continue;
            }

            if writer.is_none() {
                let anchor = if outputs.is_empty() {
                    start.to_vec()
                } else {
                    record.key.clone()
                };
                let id = self.alloc_table_id();
                writer = Some((
                    anchor,
                    TableWriter::create(self.table_path(id), id, self.ckeys, self.tags)?,
                ));
            }
            let (_, w) = writer.as_mut().expect("writer");
            w.add(&record)?;

            if w.data_bytes() >= TABLE_SPLIT_SIZE {
                let (anchor, w) = writer.take().expect("writer");
                self.seal(anchor, w, &mut outputs)?;
            }
        }

        if let Some((anchor, w)) = writer.take() {
            self.seal(anchor, w, &mut outputs)?;
        }
        Ok(outputs)
    }

    fn seal(
        &self,
        anchor: Vec<u8>,
        writer: TableWriter,
        outputs: &mut Vec<(Vec<u8>, Option<Arc<table::Table>>)>,
    ) -> Result<()> {
        if let Some((table, written)) =
            writer.finish(Arc::clone(&self.cache), Arc::clone(&self.reads))?
        {
            self.writes.fetch_add(written, Ordering::Relaxed);
            outputs.push((anchor, Some(table)));
        }
        Ok(())
    }
}

/// Atomically retargets `dir/name` at `target` (symlink-then-rename).
fn set_symlink(dir: &Path, name: &str, target: &str) -> Result<()> {
    let tmp = dir.join(format!("{name}.tmp"));
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)?;
    std::fs::rename(&tmp, dir.join(name))?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}
