use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::errinput;

/// CPU placement for the compaction worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCores {
    /// Inherit the process affinity (default).
    Auto,
    /// Leave the worker unpinned.
    Dont,
    /// Pin to an explicit core list.
    List(Vec<u32>),
}

impl WorkerCores {
    /// Parses `"auto"`, `"dont"`, or a comma-separated core list like `"0,2,4"`.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(WorkerCores::Auto),
            "dont" => Ok(WorkerCores::Dont),
            list => {
                let cores = list
                    .split(',')
                    .map(|t| {
                        t.trim()
                            .parse::<u32>()
                            .map_err(|_| Error::InvalidInput(format!("bad core id {t:?}")))
                    })
                    .collect::<Result<Vec<u32>>>()?;
                if cores.is_empty() {
                    return errinput!("empty worker core list");
                }
                Ok(WorkerCores::List(cores))
            }
        }
    }
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding all persistent state.
    pub dir: PathBuf,

    /// Table block cache budget in MiB (default: 256).
    pub cache_size_mb: usize,

    /// Target max memtable size in MiB; reaching it triggers compaction (default: 64).
    pub mt_size_mb: usize,

    /// Per-WAL-file size cap in MiB; reaching it triggers compaction
    /// (default: twice `mt_size_mb`).
    pub wal_size_mb: usize,

    /// Emit prefix-compressed key blocks in new tables (default: true).
    pub ckeys: bool,

    /// Emit per-key hash tags in blocks to speed up point lookups (default: true).
    pub tags: bool,

    /// Compaction worker thread count (default: 4).
    pub nr_workers: u32,

    /// Cooperative tasks per compaction worker, passed through to the
    /// table engine (default: 1).
    pub co_per_worker: u32,

    /// CPU placement for the compaction worker (default: auto).
    pub worker_cores: WorkerCores,
}

impl Config {
    /// Create a new config with the given directory and recommended defaults.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let mt_size_mb = 64;
        Self {
            dir: dir.into(),
            cache_size_mb: 256,
            mt_size_mb,
            wal_size_mb: mt_size_mb * 2,
            ckeys: true,
            tags: true,
            nr_workers: 4,
            co_per_worker: 1,
            worker_cores: WorkerCores::Auto,
        }
    }

    /// Set the block cache budget in MiB.
    pub fn cache_size_mb(mut self, mb: usize) -> Self {
        self.cache_size_mb = mb;
        self
    }

    /// Set the target max memtable size in MiB. Also moves the WAL cap to
    /// twice that unless `wal_size_mb` is set afterwards.
    pub fn mt_size_mb(mut self, mb: usize) -> Self {
        self.mt_size_mb = mb;
        self.wal_size_mb = mb * 2;
        self
    }

    /// Set the per-WAL-file size cap in MiB.
    pub fn wal_size_mb(mut self, mb: usize) -> Self {
        self.wal_size_mb = mb;
        self
    }

    /// Enable or disable prefix-compressed key blocks.
    pub fn ckeys(mut self, enabled: bool) -> Self {
        self.ckeys = enabled;
        self
    }

    /// Enable or disable per-key hash tags.
    pub fn tags(mut self, enabled: bool) -> Self {
        self.tags = enabled;
        self
    }

    /// Set the compaction worker thread count.
    pub fn nr_workers(mut self, n: u32) -> Self {
        self.nr_workers = n.max(1);
        self
    }

    /// Set the cooperative task count per compaction worker.
    pub fn co_per_worker(mut self, n: u32) -> Self {
        self.co_per_worker = n.max(1);
        self
    }

    /// Set the compaction worker CPU placement.
    pub fn worker_cores(mut self, cores: WorkerCores) -> Self {
        self.worker_cores = cores;
        self
    }

    pub(crate) fn max_mtsz(&self) -> u64 {
        (self.mt_size_mb as u64) << 20
    }

    pub(crate) fn max_walsz(&self) -> u64 {
        (self.wal_size_mb as u64) << 20
    }
}
