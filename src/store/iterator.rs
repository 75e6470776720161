//! K-way merge across the engine's layers.
//!
//! A scan sees up to three sorted sources: the writable memtable, the
//! immutable memtable while a compaction is in flight, and the table zone
//! version. Sources carry a rank (higher is newer) and a binary heap
//! orders entries by (key ascending, rank descending), so when several
//! layers hold the same key the newest version surfaces first and the
//! older duplicates are skipped. In tombstone-aware mode a surfaced
//! tombstone hides the key entirely and the merge moves on.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::memtable::MemIter;
use crate::record::Record;
use crate::zone::version::VersionIter;

/// Upper bound on merge sources; the engine itself uses at most three.
pub const MAX_STREAMS: usize = 18;

/// One sorted input layer.
pub enum Source {
    Mem(MemIter),
    Version(VersionIter),
}

impl Source {
    fn seek(&mut self, key: &[u8]) -> Result<()> {
        match self {
            Source::Mem(iter) => {
                iter.seek(key);
                Ok(())
            }
            Source::Version(iter) => iter.seek(key),
        }
    }

    fn peek(&self) -> Option<&Record> {
        match self {
            Source::Mem(iter) => iter.peek(),
            Source::Version(iter) => iter.peek(),
        }
    }

    fn advance(&mut self) -> Result<()> {
        match self {
            Source::Mem(iter) => {
                iter.advance();
                Ok(())
            }
            Source::Version(iter) => iter.advance(),
        }
    }
}

struct HeapEntry {
    record: Record,
    /// Source rank; higher is newer and wins on equal keys.
    rank: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.record.key == other.record.key && self.rank == other.rank
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed on key for min-heap behavior out of the max-heap;
        // on equal keys the higher rank pops first.
        match self.record.key.cmp(&other.record.key) {
            Ordering::Equal => self.rank.cmp(&other.rank),
            other => other.reverse(),
        }
    }
}

/// Unique-key, rank-resolved merge over the engine's layers.
pub struct MergeIter {
    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
    current: Option<Record>,
    /// Hide tombstoned keys instead of yielding them.
    ts_aware: bool,
}

impl MergeIter {
    /// `sources` ordered oldest first: rank equals the position index.
    pub fn new(sources: Vec<Source>, ts_aware: bool) -> Self {
        assert!(sources.len() <= MAX_STREAMS);
        Self {
            sources,
            heap: BinaryHeap::new(),
            current: None,
            ts_aware,
        }
    }

    /// Positions at the first visible key >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.heap.clear();
        self.current = None;
        for rank in 0..self.sources.len() {
            self.sources[rank].seek(key)?;
            self.refill(rank)?;
        }
        self.step(None)
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The record under the cursor. Never a tombstone in tombstone-aware
    /// mode.
    pub fn peek(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    /// Advances past every version of the current key to the next visible
    /// one.
    pub fn skip_unique(&mut self) -> Result<()> {
        let Some(prev) = self.current.take() else {
            return Ok(());
        };
        self.step(Some(prev.key))
    }

    /// Tears down the merge state; a later `seek` rebuilds it.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.current = None;
    }

    /// Pops the next unique visible record into `current`, skipping
    /// duplicates of `skip_key` and, in tombstone-aware mode, deleted keys.
    fn step(&mut self, mut skip_key: Option<Vec<u8>>) -> Result<()> {
        loop {
            let Some(entry) = self.heap.pop() else {
                self.current = None;
                return Ok(());
            };
            self.refill(entry.rank)?;

            if skip_key.as_deref() == Some(entry.record.key.as_slice()) {
                continue;
            }
            if self.ts_aware && entry.record.tombstone {
                // The newest version of this key is a delete; hide the
                // older duplicates as well.
                skip_key = Some(entry.record.key);
                continue;
            }
            self.current = Some(entry.record);
            return Ok(());
        }
    }

    fn refill(&mut self, rank: usize) -> Result<()> {
        if let Some(record) = self.sources[rank].peek() {
            let record = record.clone();
            self.heap.push(HeapEntry { record, rank });
            self.sources[rank].advance()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::{Memtable, MergeDecision};
    use std::sync::Arc;

    fn mt_with(entries: &[(&[u8], &[u8])], tombstones: &[&[u8]]) -> Arc<Memtable> {
        let mt = Arc::new(Memtable::new());
        for (key, value) in entries {
            mt.merge(key, |_| {
                MergeDecision::Insert(Record::put(key.to_vec(), value.to_vec()))
            });
        }
        for key in tombstones {
            mt.merge(key, |_| {
                MergeDecision::Insert(Record::tombstone(key.to_vec()))
            });
        }
        mt
    }

    fn collect(iter: &mut MergeIter) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(rec) = iter.peek() {
            out.push((rec.key.clone(), rec.value.clone()));
            iter.skip_unique().expect("skip");
        }
        out
    }

    #[test]
    fn test_merge_two_memtables() {
        let old = mt_with(&[(b"a", b"old-a"), (b"c", b"old-c")], &[]);
        let new = mt_with(&[(b"b", b"new-b")], &[]);

        let mut iter = MergeIter::new(
            vec![Source::Mem(old.iter()), Source::Mem(new.iter())],
            true,
        );
        iter.seek(b"").expect("seek");
        assert_eq!(
            collect(&mut iter),
            vec![
                (b"a".to_vec(), b"old-a".to_vec()),
                (b"b".to_vec(), b"new-b".to_vec()),
                (b"c".to_vec(), b"old-c".to_vec()),
            ]
        );
    }

    #[test]
    fn test_higher_rank_wins_duplicates() {
        let old = mt_with(&[(b"k", b"stale")], &[]);
        let new = mt_with(&[(b"k", b"fresh")], &[]);

        let mut iter = MergeIter::new(
            vec![Source::Mem(old.iter()), Source::Mem(new.iter())],
            true,
        );
        iter.seek(b"").expect("seek");
        assert_eq!(collect(&mut iter), vec![(b"k".to_vec(), b"fresh".to_vec())]);
    }

    #[test]
    fn test_tombstone_hides_older_value() {
        let old = mt_with(&[(b"k", b"alive"), (b"m", b"kept")], &[]);
        let new = mt_with(&[], &[b"k"]);

        let mut iter = MergeIter::new(
            vec![Source::Mem(old.iter()), Source::Mem(new.iter())],
            true,
        );
        iter.seek(b"").expect("seek");
        assert_eq!(collect(&mut iter), vec![(b"m".to_vec(), b"kept".to_vec())]);
    }

    #[test]
    fn test_ts_unaware_yields_tombstones() {
        let mt = mt_with(&[(b"a", b"1")], &[b"b"]);
        let mut iter = MergeIter::new(vec![Source::Mem(mt.iter())], false);
        iter.seek(b"").expect("seek");

        let mut seen = Vec::new();
        while let Some(rec) = iter.peek() {
            seen.push((rec.key.clone(), rec.tombstone));
            iter.skip_unique().expect("skip");
        }
        assert_eq!(seen, vec![(b"a".to_vec(), false), (b"b".to_vec(), true)]);
    }

    #[test]
    fn test_seek_mid_range() {
        let mt = mt_with(&[(b"a", b"1"), (b"c", b"3"), (b"e", b"5")], &[]);
        let mut iter = MergeIter::new(vec![Source::Mem(mt.iter())], true);
        iter.seek(b"b").expect("seek");
        assert_eq!(iter.peek().unwrap().key, b"c");
    }

    #[test]
    fn test_clear_invalidates() {
        let mt = mt_with(&[(b"a", b"1")], &[]);
        let mut iter = MergeIter::new(vec![Source::Mem(mt.iter())], true);
        iter.seek(b"").expect("seek");
        assert!(iter.valid());
        iter.clear();
        assert!(!iter.valid());
    }
}
