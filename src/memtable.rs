//! In-memory ordered table over a concurrent skip list.
//!
//! The engine runs two instances of this structure: the writable memtable
//! (WMT) absorbing every mutation, and, during compaction, the immutable
//! memtable (IMT) that the previous WMT becomes after a view rotation.
//! Immutability of the IMT is a protocol property, not a type-level one:
//! after the rotation quiesces, the compactor is the only writer-side
//! visitor and it never mutates.
//!
//! Reads go straight to the skip list and never block. Writes go through
//! [`Memtable::merge`], a read-modify-write serialized per key by a shard
//! lock chosen from the key hash, so at most one writer is visible per key
//! while writers on other keys proceed in parallel. The merge callback is
//! where the engine does its atomic bookkeeping (WAL append, size
//! accounting, view check) before the new record becomes visible.
//!
//! Tombstones are stored as ordinary entries with the flag set; a lookup
//! distinguishes "present but deleted" from "absent" so the engine knows
//! whether to keep probing older layers.

use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_skiplist::SkipMap;

use crate::hash::key_hash32;
use crate::record::{Record, RecordRef};

/// Number of write shards. Writers on the same key always collide on the
/// same shard; writers on different keys rarely do.
const WRITE_SHARDS: usize = 64;

/// What a merge callback decided to do with the key.
pub enum MergeDecision {
    /// Insert or replace the entry with this record.
    Insert(Record),
    /// Leave the entry as it is (also used when the callback only read).
    Keep,
    /// Abort: the caller's precondition failed and the operation must be
    /// retried from the top.
    Abort,
}

struct Slot {
    value: Vec<u8>,
    tombstone: bool,
}

pub struct Memtable {
    data: SkipMap<Vec<u8>, Slot>,
    shards: Vec<Mutex<()>>,
    entries: AtomicUsize,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            shards: (0..WRITE_SHARDS).map(|_| Mutex::new(())).collect(),
            entries: AtomicUsize::new(0),
        }
    }

    /// Returns the stored record for `key`, tombstones included.
    /// `None` means the key is absent from this memtable and the caller
    /// should consult older layers.
    pub fn get(&self, key: &[u8]) -> Option<Record> {
        self.data.get(key).map(|entry| Record {
            key: entry.key().clone(),
            value: entry.value().value.clone(),
            tombstone: entry.value().tombstone,
        })
    }

    /// Presence probe: `Some(true)` live, `Some(false)` tombstone, `None` absent.
    pub fn probe(&self, key: &[u8]) -> Option<bool> {
        self.data.get(key).map(|entry| !entry.value().tombstone)
    }

    /// Read-modify-write for one key, serialized against other writers of
    /// the same key. The callback sees the current record (if any) and
    /// returns a [`MergeDecision`]; `false` is returned iff it aborted.
    pub fn merge<F>(&self, key: &[u8], f: F) -> bool
    where
        F: FnOnce(Option<RecordRef<'_>>) -> MergeDecision,
    {
        let shard = &self.shards[key_hash32(key) as usize % WRITE_SHARDS];
        let _guard = shard.lock().unwrap();

        let existing = self.data.get(key);
        let current = existing.as_ref().map(|entry| RecordRef {
            key,
            value: &entry.value().value,
            tombstone: entry.value().tombstone,
        });

        match f(current) {
            MergeDecision::Insert(record) => {
                debug_assert_eq!(record.key, key);
                let replaced = existing.is_some();
                self.data.insert(
                    record.key,
                    Slot {
                        value: record.value,
                        tombstone: record.tombstone,
                    },
                );
                if !replaced {
                    self.entries.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            MergeDecision::Keep => true,
            MergeDecision::Abort => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties the memtable in place so it can serve as the next writable
    /// memtable. Called after the engine has quiesced all readers of the
    /// view this memtable belonged to.
    pub fn clean(&self) {
        while let Some(entry) = self.data.front() {
            entry.remove();
        }
        self.entries.store(0, Ordering::Relaxed);
    }

    /// Ordered iteration starting at the smallest key.
    pub fn iter(self: &Arc<Self>) -> MemIter {
        MemIter {
            mt: Arc::clone(self),
            current: None,
            exhausted: true,
        }
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable").field("len", &self.len()).finish()
    }
}

/// Ordered cursor over a memtable.
///
/// Each step re-ranges the skip list from the current key, so the cursor
/// holds no skip-list guard between calls and stays valid under concurrent
/// writes to other keys.
pub struct MemIter {
    mt: Arc<Memtable>,
    current: Option<Record>,
    exhausted: bool,
}

impl MemIter {
    /// Positions the cursor at the first key >= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        let range = (Bound::Included(key), Bound::Unbounded);
        self.load(range);
    }

    /// The record under the cursor, or `None` past the end.
    pub fn peek(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    /// Moves to the next key.
    pub fn advance(&mut self) {
        if self.exhausted {
            return;
        }
        let key = match &self.current {
            Some(rec) => rec.key.clone(),
            None => return,
        };
        let range = (Bound::Excluded(&key[..]), Bound::Unbounded);
        self.load(range);
    }

    fn load(&mut self, range: (Bound<&[u8]>, Bound<&[u8]>)) {
        match self.mt.data.range::<[u8], _>(range).next() {
            Some(entry) => {
                self.current = Some(Record {
                    key: entry.key().clone(),
                    value: entry.value().value.clone(),
                    tombstone: entry.value().tombstone,
                });
                self.exhausted = false;
            }
            None => {
                self.current = None;
                self.exhausted = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(mt: &Memtable, key: &[u8], value: &[u8]) {
        let committed = mt.merge(key, |_| {
            MergeDecision::Insert(Record::put(key.to_vec(), value.to_vec()))
        });
        assert!(committed);
    }

    fn delete(mt: &Memtable, key: &[u8]) {
        let committed = mt.merge(key, |_| {
            MergeDecision::Insert(Record::tombstone(key.to_vec()))
        });
        assert!(committed);
    }

    #[test]
    fn test_merge_and_get() {
        let mt = Memtable::new();
        insert(&mt, b"key1", b"value1");
        insert(&mt, b"key2", b"value2");

        let rec = mt.get(b"key1").expect("key1 present");
        assert_eq!(rec.value, b"value1");
        assert!(!rec.tombstone);
        assert!(mt.get(b"key3").is_none());
        assert_eq!(mt.len(), 2);
    }

    #[test]
    fn test_update_in_place() {
        let mt = Memtable::new();
        insert(&mt, b"key1", b"old");
        insert(&mt, b"key1", b"new");

        assert_eq!(mt.get(b"key1").unwrap().value, b"new");
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_tombstone_is_present_but_dead() {
        let mt = Memtable::new();
        insert(&mt, b"key1", b"value1");
        delete(&mt, b"key1");

        let rec = mt.get(b"key1").expect("tombstone is a stored entry");
        assert!(rec.tombstone);
        assert_eq!(mt.probe(b"key1"), Some(false));
        assert_eq!(mt.probe(b"key2"), None);
    }

    #[test]
    fn test_merge_sees_current() {
        let mt = Memtable::new();
        insert(&mt, b"counter", b"1");

        let committed = mt.merge(b"counter", |current| {
            let current = current.expect("current present");
            assert_eq!(current.value, b"1");
            MergeDecision::Insert(Record::put(b"counter".to_vec(), b"2".to_vec()))
        });
        assert!(committed);
        assert_eq!(mt.get(b"counter").unwrap().value, b"2");
    }

    #[test]
    fn test_merge_abort_leaves_state() {
        let mt = Memtable::new();
        insert(&mt, b"key1", b"value1");

        let committed = mt.merge(b"key1", |_| MergeDecision::Abort);
        assert!(!committed);
        assert_eq!(mt.get(b"key1").unwrap().value, b"value1");
    }

    #[test]
    fn test_zero_length_key() {
        let mt = Memtable::new();
        insert(&mt, b"", b"empty");
        assert_eq!(mt.get(b"").unwrap().value, b"empty");
    }

    #[test]
    fn test_iter_sorted() {
        let mt = Arc::new(Memtable::new());
        insert(&mt, b"22", b"2_value");
        insert(&mt, b"00", b"0_value");
        insert(&mt, b"11", b"1_value");

        let mut iter = mt.iter();
        iter.seek(b"");
        let mut keys = Vec::new();
        while let Some(rec) = iter.peek() {
            keys.push(rec.key.clone());
            iter.advance();
        }
        assert_eq!(keys, vec![b"00".to_vec(), b"11".to_vec(), b"22".to_vec()]);
    }

    #[test]
    fn test_iter_seek_mid() {
        let mt = Arc::new(Memtable::new());
        insert(&mt, b"a", b"1");
        insert(&mt, b"c", b"3");
        insert(&mt, b"e", b"5");

        let mut iter = mt.iter();
        iter.seek(b"b");
        assert_eq!(iter.peek().unwrap().key, b"c");
        iter.advance();
        assert_eq!(iter.peek().unwrap().key, b"e");
        iter.advance();
        assert!(iter.peek().is_none());
    }

    #[test]
    fn test_iter_survives_concurrent_insert() {
        let mt = Arc::new(Memtable::new());
        insert(&mt, b"a", b"1");
        insert(&mt, b"c", b"3");

        let mut iter = mt.iter();
        iter.seek(b"a");
        assert_eq!(iter.peek().unwrap().key, b"a");

        // An insert between the cursor and its successor is picked up.
        insert(&mt, b"b", b"2");
        iter.advance();
        assert_eq!(iter.peek().unwrap().key, b"b");
    }

    #[test]
    fn test_clean_reuses() {
        let mt = Memtable::new();
        insert(&mt, b"key1", b"value1");
        insert(&mt, b"key2", b"value2");

        mt.clean();
        assert!(mt.is_empty());
        assert!(mt.get(b"key1").is_none());

        insert(&mt, b"key3", b"value3");
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_concurrent_same_key_merges() {
        let mt = Arc::new(Memtable::new());
        insert(&mt, b"counter", b"0");

        std::thread::scope(|s| {
            for _ in 0..4 {
                let mt = Arc::clone(&mt);
                s.spawn(move || {
                    for _ in 0..250 {
                        mt.merge(b"counter", |current| {
                            let n: u64 = std::str::from_utf8(current.unwrap().value)
                                .unwrap()
                                .parse()
                                .unwrap();
                            MergeDecision::Insert(Record::put(
                                b"counter".to_vec(),
                                (n + 1).to_string().into_bytes(),
                            ))
                        });
                    }
                });
            }
        });

        assert_eq!(mt.get(b"counter").unwrap().value, b"1000");
    }
}
