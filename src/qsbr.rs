//! Quiescent-state-based reclamation for memtable views.
//!
//! Every per-thread database handle registers a slot holding the view
//! generation it last observed. Readers publish a new generation on each
//! top-level operation; a reader that wants to bow out for a while parks
//! its slot instead. After rotating the view, the compactor waits until
//! every registered slot has either passed the rotation's generation or is
//! parked. From then on no reader can still be touching the retired view,
//! and its immutable memtable may be drained or cleaned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Slot value meaning "reader is parked and passes any generation".
pub const PARKED: u64 = u64::MAX;

pub struct Qsbr {
    slots: Mutex<Vec<Weak<AtomicU64>>>,
}

/// A registered reader's slot. Deregisters itself on drop.
pub struct ReaderSlot {
    cell: Arc<AtomicU64>,
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

impl Qsbr {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Registers a reader. The slot starts parked; the reader publishes a
    /// generation before its first access.
    pub fn register(&self) -> ReaderSlot {
        let cell = Arc::new(AtomicU64::new(PARKED));
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|weak| weak.strong_count() > 0);
        slots.push(Arc::downgrade(&cell));
        ReaderSlot { cell }
    }

    /// Blocks until every registered reader has observed a generation
    /// >= `target` or parked. Dropped readers pass implicitly.
    pub fn wait(&self, target: u64) {
        loop {
            let all_passed = {
                let mut slots = self.slots.lock().unwrap();
                slots.retain(|weak| weak.strong_count() > 0);
                slots.iter().all(|weak| match weak.upgrade() {
                    Some(cell) => {
                        let seen = cell.load(Ordering::Acquire);
                        seen == PARKED || seen >= target
                    }
                    None => true,
                })
            };
            if all_passed {
                return;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|weak| weak.strong_count() > 0);
        slots.len()
    }
}

impl ReaderSlot {
    /// Publishes the generation this reader now operates under.
    /// Generations only move forward; a stale store is ignored.
    pub fn update(&self, gen: u64) {
        let seen = self.cell.load(Ordering::Relaxed);
        if seen == PARKED || seen < gen {
            self.cell.store(gen, Ordering::Release);
        }
    }

    /// Bows out: the writer side treats this reader as passed until it
    /// resumes via [`ReaderSlot::update`].
    pub fn park(&self) {
        self.cell.store(PARKED, Ordering::Release);
    }
}
