//! The memtable view ring.
//!
//! Two physical memtables A and B serve four logical views:
//!
//! ```text
//! view 0: (wmt: A, imt: none)   normal on A
//! view 1: (wmt: B, imt: A)      compacting A, writes go to B
//! view 2: (wmt: B, imt: none)   normal on B
//! view 3: (wmt: A, imt: B)      compacting B, writes go to A
//! ```
//!
//! The current view is named by a monotonically increasing generation;
//! `generation % 4` is the ring slot. Advancing the generation is the only
//! mutation and happens under the engine lock, so readers can derive a
//! consistent view from any generation value they observed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::memtable::Memtable;

#[derive(Clone)]
pub struct MtView {
    pub wmt: Arc<Memtable>,
    pub imt: Option<Arc<Memtable>>,
}

impl MtView {
    /// True while this view carries an immutable memtable, i.e. a
    /// compaction over it is in flight.
    pub fn compacting(&self) -> bool {
        self.imt.is_some()
    }
}

pub struct ViewRing {
    views: [MtView; 4],
    generation: AtomicU64,
}

impl ViewRing {
    pub fn new(a: Arc<Memtable>, b: Arc<Memtable>) -> Self {
        let views = [
            MtView {
                wmt: Arc::clone(&a),
                imt: None,
            },
            MtView {
                wmt: Arc::clone(&b),
                imt: Some(Arc::clone(&a)),
            },
            MtView {
                wmt: Arc::clone(&b),
                imt: None,
            },
            MtView {
                wmt: a,
                imt: Some(b),
            },
        ];
        Self {
            views,
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The view a given generation names. The ring itself is immutable, so
    /// this is valid for any generation, current or past.
    pub fn view_at(&self, generation: u64) -> &MtView {
        &self.views[(generation % 4) as usize]
    }

    pub fn current(&self) -> &MtView {
        self.view_at(self.generation())
    }

    /// Advances to the next view and returns the new generation.
    /// Must be called under the engine lock.
    pub fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}
