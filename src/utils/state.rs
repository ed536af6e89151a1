use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free snapshot cell with versioning.
///
/// Writers replace the whole snapshot atomically via [`ArcSwap`];
/// readers load it without blocking and can use the sequence counter to
/// detect changes. Used for the controller status and per-component
/// state snapshots, which are written rarely and read from arbitrary
/// threads.
pub struct StateCell<T: Send + Sync + 'static> {
    snap: ArcSwap<T>,
    seq: CachePadded<AtomicU64>,
}

impl<T: Send + Sync + 'static> StateCell<T> {
    /// Create a new cell with an initial snapshot.
    pub fn new(init: T) -> Self {
        Self {
            snap: ArcSwap::from(Arc::new(init)),
            seq: CachePadded::new(AtomicU64::new(1)),
        }
    }

    /// Create a new cell wrapped in [`Arc`].
    pub fn new_arc(init: T) -> Arc<Self> {
        Arc::new(Self::new(init))
    }

    /// Publish a new snapshot (by value).
    #[inline]
    pub fn publish(&self, next: T) {
        self.snap.store(Arc::new(next));
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Current snapshot as an owned [`Arc`].
    #[inline]
    pub fn load(&self) -> Arc<T> {
        self.snap.load_full()
    }

    /// Temporary borrow of the current snapshot; cheaper than
    /// [`load`](Self::load) for short-lived local reads.
    #[inline]
    pub fn peek(&self) -> arc_swap::Guard<Arc<T>> {
        self.snap.load()
    }

    /// Current sequence number.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Check if the snapshot changed since `last`.
    #[inline]
    pub fn changed_since(&self, last: u64) -> bool {
        self.seq() != last
    }
}
