use crate::error::PutError;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default queue capacity when none is given.
pub const DEFAULT_CAPACITY: usize = 100;

/// Bounded thread-safe FIFO with blocking and non-blocking accessors.
///
/// The queue is the rendezvous between threads that must not block
/// (e.g. subscription callbacks posting with [`try_put`](Self::try_put))
/// and service threads that park on [`get`](Self::get) until work
/// arrives:
///
/// ```ignore
/// let fifo = SemFifo::new(10);
///
/// // posting thread, must not block:
/// if fifo.try_put(report).is_err() {
///     // queue full, report dropped
/// }
///
/// // handling thread:
/// while let Some(report) = fifo.get() {
///     // ...
/// }
/// ```
///
/// [`release`](Self::release) is the cooperative cancellation hook: it
/// wakes every blocked producer and consumer exactly once with a
/// released result, and the queue stays unusable until
/// [`flush`](Self::flush) re-primes it. [`wait_for_empty`](Self::wait_for_empty)
/// lets another thread rendezvous on the queue draining, e.g. before
/// joining the consumer.
///
/// Handles are cheap clones over shared state.
pub struct SemFifo<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SemFifo<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

struct Shared<T> {
    ring: Mutex<Ring<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    empty: Condvar,
}

struct Ring<T> {
    buf: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
    released: bool,
}

impl<T> Ring<T> {
    fn push(&mut self, value: T) {
        self.buf[self.tail] = Some(value);
        self.tail = (self.tail + 1) % self.buf.len();
        self.len += 1;
    }

    fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.buf[self.head].take();
        self.head = (self.head + 1) % self.buf.len();
        self.len -= 1;
        value
    }
}

impl<T> SemFifo<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut buf = Vec::with_capacity(capacity);
        buf.resize_with(capacity, || None);

        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(Ring {
                    buf,
                    head: 0,
                    tail: 0,
                    len: 0,
                    released: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                empty: Condvar::new(),
            }),
        }
    }

    /// Enqueue `value`, blocking while the queue is full.
    ///
    /// Returns the value back inside a released error if [`release`]
    /// fires before a slot opens up.
    ///
    /// [`release`]: Self::release
    pub fn put(&self, value: T) -> Result<(), PutError<T>> {
        let mut ring = self.shared.ring.lock().unwrap();
        loop {
            if ring.released {
                return Err(PutError::released(value));
            }
            if ring.len < ring.buf.len() {
                break;
            }
            ring = self.shared.not_full.wait(ring).unwrap();
        }

        ring.push(value);
        drop(ring);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue `value` without blocking. Fails with the value back when
    /// the queue is full or released.
    pub fn try_put(&self, value: T) -> Result<(), PutError<T>> {
        let mut ring = self.shared.ring.lock().unwrap();
        if ring.released {
            return Err(PutError::released(value));
        }
        if ring.len == ring.buf.len() {
            return Err(PutError::full(value));
        }

        ring.push(value);
        drop(ring);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the head item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is released.
    pub fn get(&self) -> Option<T> {
        let mut ring = self.shared.ring.lock().unwrap();
        loop {
            if ring.released {
                return None;
            }
            if ring.len > 0 {
                break;
            }
            ring = self.shared.not_empty.wait(ring).unwrap();
        }

        let value = ring.pop();
        let now_empty = ring.len == 0;
        drop(ring);
        self.shared.not_full.notify_one();
        if now_empty {
            self.shared.empty.notify_all();
        }
        value
    }

    /// Dequeue the head item without blocking. `None` when the queue is
    /// empty or released.
    pub fn try_get(&self) -> Option<T> {
        let mut ring = self.shared.ring.lock().unwrap();
        if ring.released {
            return None;
        }

        let value = ring.pop()?;
        let now_empty = ring.len == 0;
        drop(ring);
        self.shared.not_full.notify_one();
        if now_empty {
            self.shared.empty.notify_all();
        }
        Some(value)
    }

    /// Block until the queue drains. `None` waits indefinitely.
    ///
    /// Returns `true` if the queue was observed empty, `false` on
    /// timeout or release. Never consumes items.
    pub fn wait_for_empty(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ring = self.shared.ring.lock().unwrap();
        loop {
            if ring.len == 0 {
                return true;
            }
            if ring.released {
                return false;
            }
            match deadline {
                None => ring = self.shared.empty.wait(ring).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .shared
                        .empty
                        .wait_timeout(ring, deadline - now)
                        .unwrap();
                    ring = guard;
                }
            }
        }
    }

    /// Wake every blocked producer and consumer; each returns a
    /// released result exactly once. The queue refuses all traffic
    /// until [`flush`](Self::flush).
    pub fn release(&self) {
        let mut ring = self.shared.ring.lock().unwrap();
        ring.released = true;
        drop(ring);
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        self.shared.empty.notify_all();
    }

    /// Discard all contents, clear the released flag and re-prime the
    /// queue for use.
    pub fn flush(&self) {
        let mut ring = self.shared.ring.lock().unwrap();
        for slot in ring.buf.iter_mut() {
            *slot = None;
        }
        ring.head = 0;
        ring.tail = 0;
        ring.len = 0;
        ring.released = false;
        drop(ring);
        self.shared.not_full.notify_all();
        self.shared.empty.notify_all();
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.shared.ring.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items the queue can hold.
    pub fn capacity(&self) -> usize {
        self.shared.ring.lock().unwrap().buf.len()
    }
}

impl<T> Default for SemFifo<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
