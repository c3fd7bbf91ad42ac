//! Bounded multi-producer blocking queue.
//!
//! Decouples the query workers from the single formatting consumer. Backed by
//! a fixed ring buffer guarded by one lock and two condition variables
//! (space-available, data-available), so a stalled consumer applies
//! backpressure to the workers instead of growing memory without bound.

use parking_lot::{Condvar, Mutex};

/// Default queue capacity for the sampling pipeline.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Fixed-capacity FIFO queue, safe for any number of producers.
///
/// `push` blocks while the queue is full; `pop` blocks while it is empty.
/// Items are observed by the consumer in push-completion order. Both waits
/// recheck their predicate in a loop, so spurious wakeups and multiple
/// waiters cannot produce a stale read or a lost wakeup.
pub struct BoundedQueue<T> {
    ring: Mutex<Ring<T>>,
    space: Condvar,
    data: Condvar,
}

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            ring: Mutex::new(Ring {
                slots,
                head: 0,
                len: 0,
            }),
            space: Condvar::new(),
            data: Condvar::new(),
        }
    }

    /// Insert one item, blocking while the queue is full.
    pub fn push(&self, item: T) {
        let mut ring = self.ring.lock();
        let capacity = ring.slots.len();

        while ring.len == capacity {
            self.space.wait(&mut ring);
        }

        let idx = (ring.head + ring.len) % capacity;
        ring.slots[idx] = Some(item);
        ring.len += 1;

        drop(ring);
        self.data.notify_one();
    }

    /// Remove and return the oldest item, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        let mut ring = self.ring.lock();
        let capacity = ring.slots.len();

        while ring.len == 0 {
            self.data.wait(&mut ring);
        }

        let head = ring.head;
        let item = ring.slots[head].take().expect("occupied slot within len");
        ring.head = (head + 1) % capacity;
        ring.len -= 1;

        drop(ring);
        self.space.notify_one();
        item
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    /// True if no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items the queue can hold.
    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }
}
