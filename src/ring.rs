//! Bounded single-producer/single-consumer ring.
//!
//! [`spsc`] hands out a [`Producer`]/[`Consumer`] pair over shared storage;
//! exclusive `&mut self` on each handle is what makes the single-producer/
//! single-consumer contract a compile-time property rather than a comment.
//!
//! One slot is kept as a sentinel to tell a full ring from an empty one, so
//! a ring of capacity `C` holds at most `C - 1` items. Index discipline:
//! each side loads its own index relaxed, the peer's index with `Acquire`,
//! and publishes its own with `Release`. Both operations are wait-free.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

struct Shared<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot the producer will write. Producer-owned.
    head: CachePadded<AtomicUsize>,
    /// Next slot the consumer will read. Consumer-owned.
    tail: CachePadded<AtomicUsize>,
}

// SAFETY: slots are only touched by the unique producer (writes at `head`)
// and the unique consumer (reads at `tail`), and the index handoff uses
// release/acquire pairs, so no slot is accessed from two threads at once.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn occupancy(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            self.slots.len() - tail + head
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Leftover items (e.g. after cancellation) still need destructors.
        let mut tail = *self.tail.get_mut();
        let head = *self.head.get_mut();
        while tail != head {
            // SAFETY: slots in [tail, head) were initialized by the producer
            // and never consumed; we have exclusive access in drop.
            unsafe { (*self.slots[tail].get()).assume_init_drop() };
            tail = (tail + 1) % self.slots.len();
        }
    }
}

/// Write half of the ring.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

/// Read half of the ring.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

/// Create a ring with room for `capacity - 1` items.
///
/// # Panics
/// Panics if `capacity < 2` (no usable slot would remain).
pub fn spsc<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity >= 2, "spsc ring needs capacity >= 2");
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let shared = Arc::new(Shared {
        slots,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });
    (Producer { shared: Arc::clone(&shared) }, Consumer { shared })
}

impl<T> Producer<T> {
    /// Attempt to enqueue `item`; hands it back when the ring is full.
    #[inline]
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);
        let next = (head + 1) % shared.slots.len();
        if next == shared.tail.load(Ordering::Acquire) {
            return Err(item);
        }
        // SAFETY: the slot at `head` is unoccupied (ring not full) and only
        // this producer writes slots.
        unsafe { (*shared.slots[head].get()).write(item) };
        shared.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Items currently queued; may be stale the moment it returns.
    pub fn approx_size(&self) -> usize {
        self.shared.occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }
}

impl<T> Consumer<T> {
    /// Attempt to dequeue the oldest item.
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let tail = shared.tail.load(Ordering::Relaxed);
        if tail == shared.head.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the slot at `tail` was initialized by the producer before
        // the matching head release, and only this consumer reads slots.
        let item = unsafe { (*shared.slots[tail].get()).assume_init_read() };
        shared.tail.store((tail + 1) % shared.slots.len(), Ordering::Release);
        Some(item)
    }

    /// Items currently queued; may be stale the moment it returns.
    pub fn approx_size(&self) -> usize {
        self.shared.occupancy()
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }
}
