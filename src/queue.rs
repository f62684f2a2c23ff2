//! The ready queue: a bounded ring of task handles behind a spinlock.
//!
//! This is the scheduler's one hot lock. Capacity equals the task pool's, so
//! the queue can never legitimately overflow; an overflowing push means the
//! accounting is broken and is fatal.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;

use crate::mem::{MemCallbacks, RawBuf};
use crate::pool::Handle;

pub(crate) struct ReadyQueue {
    lock: CachePadded<AtomicBool>,
    ring: UnsafeCell<Ring>,
}

struct Ring {
    buf: RawBuf<Handle>,
    head: u32,
    len: u32,
    capacity: u32,
}

// SAFETY: The ring is only touched while holding the test-and-set lock.
unsafe impl Send for ReadyQueue {}
unsafe impl Sync for ReadyQueue {}

impl ReadyQueue {
    pub fn new(capacity: u32, mem: MemCallbacks) -> ReadyQueue {
        ReadyQueue {
            lock: CachePadded::new(AtomicBool::new(false)),
            ring: UnsafeCell::new(Ring {
                buf: RawBuf::new(capacity as usize, mem),
                head: 0,
                len: 0,
                capacity,
            }),
        }
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut Ring) -> R) -> R {
        while self.lock.swap(true, Ordering::Acquire) {
            thread::yield_now();
        }
        // SAFETY: The lock gives us exclusive access to the ring.
        let result = f(unsafe { &mut *self.ring.get() });
        self.lock.store(false, Ordering::Release);
        result
    }

    pub fn push(&self, hnd: Handle) {
        self.with(|ring| {
            check!(
                ring.len < ring.capacity,
                "ready queue overflow: {} handles in use (capacity {})",
                ring.len,
                ring.capacity
            );
            let pos = (ring.head + ring.len) % ring.capacity;
            // SAFETY: In bounds; handles are plain values.
            unsafe { ring.buf.get(pos as usize).write(hnd) };
            ring.len += 1;
        });
    }

    pub fn pop(&self) -> Option<Handle> {
        self.with(|ring| {
            if ring.len == 0 {
                return None;
            }
            // SAFETY: In bounds and previously written by `push`.
            let hnd = unsafe { ring.buf.get(ring.head as usize).read() };
            ring.head = (ring.head + 1) % ring.capacity;
            ring.len -= 1;
            Some(hnd)
        })
    }

    pub fn len(&self) -> u32 {
        self.with(|ring| ring.len)
    }

    /// Copies out the queued handles, oldest first. Debug use only.
    pub fn snapshot(&self) -> Vec<Handle> {
        self.with(|ring| {
            (0..ring.len)
                .map(|i| {
                    let pos = (ring.head + i) % ring.capacity;
                    // SAFETY: In bounds and previously written by `push`.
                    unsafe { ring.buf.get(pos as usize).read() }
                })
                .collect()
        })
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u32) -> Handle {
        Handle::from_raw(raw)
    }

    #[test]
    fn fifo_order() {
        let queue = ReadyQueue::new(8, MemCallbacks::default());
        for raw in 1..=5u32 {
            queue.push(handle(raw << 20));
        }
        assert_eq!(queue.len(), 5);
        for raw in 1..=5u32 {
            assert_eq!(queue.pop(), Some(handle(raw << 20)));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn wraps_around_capacity() {
        let queue = ReadyQueue::new(4, MemCallbacks::default());
        for round in 0..10u32 {
            queue.push(handle((round + 1) << 20));
            queue.push(handle((round + 2) << 20));
            assert_eq!(queue.pop(), Some(handle((round + 1) << 20)));
            assert_eq!(queue.pop(), Some(handle((round + 2) << 20)));
        }
        assert_eq!(queue.len(), 0);
    }

    #[cfg(feature = "checks")]
    #[test]
    #[should_panic(expected = "overflow")]
    fn overflow_panics() {
        let queue = ReadyQueue::new(2, MemCallbacks::default());
        queue.push(handle(1 << 20));
        queue.push(handle(1 << 20));
        queue.push(handle(1 << 20));
    }
}
