//! Scheduler-aware locking utilities.
//!
//! [`Mutex`] wraps a standard mutex and performs the
//! sleeps/wakes accounting dance around acquisition, so a worker blocking on
//! shared state hands its core back to the pool for the duration.
//! [`Spinlock`] is a reentrant test-and-set lock keyed on the crate's
//! per-thread id, for very short critical sections.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{self, TryLockError};
use std::thread;

use crate::tls;

// -----------------------------------------------------------------------------
// Reentrant spinlock

/// A reentrant spinlock. The owning thread may nest [`Spinlock::lock`] calls
/// freely; the lock is released when the outermost guard drops.
pub struct Spinlock {
    owner: AtomicU64,
    depth: UnsafeCell<u32>,
}

// SAFETY: `depth` is only touched by the thread recorded in `owner`.
unsafe impl Send for Spinlock {}
unsafe impl Sync for Spinlock {}

/// Keeps the lock held; dropping releases one level of reentrancy.
pub struct SpinlockGuard<'a> {
    lock: &'a Spinlock,
}

impl Spinlock {
    pub const fn new() -> Spinlock {
        Spinlock {
            owner: AtomicU64::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> SpinlockGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            thread::yield_now();
        }
    }

    /// Acquires the lock if it is free or already held by this thread.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        let tid = tls::current_thread_id();
        if self.owner.load(Ordering::Acquire) == tid {
            // SAFETY: We are the owner, so nobody else touches `depth`.
            unsafe { *self.depth.get() += 1 };
            return Some(SpinlockGuard { lock: self });
        }
        if self
            .owner
            .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // SAFETY: Ownership was just transferred to us.
            unsafe { *self.depth.get() = 1 };
            return Some(SpinlockGuard { lock: self });
        }
        None
    }
}

impl Default for Spinlock {
    fn default() -> Spinlock {
        Spinlock::new()
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: Guards only exist on the owning thread.
        let depth = unsafe { &mut *self.lock.depth.get() };
        *depth -= 1;
        if *depth == 0 {
            self.lock.owner.store(0, Ordering::Release);
        }
    }
}

// -----------------------------------------------------------------------------
// Scheduler-notifying mutex

/// A mutex that notifies the calling thread's scheduler around acquisition,
/// so a blocked worker is transiently replaced by a spare one.
pub struct Mutex<T> {
    inner: sync::Mutex<T>,
}

/// Guards access to the data; released on drop.
pub struct MutexGuard<'a, T>(sync::MutexGuard<'a, T>);

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            inner: sync::Mutex::new(value),
        }
    }

    /// Acquires the mutex, declaring the thread asleep for the duration of
    /// the wait.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        tls::current_thread_sleeps();
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        tls::current_thread_wakes_up();
        MutexGuard(guard)
    }

    /// Acquires the mutex only if it is immediately available. No accounting
    /// is performed because the thread never blocks.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(MutexGuard(guard)),
            Err(TryLockError::Poisoned(e)) => Some(MutexGuard(e.into_inner())),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn spinlock_is_reentrant() {
        let lock = Spinlock::new();
        let outer = lock.lock();
        let inner = lock.lock();
        drop(inner);
        drop(outer);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn spinlock_excludes_other_threads() {
        let lock = Arc::new(Spinlock::new());
        let hits = Arc::new(AtomicU32::new(0));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let hits = Arc::clone(&hits);
            threads.push(thread::spawn(move || {
                for _ in 0..500 {
                    let _guard = lock.lock();
                    let seen = hits.load(Ordering::Relaxed);
                    hits.store(seen + 1, Ordering::Relaxed);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn mutex_guards_data() {
        let mutex = Arc::new(Mutex::new(0u32));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let mutex = Arc::clone(&mutex);
            threads.push(thread::spawn(move || {
                for _ in 0..500 {
                    *mutex.lock() += 1;
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 2000);
    }
}
