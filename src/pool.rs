//! A versioned, reference-counted handle pool.
//!
//! The pool is a fixed array of slots, each carrying a single packed state
//! word: a 12-bit version in the high bits and a 20-bit reference count in
//! the low bits. Packing both into one word makes every transition a single
//! compare-exchange, so allocation, promotion, and release are all lock-free.
//!
//! Handles returned by the pool embed the slot's version, which survives the
//! slot being freed. A stale handle (one whose version no longer matches the
//! slot) fails every future [`HandlePool::try_ref`], which is the pool's
//! entire ABA defense: there are no tombstones and no epochs, just 4095
//! versions per slot with 0 reserved for the empty handle.
//!
//! Reference-count conventions:
//!
//! - `0` - the slot is free and may be re-acquired.
//! - `1` - transient finalizing marker. The thread that decremented 2 -> 1
//!   owns the slot for the duration of the finalizer; `try_ref` refuses it.
//! - `>= 2` - live. Allocation starts at 2: one reference for the owner and
//!   one sentinel that keeps the finalizer from running while other threads
//!   may still be promoting weak handles.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::mem::{MemCallbacks, RawBuf};

// -----------------------------------------------------------------------------
// Packing

/// The largest capacity a pool can have: indices are 20 bits.
pub const MAX_CAPACITY: usize = 1 << 20;

const COUNT_MASK: u32 = 0x000F_FFFF;
const INDEX_MASK: u32 = 0x000F_FFFF;
const VERSION_MASK: u32 = 0xFFF0_0000;
const VERSION_SHIFT: u32 = 20;

// -----------------------------------------------------------------------------
// Handle

/// An opaque 32-bit reference into a [`HandlePool`]: `version:12 | index:20`.
///
/// The all-zero value is the reserved empty handle. Handles compare by their
/// entire value; comparing indices alone would conflate a slot with its
/// previous occupants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u32);

impl Handle {
    /// The reserved empty handle.
    pub const EMPTY: Handle = Handle(0);

    #[inline(always)]
    pub(crate) fn from_raw(raw: u32) -> Handle {
        Handle(raw)
    }

    #[inline(always)]
    fn pack(version: u32, index: u32) -> Handle {
        Handle((version << VERSION_SHIFT) | (index & INDEX_MASK))
    }

    /// The raw 32-bit value.
    #[inline(always)]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The slot index this handle points at.
    #[inline(always)]
    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// The version tag baked into this handle. Zero only for [`Handle::EMPTY`].
    #[inline(always)]
    pub fn version(self) -> u32 {
        self.0 >> VERSION_SHIFT
    }

    /// Whether this is the reserved empty handle.
    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "Handle(empty)")
        } else {
            write!(f, "Handle(v{}.{})", self.version(), self.index())
        }
    }
}

// -----------------------------------------------------------------------------
// Pool

struct Slot<T> {
    state: AtomicU32,
    element: UnsafeCell<MaybeUninit<T>>,
}

/// A lock-free, fixed-capacity pool of reference-counted `T` slots.
///
/// Used by the scheduler for task and counter records, but usable as a
/// general thread-safe object pool. Capacity is fixed at construction and the
/// backing slab comes from the supplied [`MemCallbacks`].
pub struct HandlePool<T> {
    slots: RawBuf<CachePadded<Slot<T>>>,
    next: AtomicU32,
    capacity: u32,
}

// SAFETY: Elements are created on the acquiring thread, shared by reference
// across threads, and dropped by whichever thread performs the final unref,
// so both bounds are required of T. The slot state machine guarantees the
// accesses themselves never alias mutably.
unsafe impl<T: Send + Sync> Send for HandlePool<T> {}
unsafe impl<T: Send + Sync> Sync for HandlePool<T> {}

impl<T: Default> HandlePool<T> {
    /// Creates a pool with the given capacity. Capacity must be in
    /// `1..=MAX_CAPACITY`.
    pub fn new(capacity: u32, mem: MemCallbacks) -> HandlePool<T> {
        check!(
            capacity > 0 && (capacity as usize) <= MAX_CAPACITY,
            "pool capacity {capacity} outside 1..=2^20"
        );
        let slots: RawBuf<CachePadded<Slot<T>>> = RawBuf::new(capacity as usize, mem);
        for index in 0..capacity as usize {
            // Fresh slots start at version 0xFFF so the first acquisition
            // wraps the version to 1, never 0.
            let slot = Slot {
                state: AtomicU32::new(VERSION_MASK),
                element: UnsafeCell::new(MaybeUninit::uninit()),
            };
            // SAFETY: Writing into freshly allocated, uninitialized storage.
            unsafe { slots.get(index).write(CachePadded::new(slot)) };
        }
        HandlePool {
            slots,
            next: AtomicU32::new(0),
            capacity,
        }
    }

    /// Acquires a free slot, default-constructs its element, and returns a
    /// handle holding the initial two references (owner plus sentinel).
    ///
    /// # Panics
    ///
    /// Panics after `capacity * capacity` failed attempts; running out of
    /// slots is a sizing bug in the caller, not a recoverable condition.
    pub fn acquire_and_ref(&self) -> Handle {
        let mut tries: u64 = 0;
        loop {
            let pos = self.next.fetch_add(1, Ordering::Relaxed) % self.capacity;
            let slot = self.slot(pos as usize);
            let state = slot.state.load(Ordering::Acquire);
            if state & COUNT_MASK == 0 {
                let version = state >> VERSION_SHIFT;
                let mut new_version = (version + 1) & 0xFFF;
                if new_version == 0 {
                    new_version = 1;
                }
                let fresh = (new_version << VERSION_SHIFT) | 2;
                if slot
                    .state
                    .compare_exchange(state, fresh, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: The CAS transferred the slot from free to live
                    // with us as the only owner; nobody else can touch the
                    // element until the handle is published.
                    unsafe { (*slot.element.get()).write(T::default()) };
                    return Handle::pack(new_version, pos);
                }
            }
            tries += 1;
            check!(
                tries < self.capacity as u64 * self.capacity as u64,
                "handle pool exhausted after {tries} attempts; size the pool for peak liveness"
            );
        }
    }
}

impl<T> HandlePool<T> {
    #[inline(always)]
    fn slot(&self, index: usize) -> &Slot<T> {
        check!(
            index < self.capacity as usize,
            "slot index {index} out of range (capacity {})",
            self.capacity
        );
        // SAFETY: Index checked above; slots were initialized in `new`.
        unsafe { &*self.slots.get(index) }
    }

    /// Attempts to take an additional reference on the slot `hnd` points at.
    ///
    /// Returns `false` for the empty handle, for a stale version, and for a
    /// slot that is free or mid-finalization. A `true` return must be paired
    /// with exactly one [`HandlePool::unref`].
    pub fn try_ref(&self, hnd: Handle) -> bool {
        if hnd.is_empty() {
            return false;
        }
        let slot = self.slot(hnd.index());
        loop {
            let state = slot.state.load(Ordering::Acquire);
            if state & VERSION_MASK != hnd.raw() & VERSION_MASK || state & COUNT_MASK < 2 {
                return false;
            }
            check!(
                state & COUNT_MASK < COUNT_MASK,
                "reference count saturated on {hnd:?}"
            );
            if slot
                .state
                .compare_exchange(state, state + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Releases one reference. The thread that moves the count from 2 to 1
    /// destroys the element and frees the slot.
    ///
    /// # Panics
    ///
    /// Panics on a stale version or a count of 1 or less; either indicates a
    /// double unref or a use-after-free in the caller.
    pub fn unref(&self, hnd: Handle) {
        self.release(hnd, |_| {});
    }

    /// Like [`HandlePool::unref`], but `f` runs with a mutable reference to
    /// the element immediately before destruction, only on the
    /// last-reference transition.
    pub fn unref_with<F>(&self, hnd: Handle, f: F)
    where
        F: FnOnce(&mut T),
    {
        self.release(hnd, f);
    }

    fn release<F>(&self, hnd: Handle, f: F)
    where
        F: FnOnce(&mut T),
    {
        let slot = self.slot(hnd.index());
        loop {
            let state = slot.state.load(Ordering::Acquire);
            check!(
                state & VERSION_MASK == hnd.raw() & VERSION_MASK,
                "unref of stale {hnd:?} (slot state {state:#010x})"
            );
            check!(
                state & COUNT_MASK > 1,
                "unref of {hnd:?} without an outstanding reference (slot state {state:#010x})"
            );
            let next = state - 1;
            if slot
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if next & COUNT_MASK == 1 {
                    // We hold the finalizing marker: `try_ref` refuses a count
                    // of 1, so the element cannot be revived under us.
                    //
                    // SAFETY: The slot was live, so the element is
                    // initialized, and the marker gives us exclusive access.
                    let element = unsafe { (*slot.element.get()).assume_init_mut() };
                    f(element);
                    // SAFETY: As above; the element is dropped exactly once.
                    unsafe { (*slot.element.get()).assume_init_drop() };
                    // Free the slot but keep the version bits, so handles to
                    // the previous occupant stay stale forever.
                    slot.state.store(next & VERSION_MASK, Ordering::Release);
                }
                return;
            }
        }
    }

    /// The current reference count, or 0 if the handle is empty or stale.
    pub fn ref_count(&self, hnd: Handle) -> u32 {
        if hnd.is_empty() {
            return 0;
        }
        let state = self.slot(hnd.index()).state.load(Ordering::Acquire);
        if state & VERSION_MASK != hnd.raw() & VERSION_MASK {
            return 0;
        }
        state & COUNT_MASK
    }

    /// Returns a reference to the element `hnd` points at.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference on the slot (from
    /// [`HandlePool::acquire_and_ref`] or a `true` [`HandlePool::try_ref`])
    /// for the whole lifetime of the returned borrow.
    #[inline(always)]
    pub unsafe fn get(&self, hnd: Handle) -> &T {
        let slot = self.slot(hnd.index());
        // SAFETY: A held reference implies the slot is live and its element
        // initialized; the finalizer cannot run while the reference is held.
        unsafe { (*slot.element.get()).assume_init_ref() }
    }

    /// The number of slots in the pool.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Debug introspection of a slot position: the handle it would answer to,
    /// its reference count, and its version.
    pub fn info(&self, index: u32) -> (Handle, u32, u32) {
        let state = self.slot(index as usize).state.load(Ordering::Acquire);
        let hnd = Handle((state & VERSION_MASK) | (index & INDEX_MASK));
        (hnd, state & COUNT_MASK, state >> VERSION_SHIFT)
    }
}

impl<T> Drop for HandlePool<T> {
    fn drop(&mut self) {
        // Anything still referenced at teardown (e.g. leaked user holds) is
        // dropped here; all outstanding handles are invalid past this point.
        for index in 0..self.capacity as usize {
            let slot = self.slot(index);
            if slot.state.load(Ordering::Acquire) & COUNT_MASK != 0 {
                // SAFETY: `&mut self` means no other thread can be touching
                // the pool; a non-zero count implies an initialized element.
                unsafe { (*slot.element.get()).assume_init_drop() };
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn pool(capacity: u32) -> HandlePool<u64> {
        HandlePool::new(capacity, MemCallbacks::default())
    }

    #[test]
    fn acquire_starts_with_two_references() {
        let pool = pool(4);
        let hnd = pool.acquire_and_ref();
        assert!(!hnd.is_empty());
        assert_ne!(hnd.version(), 0);
        assert_eq!(pool.ref_count(hnd), 2);
        pool.unref(hnd);
        assert_eq!(pool.ref_count(hnd), 0);
    }

    #[test]
    fn try_ref_tracks_liveness() {
        let pool = pool(4);
        let hnd = pool.acquire_and_ref();
        assert!(pool.try_ref(hnd));
        assert_eq!(pool.ref_count(hnd), 3);
        pool.unref(hnd);
        pool.unref(hnd);
        assert!(!pool.try_ref(hnd));
        assert!(!pool.try_ref(Handle::EMPTY));
    }

    #[test]
    fn finalizer_sees_element_exactly_once() {
        let pool: HandlePool<Cell<u64>> = HandlePool::new(2, MemCallbacks::default());
        let hnd = pool.acquire_and_ref();
        // SAFETY: We hold the owner reference.
        unsafe { pool.get(hnd) }.set(77);
        let mut seen = false;
        assert!(pool.try_ref(hnd));
        pool.unref_with(hnd, |_| unreachable!("not the last reference"));
        assert!(!seen);
        pool.unref_with(hnd, |element| {
            assert_eq!(element.get(), 77);
            seen = true;
        });
        assert!(seen);
    }

    #[test]
    fn stale_handles_fail_after_reuse() {
        let pool = pool(1);
        let first = pool.acquire_and_ref();
        pool.unref(first);
        let second = pool.acquire_and_ref();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(!pool.try_ref(first));
        assert_eq!(pool.ref_count(first), 0);
        assert!(pool.try_ref(second));
        pool.unref(second);
        pool.unref(second);
    }

    #[test]
    fn version_wraps_past_4095_skipping_zero() {
        let pool = pool(1);
        let mut versions = Vec::with_capacity(4096);
        for _ in 0..4096 {
            let hnd = pool.acquire_and_ref();
            versions.push(hnd.version());
            pool.unref(hnd);
        }
        assert_eq!(versions[0], 1);
        assert_eq!(versions[4094], 4095);
        // The wrap skips version 0, so the 4096th round collides with none of
        // the in-between versions and lands back on 1.
        assert_eq!(versions[4095], 1);
        assert!(versions.iter().all(|&v| v != 0));
    }

    #[test]
    fn info_reports_live_slots() {
        let pool = pool(4);
        let hnd = pool.acquire_and_ref();
        let (reported, count, version) = pool.info(hnd.index() as u32);
        assert_eq!(reported, hnd);
        assert_eq!(count, 2);
        assert_eq!(version, hnd.version());
        pool.unref(hnd);
        let (_, count, _) = pool.info(hnd.index() as u32);
        assert_eq!(count, 0);
    }

    #[cfg(feature = "checks")]
    #[test]
    #[should_panic(expected = "exhausted")]
    fn exhaustion_panics() {
        let pool = pool(2);
        let _a = pool.acquire_and_ref();
        let _b = pool.acquire_and_ref();
        let _c = pool.acquire_and_ref();
    }

    #[cfg(feature = "checks")]
    #[test]
    #[should_panic(expected = "unref")]
    fn double_unref_panics() {
        let pool = pool(2);
        let hnd = pool.acquire_and_ref();
        pool.unref(hnd);
        pool.unref(hnd);
    }

    #[test]
    fn concurrent_churn_leaves_pool_empty() {
        let pool = Arc::new(pool(64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let hnd = pool.acquire_and_ref();
                    assert!(pool.try_ref(hnd));
                    pool.unref(hnd);
                    pool.unref(hnd);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for index in 0..pool.capacity() {
            let (_, count, _) = pool.info(index);
            assert_eq!(count, 0);
        }
    }
}
