//! Task and counter records, and the protocol relating them.
//!
//! A [`SyncPoint`] names a counter; a counter tracks one outstanding group of
//! work: every task that will decrement it on completion, every manual
//! increment, and at most one blocked waiter. Tasks waiting on a predecessor
//! counter form an intrusive singly-linked stack threaded through the task
//! records themselves (`next_sibling`), so attaching is one CAS and draining
//! releases in LIFO order.
//!
//! Counter reference-count bookkeeping, building on the pool's owner+sentinel
//! convention:
//!
//! - each unfinished task targeting the counter holds one reference (the
//!   first task holds the allocation's owner reference, later tasks take
//!   their own),
//! - the whole group of manual increments holds one reference (retained by
//!   the first `increment_sync`), with the actual tally in `user_count`,
//! - a `wait_for` caller holds one reference only while installing its
//!   signal.
//!
//! When the count falls back to the sentinel, the finalizer drains the
//! wait-list and fires the waiter. [`TaskGraph::unref_counter`] is the one
//! routine that releases counter references; it is parameterized over what
//! "releasing a task" means so the threaded backend (push to the ready
//! queue, wake a worker) and the single-threaded backend (execute inline)
//! share the protocol.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::job::Job;
use crate::mem::MemCallbacks;
use crate::pool::{Handle, HandlePool};
use crate::signal::Signal;

// -----------------------------------------------------------------------------
// Sync points

/// An opaque token identifying one outstanding group of work.
///
/// A default-constructed sync point is empty. The first submission that
/// targets it seeds a counter and writes the counter's handle back; passing
/// the same sync point to later submissions attaches them to the same group.
/// A sync point whose group has completed behaves exactly like an empty one.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SyncPoint {
    pub(crate) handle: Handle,
}

impl SyncPoint {
    /// Creates an empty sync point.
    pub fn new() -> SyncPoint {
        SyncPoint::default()
    }

    /// Whether this sync point has never been attached to a counter.
    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }
}

// -----------------------------------------------------------------------------
// Records

/// A scheduler-owned record wrapping a job, the counter it decrements on
/// completion, and its link in a predecessor's wait-list.
pub(crate) struct Task<J> {
    job: UnsafeCell<Option<J>>,
    counter_id: Cell<Handle>,
    next_sibling: AtomicU32,
}

impl<J> Default for Task<J> {
    fn default() -> Task<J> {
        Task {
            job: UnsafeCell::new(None),
            counter_id: Cell::new(Handle::EMPTY),
            next_sibling: AtomicU32::new(0),
        }
    }
}

// SAFETY: The non-atomic fields follow a publication protocol: they are
// written by the submitting thread strictly before the task handle is
// published (queue push or wait-list CAS), and the job is taken exactly once
// by the single thread that popped or drained the handle.
unsafe impl<J: Send> Sync for Task<J> {}

impl<J> Task<J> {
    /// Takes the stored job out of the record.
    ///
    /// # Safety
    ///
    /// The caller must be the thread executing this task; only one thread may
    /// ever take a given task's job.
    pub(crate) unsafe fn take_job(&self) -> Option<J> {
        // SAFETY: Exclusive by the calling contract.
        unsafe { (*self.job.get()).take() }
    }

    pub(crate) fn counter_id(&self) -> Handle {
        self.counter_id.get()
    }
}

/// The shared record behind a [`SyncPoint`].
#[derive(Default)]
pub(crate) struct Counter {
    /// Head of the wait-list of tasks released when this counter finishes.
    pub(crate) wait_list: AtomicU32,
    /// Tally of manual `increment_sync` calls not yet decremented.
    pub(crate) user_count: AtomicU32,
    /// The one blocked `wait_for` caller, if any.
    pub(crate) waiter: AtomicPtr<Signal>,
}

// -----------------------------------------------------------------------------
// Graph

/// The task and counter pools plus the operations relating them. Both
/// scheduler backends embed one of these.
pub(crate) struct TaskGraph<J> {
    pub(crate) tasks: HandlePool<Task<J>>,
    pub(crate) counters: HandlePool<Counter>,
}

impl<J: Job> TaskGraph<J> {
    pub fn new(capacity: u32, mem: MemCallbacks) -> TaskGraph<J> {
        TaskGraph {
            tasks: HandlePool::new(capacity, mem),
            counters: HandlePool::new(capacity, mem),
        }
    }

    /// Allocates a fresh counter. The default-constructed record is already
    /// in its zeroed state (no wait-list, no user count, no waiter).
    pub fn create_counter(&self) -> Handle {
        self.counters.acquire_and_ref()
    }

    /// Allocates a task record holding `job`. If `sync` is given, the task is
    /// tied to its counter: an existing live counter is re-referenced, an
    /// empty or stale handle is replaced by a fresh counter. Either way the
    /// reference taken here is the one the task releases when it retires, and
    /// the counter handle is published into `sync` only once it is live.
    pub fn create_task(&self, job: J, sync: Option<&mut SyncPoint>) -> Handle {
        let hnd = self.tasks.acquire_and_ref();
        // SAFETY: Freshly acquired and not yet published; we are the only
        // thread that can touch this record.
        let task = unsafe { self.tasks.get(hnd) };
        // SAFETY: As above.
        unsafe { *task.job.get() = Some(job) };
        task.counter_id.set(Handle::EMPTY);
        task.next_sibling.store(0, Ordering::Relaxed);
        if let Some(sync) = sync {
            if !self.counters.try_ref(sync.handle) {
                sync.handle = self.create_counter();
            }
            task.counter_id.set(sync.handle);
        }
        hnd
    }

    /// Prepends `task` to the wait-list of `counter`. The caller must hold a
    /// reference on `counter` and must not yet have published `task`
    /// anywhere else.
    ///
    /// Lists release LIFO: the drain walks from the head, so the most
    /// recently attached task runs first.
    pub fn attach_to(&self, counter: Handle, task: Handle) {
        // SAFETY: The caller holds references on both records.
        let counter = unsafe { self.counters.get(counter) };
        let task_record = unsafe { self.tasks.get(task) };
        loop {
            let head = counter.wait_list.load(Ordering::Acquire);
            task_record.next_sibling.store(head, Ordering::Release);
            if counter
                .wait_list
                .compare_exchange(head, task.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Manually raises the pending count of `sync`, seeding a counter if the
    /// handle is empty or stale. The reference retained by the seeding call
    /// is the hold for the entire user-count group; later increments only
    /// bump the tally.
    pub fn increment_sync<F>(&self, sync: &mut SyncPoint, release: &F)
    where
        F: Fn(Handle),
    {
        let fresh = !self.counters.try_ref(sync.handle);
        if fresh {
            sync.handle = self.create_counter();
        }
        // SAFETY: We hold a reference either way (owner if fresh, try_ref
        // otherwise).
        let counter = unsafe { self.counters.get(sync.handle) };
        counter.user_count.fetch_add(1, Ordering::AcqRel);
        if !fresh {
            self.unref_counter(sync.handle, release);
        }
    }

    /// Undoes one `increment_sync`. When this was the last outstanding
    /// increment, the group hold retained by the seeding increment is
    /// released as well, so the pairing leaks nothing.
    pub fn decrement_sync<F>(&self, sync: SyncPoint, release: &F)
    where
        F: Fn(Handle),
    {
        if !self.counters.try_ref(sync.handle) {
            return;
        }
        // SAFETY: Reference taken just above.
        let counter = unsafe { self.counters.get(sync.handle) };
        let prev = counter.user_count.fetch_sub(1, Ordering::AcqRel);
        check!(
            prev != 0,
            "decrement_sync without a matching increment_sync on {:?}",
            sync.handle
        );
        if prev == 1 {
            self.unref_counter(sync.handle, release);
        }
        self.unref_counter(sync.handle, release);
    }

    /// Releases one net reference on `hnd`. The thread whose release is the
    /// last one runs the finalizer: drain the wait-list head-first, handing
    /// each task to `release`, then fire the installed waiter if any.
    ///
    /// `release` receives each drained task while the walk still holds a
    /// reference on it; it must arrange for the task's owner reference to be
    /// consumed eventually (the threaded backend defers that to the worker
    /// that pops the handle, the single-threaded backend retires inline).
    pub fn unref_counter<F>(&self, hnd: Handle, release: &F)
    where
        F: Fn(Handle),
    {
        if !self.counters.try_ref(hnd) {
            return;
        }
        // The first unref pairs with the reference taken above and can never
        // finalize; the second is the caller's net release and runs the
        // finalizer when it lands on the sentinel.
        self.counters.unref(hnd);
        self.counters.unref_with(hnd, |counter| {
            let mut tid = Handle::from_raw(counter.wait_list.load(Ordering::Acquire));
            while self.tasks.try_ref(tid) {
                // SAFETY: Reference taken by the loop condition.
                let task = unsafe { self.tasks.get(tid) };
                let next = Handle::from_raw(task.next_sibling.swap(0, Ordering::AcqRel));
                release(tid);
                self.tasks.unref(tid);
                tid = next;
            }
            let waiter = counter.waiter.swap(ptr::null_mut(), Ordering::AcqRel);
            if !waiter.is_null() {
                // SAFETY: The waiting thread keeps its signal alive until it
                // observes the fire, and only one finalizer ever runs.
                unsafe { Signal::signal(waiter) };
            }
        });
    }

    /// The raw reference count of the counter behind `sync`; 0 means the
    /// group is complete (or the sync point is empty or stale).
    pub fn pending_count(&self, sync: SyncPoint) -> u32 {
        self.counters.ref_count(sync.handle)
    }

    /// True when no slot in either pool is occupied.
    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        let live = |pool_info: (Handle, u32, u32)| pool_info.1 != 0;
        !(0..self.tasks.capacity()).any(|i| live(self.tasks.info(i)))
            && !(0..self.counters.capacity()).any(|i| live(self.counters.info(i)))
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::job::JobFn;

    fn graph() -> TaskGraph<JobFn> {
        TaskGraph::new(32, MemCallbacks::default())
    }

    fn noop_release() -> impl Fn(Handle) {
        |_| {}
    }

    #[test]
    fn create_task_seeds_counter_once() {
        let graph = graph();
        let mut sync = SyncPoint::new();
        let a = graph.create_task(JobFn::new(|| {}), Some(&mut sync));
        assert!(!sync.is_empty());
        let first = sync;
        let b = graph.create_task(JobFn::new(|| {}), Some(&mut sync));
        assert_eq!(first, sync);
        // Sentinel + owner + second task's hold.
        assert_eq!(graph.pending_count(sync), 3);
        graph.tasks.unref(a);
        graph.tasks.unref(b);
        let release = noop_release();
        graph.unref_counter(sync.handle, &release);
        graph.unref_counter(sync.handle, &release);
        assert_eq!(graph.pending_count(sync), 0);
    }

    #[test]
    fn increment_decrement_round_trip_frees_counter() {
        let graph = graph();
        let release = noop_release();
        let mut sync = SyncPoint::new();
        graph.increment_sync(&mut sync, &release);
        assert_eq!(graph.pending_count(sync), 2);
        graph.increment_sync(&mut sync, &release);
        assert_eq!(graph.pending_count(sync), 2);
        graph.decrement_sync(sync, &release);
        assert_eq!(graph.pending_count(sync), 2);
        graph.decrement_sync(sync, &release);
        assert_eq!(graph.pending_count(sync), 0);
        assert!(graph.is_idle());
    }

    #[test]
    fn drain_releases_lifo_and_fires_tasks() {
        let graph = graph();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut gate = SyncPoint::new();
        let release = noop_release();
        graph.increment_sync(&mut gate, &release);

        let mut attached = Vec::new();
        for i in 0..3 {
            let order = std::sync::Arc::clone(&order);
            let task = graph.create_task(JobFn::new(move || order.lock().unwrap().push(i)), None);
            assert!(graph.counters.try_ref(gate.handle));
            graph.attach_to(gate.handle, task);
            let release = noop_release();
            graph.unref_counter(gate.handle, &release);
            attached.push(task);
        }

        let drained = std::cell::RefCell::new(Vec::new());
        let release = |tid: Handle| {
            drained.borrow_mut().push(tid);
            // SAFETY: The drain walk holds a reference on `tid`.
            let task = unsafe { graph.tasks.get(tid) };
            let job = unsafe { task.take_job() }.unwrap();
            job.execute();
            graph.tasks.unref(tid);
        };
        graph.decrement_sync(gate, &release);

        assert_eq!(drained.borrow().as_slice(), [attached[2], attached[1], attached[0]]);
        assert_eq!(order.lock().unwrap().as_slice(), [2, 1, 0]);
        assert!(graph.is_idle());
    }

    #[test]
    fn waiter_fires_on_completion() {
        let graph = graph();
        let fired = AtomicU32::new(0);
        let release = noop_release();
        let mut sync = SyncPoint::new();
        graph.increment_sync(&mut sync, &release);

        let signal = Signal::new();
        assert!(graph.counters.try_ref(sync.handle));
        // SAFETY: Reference held.
        let counter = unsafe { graph.counters.get(sync.handle) };
        counter
            .waiter
            .store(&signal as *const Signal as *mut Signal, Ordering::Release);
        graph.unref_counter(sync.handle, &release);

        assert_eq!(fired.load(Ordering::Relaxed), 0);
        graph.decrement_sync(sync, &release);
        // The finalizer fired the signal; wait returns without blocking.
        signal.wait();
        fired.fetch_add(1, Ordering::Relaxed);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }
}
