//! The multi-threaded scheduler: public facade, worker pool, and wake-up.
//!
//! The scheduler owns a fixed set of OS worker threads, but how many of them
//! execute work at once is governed separately by `max_running_threads`.
//! Spare threads exist so that when a running thread blocks on something
//! outside the scheduler (see [`crate::current_thread_sleeps`]) another can
//! be woken to keep the cores busy, without oversubscribing them under
//! normal load.
//!
//! Workers park on stack-allocated one-shot [`Signal`]s published through
//! per-worker wake slots; waking a thread is claiming its slot with a swap
//! and firing the signal. There are no condition variables and no central
//! sleep lock.

use core::num::NonZero;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use core::time::Duration;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::thread;

use tracing::{debug, trace};

use crate::job::{self, Job, JobFn};
use crate::mem::MemCallbacks;
use crate::pool::{self, Handle};
use crate::queue::ReadyQueue;
use crate::signal::Signal;
use crate::task::{SyncPoint, TaskGraph};
use crate::tls::{self, WorkerHook};

// -----------------------------------------------------------------------------
// Parameters

/// Scheduler configuration. Plain data; build one with struct-update syntax
/// over [`SchedulerParams::default`].
#[derive(Clone, Copy, Debug)]
pub struct SchedulerParams {
    /// Number of OS worker threads to create.
    pub num_threads: usize,
    /// Cap on simultaneously running workers. 0 means detected hardware
    /// concurrency.
    pub max_running_threads: usize,
    /// Capacity of the task pool, the counter pool, and the ready queue.
    /// Must not exceed 2^20; size for peak concurrent liveness.
    pub max_number_tasks: u32,
    /// How many empty polls a worker performs before parking.
    pub thread_num_tries_on_idle: u32,
    /// How long a worker rests between empty polls.
    pub thread_sleep_on_idle: Duration,
    /// Allocation callbacks for the pools and the ready queue.
    pub mem_callbacks: MemCallbacks,
}

impl Default for SchedulerParams {
    fn default() -> SchedulerParams {
        SchedulerParams {
            num_threads: 16,
            max_running_threads: 0,
            max_number_tasks: 1024,
            thread_num_tries_on_idle: 16,
            thread_sleep_on_idle: Duration::from_micros(5),
            mem_callbacks: MemCallbacks::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// Scheduler

/// The multi-threaded fork-join scheduler.
///
/// Submit work with [`Scheduler::run`] and [`Scheduler::run_after`] (or the
/// `run_job` variants for a custom job type `J`), group it through
/// [`SyncPoint`]s, and block on a group with [`Scheduler::wait_for`].
///
/// ```no_run
/// use attacca::{Scheduler, SchedulerParams, SyncPoint};
///
/// let mut scheduler = Scheduler::new();
/// scheduler.init(SchedulerParams::default());
///
/// let mut done = SyncPoint::new();
/// for i in 0..8 {
///     scheduler.run(move || println!("job {i}"), Some(&mut done));
/// }
/// scheduler.wait_for(done);
/// scheduler.stop();
/// ```
pub struct Scheduler<J: Job = JobFn> {
    core: Option<Arc<Core<J>>>,
    threads: Vec<thread::JoinHandle<()>>,
    params: SchedulerParams,
}

struct WorkerSlot {
    /// Published by the owning worker when it parks; claimed (swapped to
    /// null) by whoever wakes it.
    wake: AtomicPtr<Signal>,
}

struct Core<J: Job> {
    graph: TaskGraph<J>,
    ready: ReadyQueue,
    workers: Box<[WorkerSlot]>,
    /// Threads currently eligible to run work.
    active_threads: AtomicU32,
    /// Threads that have not yet returned from their main loop.
    live_workers: AtomicU32,
    running: AtomicBool,
    max_running_threads: u32,
    tries_on_idle: u32,
    sleep_on_idle: Duration,
}

impl<J: Job> Scheduler<J> {
    /// Creates a stopped scheduler. Call [`Scheduler::init`] before
    /// submitting work.
    pub fn new() -> Scheduler<J> {
        Scheduler {
            core: None,
            threads: Vec::new(),
            params: SchedulerParams::default(),
        }
    }

    /// Starts the scheduler: sizes the pools, spawns the workers. A running
    /// scheduler is stopped first, so `init` can also be used to resize.
    pub fn init(&mut self, params: SchedulerParams) {
        self.stop();
        check!(params.num_threads > 0, "scheduler needs at least one worker");
        check!(
            params.max_number_tasks > 0
                && (params.max_number_tasks as usize) <= pool::MAX_CAPACITY,
            "max_number_tasks {} outside 1..=2^20",
            params.max_number_tasks
        );
        let mut params = params;
        if params.max_running_threads == 0 {
            params.max_running_threads = thread::available_parallelism()
                .map(NonZero::get)
                .unwrap_or(1);
        }
        debug!(
            num_threads = params.num_threads,
            max_running_threads = params.max_running_threads,
            max_number_tasks = params.max_number_tasks,
            "starting scheduler"
        );

        let core = Arc::new(Core {
            graph: TaskGraph::new(params.max_number_tasks, params.mem_callbacks),
            ready: ReadyQueue::new(params.max_number_tasks, params.mem_callbacks),
            workers: (0..params.num_threads)
                .map(|_| WorkerSlot {
                    wake: AtomicPtr::new(ptr::null_mut()),
                })
                .collect(),
            active_threads: AtomicU32::new(0),
            live_workers: AtomicU32::new(params.num_threads as u32),
            running: AtomicBool::new(true),
            max_running_threads: params.max_running_threads as u32,
            tries_on_idle: params.thread_num_tries_on_idle.max(1),
            sleep_on_idle: params.thread_sleep_on_idle,
        });

        for index in 0..params.num_threads {
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name(format!("Worker-{index}"))
                .spawn(move || worker_main(core, index))
                .expect("failed to spawn worker thread");
            self.threads.push(handle);
        }

        self.core = Some(core);
        self.params = params;
    }

    /// Stops the scheduler: signals every worker, wakes the parked ones,
    /// joins them all, and frees the pools and the queue. Work still queued
    /// or attached to counters is discarded. The instance may be
    /// re-initialized afterwards.
    pub fn stop(&mut self) {
        let Some(core) = self.core.take() else {
            return;
        };
        debug!("stopping scheduler");
        core.running.store(false, Ordering::Release);
        // A worker can publish its wake slot at any moment before it notices
        // the stop flag, so keep sweeping until every loop has exited.
        while core.live_workers.load(Ordering::Acquire) != 0 {
            core.wake_threads(u32::MAX);
            thread::yield_now();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        check!(
            core.active_threads.load(Ordering::Acquire) == 0,
            "active-thread accounting out of balance at shutdown: {}",
            core.active_threads.load(Ordering::Acquire)
        );
        debug!("scheduler stopped");
        // Dropping the core returns the pool slabs and the queue ring to the
        // memory callbacks.
    }

    #[inline(always)]
    fn core(&self) -> &Core<J> {
        match &self.core {
            Some(core) => core,
            None => fatal!("scheduler is not running; call init first"),
        }
    }

    /// Submits `job` to run as soon as a worker picks it up. If `sync` is
    /// given, the job is tracked by that sync point's counter (seeding one if
    /// the sync point is empty or stale).
    pub fn run_job(&self, job: J, sync: Option<&mut SyncPoint>) {
        let core = self.core();
        let task = core.graph.create_task(job, sync);
        core.ready.push(task);
        core.wake_up_one_thread();
    }

    /// Submits `job` to run only after the group named by `after` has
    /// completed. A stale or empty `after` behaves like [`Scheduler::run_job`].
    ///
    /// Tasks attached behind the same predecessor release in LIFO order.
    pub fn run_job_after(&self, after: SyncPoint, job: J, sync: Option<&mut SyncPoint>) {
        let core = self.core();
        let task = core.graph.create_task(job, sync);
        if core.graph.counters.try_ref(after.handle) {
            core.graph.attach_to(after.handle, task);
            core.unref_counter(after.handle);
        } else {
            // The predecessor already fired and drained.
            core.ready.push(task);
            core.wake_up_one_thread();
        }
    }

    /// Blocks the calling thread until the group named by `sync` completes.
    /// Returns immediately for an empty, stale, or finished sync point.
    ///
    /// At most one thread may wait on a given sync point; installing a second
    /// waiter is a contract violation.
    pub fn wait_for(&self, sync: SyncPoint) {
        let core = self.core();
        if !core.graph.counters.try_ref(sync.handle) {
            return;
        }
        let signal = Signal::new();
        // SAFETY: The reference taken above keeps the counter alive.
        let counter = unsafe { core.graph.counters.get(sync.handle) };
        let installed = counter
            .waiter
            .compare_exchange(
                ptr::null_mut(),
                &signal as *const Signal as *mut Signal,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        check!(
            installed,
            "sync point {:?} already has a waiter; only one thread may wait per sync",
            sync.handle
        );
        // Hand our reference back; if we were the last holder this fires the
        // signal inline and the wait below returns immediately.
        core.unref_counter(sync.handle);
        tls::current_thread_sleeps();
        signal.wait();
        tls::current_thread_wakes_up();
    }

    /// Manually raises the pending count of `sync`. The group will not
    /// complete until a matching [`Scheduler::decrement_sync`] arrives; an
    /// increment without its decrement leaks the counter slot.
    pub fn increment_sync(&self, sync: &mut SyncPoint) {
        let core = self.core();
        core.graph
            .increment_sync(sync, &|task| core.make_ready(task));
    }

    /// Undoes one [`Scheduler::increment_sync`]. A no-op on an empty or stale
    /// sync point.
    pub fn decrement_sync(&self, sync: SyncPoint) {
        let core = self.core();
        core.graph
            .decrement_sync(sync, &|task| core.make_ready(task));
    }

    /// The raw reference count of the counter behind `sync`: 0 once the
    /// group has completed (or for an empty or stale sync point, or on a
    /// stopped scheduler).
    pub fn pending_count(&self, sync: SyncPoint) -> u32 {
        match &self.core {
            Some(core) => core.graph.pending_count(sync),
            None => 0,
        }
    }

    /// Whether the group named by `sync` has completed.
    pub fn has_finished(&self, sync: SyncPoint) -> bool {
        self.pending_count(sync) == 0
    }

    /// The number of workers currently eligible to run work.
    pub fn active_threads(&self) -> u32 {
        match &self.core {
            Some(core) => core.active_threads.load(Ordering::Acquire),
            None => 0,
        }
    }

    /// The parameters of the last `init`, with `max_running_threads`
    /// resolved.
    pub fn params(&self) -> &SchedulerParams {
        &self.params
    }

    /// Renders a human-readable dump of the workers, the ready queue, and the
    /// live pool slots. For post-mortem poking, not for parsing.
    pub fn debug_status(&self) -> String {
        let mut out = String::new();
        let Some(core) = &self.core else {
            out.push_str("scheduler: stopped\n");
            return out;
        };
        let _ = writeln!(
            out,
            "active threads: {}/{}",
            core.active_threads.load(Ordering::Acquire),
            core.max_running_threads
        );
        out.push_str("workers: ");
        for slot in &core.workers {
            let parked = !slot.wake.load(Ordering::Acquire).is_null();
            out.push(if parked { '.' } else { '*' });
        }
        out.push('\n');
        let _ = write!(out, "ready:");
        for hnd in core.ready.snapshot() {
            let _ = write!(out, " {hnd:?}");
        }
        out.push('\n');
        let _ = write!(out, "tasks:");
        for index in 0..core.graph.tasks.capacity() {
            let (hnd, count, _) = core.graph.tasks.info(index);
            if count > 0 {
                let _ = write!(out, " {hnd:?}x{count}");
            }
        }
        out.push('\n');
        let _ = write!(out, "counters:");
        for index in 0..core.graph.counters.capacity() {
            let (hnd, count, _) = core.graph.counters.info(index);
            if count > 0 {
                let _ = write!(out, " {hnd:?}x{count}");
            }
        }
        out.push('\n');
        out
    }
}

impl Scheduler {
    /// Closure-taking convenience for [`Scheduler::run_job`] on the default
    /// job representation.
    #[inline]
    pub fn run<F>(&self, f: F, sync: Option<&mut SyncPoint>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_job(JobFn::new(f), sync);
    }

    /// Closure-taking convenience for [`Scheduler::run_job_after`].
    #[inline]
    pub fn run_after<F>(&self, after: SyncPoint, f: F, sync: Option<&mut SyncPoint>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_job_after(after, JobFn::new(f), sync);
    }
}

impl<J: Job> Default for Scheduler<J> {
    fn default() -> Scheduler<J> {
        Scheduler::new()
    }
}

impl<J: Job> Drop for Scheduler<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

// -----------------------------------------------------------------------------
// Core

impl<J: Job> Core<J> {
    /// Queues a released task and wakes a worker for it.
    fn make_ready(&self, task: Handle) {
        self.ready.push(task);
        self.wake_up_one_thread();
    }

    fn unref_counter(&self, hnd: Handle) {
        self.graph.unref_counter(hnd, &|task| self.make_ready(task));
    }

    /// Wakes at most one parked worker, unless the active count already
    /// meets the running cap. A single pass suffices: a worker that was
    /// between its emptiness check and its park re-validates the queue
    /// itself (see `worker_main`).
    fn wake_up_one_thread(&self) {
        if self.active_threads.load(Ordering::Acquire) >= self.max_running_threads {
            return;
        }
        self.wake_threads(1);
    }

    /// Claims and signals up to `max` published wake slots. Returns how many
    /// workers were woken.
    fn wake_threads(&self, max: u32) -> u32 {
        let mut woken = 0;
        for slot in &self.workers {
            if woken == max {
                break;
            }
            let signal = slot.wake.swap(ptr::null_mut(), Ordering::AcqRel);
            if signal.is_null() {
                continue;
            }
            // Count the thread as active before it actually resumes, so
            // concurrent wake calls don't all see "under the cap" and
            // over-wake.
            self.active_threads.fetch_add(1, Ordering::AcqRel);
            // SAFETY: The worker keeps its signal alive until it observes
            // the fire, and claiming the slot made us the only signaler.
            unsafe { Signal::signal(signal) };
            woken += 1;
        }
        if woken > 0 {
            self.active_threads.fetch_sub(woken, Ordering::AcqRel);
        }
        woken
    }
}

impl<J: Job> WorkerHook for Core<J> {
    fn thread_sleeps(&self) {
        if self.running.load(Ordering::Acquire) {
            self.active_threads.fetch_sub(1, Ordering::AcqRel);
            self.wake_up_one_thread();
        }
    }

    fn thread_wakes(&self) {
        if self.running.load(Ordering::Acquire) {
            self.active_threads.fetch_add(1, Ordering::AcqRel);
        }
    }
}

// -----------------------------------------------------------------------------
// Worker loop

fn worker_main<J: Job>(core: Arc<Core<J>>, index: usize) {
    trace!(index, "worker starting");
    tls::set_current_thread_name(format!("Worker-{index}"));
    let core_dyn: Arc<dyn WorkerHook> = core.clone();
    let hook: Weak<dyn WorkerHook> = Arc::downgrade(&core_dyn);
    tls::install_worker_hook(hook);

    core.active_threads.fetch_add(1, Ordering::AcqRel);
    loop {
        // Stand down. The previous value tells us where we sat relative to
        // the running cap.
        let prev_active = core.active_threads.fetch_sub(1, Ordering::AcqRel);
        if !core.running.load(Ordering::Acquire) {
            break;
        }
        if core.ready.len() == 0 || prev_active > core.max_running_threads {
            let signal = Signal::new();
            let slot = &core.workers[index];
            slot.wake
                .store(&signal as *const Signal as *mut Signal, Ordering::Release);
            // A task may have been pushed between the emptiness check above
            // and the publication of our slot, in which case the pusher's
            // wake pass can have missed us. Re-validate, and reclaim our own
            // slot instead of parking if there is work we are allowed to run.
            let reclaimed = core.running.load(Ordering::Acquire)
                && core.ready.len() != 0
                && core.active_threads.load(Ordering::Acquire) < core.max_running_threads
                && !slot.wake.swap(ptr::null_mut(), Ordering::AcqRel).is_null();
            if !reclaimed {
                signal.wait();
            }
            if !core.running.load(Ordering::Acquire) {
                break;
            }
        }
        core.active_threads.fetch_add(1, Ordering::AcqRel);
        core.workers[index].wake.store(ptr::null_mut(), Ordering::Release);

        // Work until the queue stays empty for a full retry budget.
        let mut tries = core.tries_on_idle;
        while tries > 0 && core.running.load(Ordering::Acquire) {
            let Some(task_hnd) = core.ready.pop() else {
                tries -= 1;
                if !core.sleep_on_idle.is_zero() {
                    thread::sleep(core.sleep_on_idle);
                }
                continue;
            };
            tries = core.tries_on_idle;

            // SAFETY: The ready queue transferred the task's owning
            // reference to us; nobody else executes this task.
            let task = unsafe { core.graph.tasks.get(task_hnd) };
            // SAFETY: As above; we are the executing thread.
            let Some(taken) = (unsafe { task.take_job() }) else {
                fatal!("task {task_hnd:?} popped without a job");
            };
            let counter = task.counter_id();
            job::run_job(taken);
            core.graph.tasks.unref(task_hnd);
            core.unref_counter(counter);
        }
    }

    tls::clear_worker_hook();
    trace!(index, "worker exiting");
    core.live_workers.fetch_sub(1, Ordering::AcqRel);
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn small_params() -> SchedulerParams {
        SchedulerParams {
            num_threads: 4,
            max_number_tasks: 128,
            ..SchedulerParams::default()
        }
    }

    #[test]
    fn run_and_wait_round_trip() {
        let mut scheduler = Scheduler::new();
        scheduler.init(small_params());

        let hits = Arc::new(AtomicU32::new(0));
        let mut sync = SyncPoint::new();
        for _ in 0..32 {
            let hits = Arc::clone(&hits);
            scheduler.run(
                move || {
                    hits.fetch_add(1, Ordering::Relaxed);
                },
                Some(&mut sync),
            );
        }
        scheduler.wait_for(sync);
        assert_eq!(hits.load(Ordering::Relaxed), 32);
        assert!(scheduler.has_finished(sync));
        scheduler.stop();
    }

    #[test]
    fn empty_sync_point_is_finished() {
        let mut scheduler = Scheduler::<JobFn>::new();
        scheduler.init(small_params());
        assert!(scheduler.has_finished(SyncPoint::new()));
        assert_eq!(scheduler.pending_count(SyncPoint::new()), 0);
        scheduler.stop();
    }

    #[test]
    fn run_after_stale_predecessor_runs_immediately() {
        let mut scheduler = Scheduler::new();
        scheduler.init(small_params());

        let mut first = SyncPoint::new();
        scheduler.run(|| {}, Some(&mut first));
        scheduler.wait_for(first);
        assert!(scheduler.has_finished(first));

        let hits = Arc::new(AtomicU32::new(0));
        let mut second = SyncPoint::new();
        let inner = Arc::clone(&hits);
        scheduler.run_after(
            first,
            move || {
                inner.fetch_add(1, Ordering::Relaxed);
            },
            Some(&mut second),
        );
        scheduler.wait_for(second);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        scheduler.stop();
    }

    #[test]
    fn custom_job_type() {
        struct CountJob {
            hits: Arc<AtomicU32>,
        }

        impl Job for CountJob {
            fn execute(self) {
                self.hits.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut scheduler = Scheduler::<CountJob>::new();
        scheduler.init(small_params());
        let hits = Arc::new(AtomicU32::new(0));
        let mut sync = SyncPoint::new();
        for _ in 0..8 {
            scheduler.run_job(
                CountJob {
                    hits: Arc::clone(&hits),
                },
                Some(&mut sync),
            );
        }
        scheduler.wait_for(sync);
        assert_eq!(hits.load(Ordering::Relaxed), 8);
        scheduler.stop();
    }

    #[test]
    fn pending_count_is_zero_after_stop() {
        let mut scheduler = Scheduler::new();
        scheduler.init(small_params());
        let mut gate = SyncPoint::new();
        scheduler.increment_sync(&mut gate);
        let mut sync = SyncPoint::new();
        scheduler.run_after(gate, || {}, Some(&mut sync));
        assert_ne!(scheduler.pending_count(sync), 0);
        scheduler.stop();
        assert_eq!(scheduler.pending_count(sync), 0);
        assert_eq!(scheduler.pending_count(gate), 0);
    }

    #[test]
    fn stop_and_reinit() {
        let mut scheduler = Scheduler::new();
        scheduler.init(small_params());
        scheduler.stop();
        scheduler.init(small_params());
        let mut sync = SyncPoint::new();
        scheduler.run(|| {}, Some(&mut sync));
        scheduler.wait_for(sync);
        scheduler.stop();
    }

    #[test]
    fn debug_status_renders() {
        let mut scheduler = Scheduler::<JobFn>::new();
        assert!(scheduler.debug_status().contains("stopped"));
        scheduler.init(small_params());
        let status = scheduler.debug_status();
        assert!(status.contains("active threads"));
        assert!(status.contains("workers"));
        scheduler.stop();
    }
}
