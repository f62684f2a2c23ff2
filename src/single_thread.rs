//! A single-threaded backend with the same externally observable semantics.
//!
//! No workers, no ready queue: `run` executes the job inline, `run_after`
//! attaches the task to its predecessor's wait-list, and the counter
//! finalizer executes drained tasks inline, recursively. Completion ordering,
//! side effects, and counter decrement events match the threaded scheduler;
//! the one thing that cannot be offered is blocking, so [`wait_for`] on a
//! still-pending sync point is a contract violation, since there is no other
//! thread that could ever fire the signal.
//!
//! [`wait_for`]: SingleThreadScheduler::wait_for

use tracing::debug;

use crate::job::{self, Job, JobFn};
use crate::pool::{self, Handle};
use crate::task::{SyncPoint, TaskGraph};

use crate::mem::MemCallbacks;

// -----------------------------------------------------------------------------
// Parameters

/// Configuration for the single-threaded backend. The threading knobs of the
/// multi-threaded [`SchedulerParams`](crate::SchedulerParams) have no meaning
/// here, so only the pool sizing and allocation callbacks remain.
#[derive(Clone, Copy, Debug)]
pub struct SingleThreadParams {
    /// Capacity of the task and counter pools. Must not exceed 2^20.
    pub max_number_tasks: u32,
    /// Allocation callbacks for the pools.
    pub mem_callbacks: MemCallbacks,
}

impl Default for SingleThreadParams {
    fn default() -> SingleThreadParams {
        SingleThreadParams {
            max_number_tasks: 1024,
            mem_callbacks: MemCallbacks::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// Scheduler

/// The cooperative, single-threaded scheduler backend.
pub struct SingleThreadScheduler<J: Job = JobFn> {
    graph: Option<TaskGraph<J>>,
    params: SingleThreadParams,
}

impl<J: Job> SingleThreadScheduler<J> {
    /// Creates a stopped scheduler. Call
    /// [`SingleThreadScheduler::init`] before submitting work.
    pub fn new() -> SingleThreadScheduler<J> {
        SingleThreadScheduler {
            graph: None,
            params: SingleThreadParams::default(),
        }
    }

    /// Sizes and allocates the pools. A running instance is re-initialized.
    pub fn init(&mut self, params: SingleThreadParams) {
        self.stop();
        check!(
            params.max_number_tasks > 0
                && (params.max_number_tasks as usize) <= pool::MAX_CAPACITY,
            "max_number_tasks {} outside 1..=2^20",
            params.max_number_tasks
        );
        debug!(
            max_number_tasks = params.max_number_tasks,
            "starting single-threaded scheduler"
        );
        self.graph = Some(TaskGraph::new(
            params.max_number_tasks,
            params.mem_callbacks,
        ));
        self.params = params;
    }

    /// Frees the pools, discarding any tasks still gated behind counters.
    pub fn stop(&mut self) {
        if self.graph.take().is_some() {
            debug!("single-threaded scheduler stopped");
        }
    }

    #[inline(always)]
    fn graph(&self) -> &TaskGraph<J> {
        match &self.graph {
            Some(graph) => graph,
            None => fatal!("scheduler is not running; call init first"),
        }
    }

    /// Executes `job` inline. If `sync` names a live counter, its pending
    /// count drops by one exactly as a completed task would drop it; an
    /// empty sync point stays empty, since the group it would name is
    /// already complete when this returns.
    pub fn run_job(&self, job: J, sync: Option<&mut SyncPoint>) {
        let graph = self.graph();
        job::run_job(job);
        if let Some(sync) = sync {
            if graph.counters.try_ref(sync.handle) {
                self.unref_counter(sync.handle);
            }
        }
    }

    /// Defers `job` until the group named by `after` completes; with an
    /// empty or stale `after` the job executes inline immediately.
    pub fn run_job_after(&self, after: SyncPoint, job: J, sync: Option<&mut SyncPoint>) {
        let graph = self.graph();
        if graph.counters.try_ref(after.handle) {
            let task = graph.create_task(job, sync);
            graph.attach_to(after.handle, task);
            self.unref_counter(after.handle);
        } else {
            self.run_job(job, sync);
        }
    }

    /// Single-threaded mode cannot block: waiting on a still-pending sync
    /// point is a contract violation. An empty or stale sync point returns
    /// immediately, as on the threaded backend.
    pub fn wait_for(&self, sync: SyncPoint) {
        if cfg!(feature = "checks") && self.graph().counters.try_ref(sync.handle) {
            fatal!(
                "wait_for on pending sync point {:?} in single-threaded mode",
                sync.handle
            );
        }
    }

    /// See [`Scheduler::increment_sync`](crate::Scheduler::increment_sync).
    pub fn increment_sync(&self, sync: &mut SyncPoint) {
        self.graph()
            .increment_sync(sync, &|task| self.execute_released(task));
    }

    /// See [`Scheduler::decrement_sync`](crate::Scheduler::decrement_sync).
    /// Releasing the last hold drains the gated tasks inline, so this call
    /// returns only after they (and anything they transitively release)
    /// have run.
    pub fn decrement_sync(&self, sync: SyncPoint) {
        self.graph()
            .decrement_sync(sync, &|task| self.execute_released(task));
    }

    /// See [`Scheduler::pending_count`](crate::Scheduler::pending_count).
    pub fn pending_count(&self, sync: SyncPoint) -> u32 {
        match &self.graph {
            Some(graph) => graph.pending_count(sync),
            None => 0,
        }
    }

    /// Whether the group named by `sync` has completed.
    pub fn has_finished(&self, sync: SyncPoint) -> bool {
        self.pending_count(sync) == 0
    }

    /// The parameters of the last `init`.
    pub fn params(&self) -> &SingleThreadParams {
        &self.params
    }

    fn unref_counter(&self, hnd: Handle) {
        self.graph()
            .unref_counter(hnd, &|task| self.execute_released(task));
    }

    /// The inline counterpart of a worker picking a drained task off the
    /// ready queue: execute, retire the owner reference, then release the
    /// task's own counter, which may recursively drain further chains.
    fn execute_released(&self, task_hnd: Handle) {
        let graph = self.graph();
        // SAFETY: The drain walk holds a reference on the task.
        let task = unsafe { graph.tasks.get(task_hnd) };
        // SAFETY: As above; the drain hands each task to exactly one release.
        let Some(taken) = (unsafe { task.take_job() }) else {
            fatal!("task {task_hnd:?} released without a job");
        };
        let counter = task.counter_id();
        job::run_job(taken);
        graph.tasks.unref(task_hnd);
        self.unref_counter(counter);
    }
}

impl SingleThreadScheduler {
    /// Closure-taking convenience for [`SingleThreadScheduler::run_job`] on
    /// the default job representation.
    #[inline]
    pub fn run<F>(&self, f: F, sync: Option<&mut SyncPoint>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_job(JobFn::new(f), sync);
    }

    /// Closure-taking convenience for
    /// [`SingleThreadScheduler::run_job_after`].
    #[inline]
    pub fn run_after<F>(&self, after: SyncPoint, f: F, sync: Option<&mut SyncPoint>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.run_job_after(after, JobFn::new(f), sync);
    }
}

impl<J: Job> Default for SingleThreadScheduler<J> {
    fn default() -> SingleThreadScheduler<J> {
        SingleThreadScheduler::new()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn scheduler() -> SingleThreadScheduler {
        let mut scheduler = SingleThreadScheduler::new();
        scheduler.init(SingleThreadParams::default());
        scheduler
    }

    #[test]
    fn run_executes_inline() {
        let scheduler = scheduler();
        let hits = Arc::new(AtomicU32::new(0));
        let mut sync = SyncPoint::new();
        let inner = Arc::clone(&hits);
        scheduler.run(
            move || {
                inner.fetch_add(1, Ordering::Relaxed);
            },
            Some(&mut sync),
        );
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(scheduler.has_finished(sync));
        scheduler.wait_for(sync);
    }

    #[test]
    fn gated_tasks_run_on_decrement_in_lifo_order() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut gate = SyncPoint::new();
        scheduler.increment_sync(&mut gate);

        let mut group = SyncPoint::new();
        for i in 0..3 {
            let order = Arc::clone(&order);
            scheduler.run_after(
                gate,
                move || order.lock().unwrap().push(i),
                Some(&mut group),
            );
        }
        assert!(order.lock().unwrap().is_empty());
        assert!(!scheduler.has_finished(group));

        scheduler.decrement_sync(gate);
        assert_eq!(order.lock().unwrap().as_slice(), [2, 1, 0]);
        assert!(scheduler.has_finished(gate));
        assert!(scheduler.has_finished(group));
    }

    #[test]
    fn chains_drain_recursively() {
        let scheduler = scheduler();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut gate = SyncPoint::new();
        scheduler.increment_sync(&mut gate);

        let mut prev = gate;
        for i in 0..16 {
            let mut next = SyncPoint::new();
            let order = Arc::clone(&order);
            scheduler.run_after(
                prev,
                move || order.lock().unwrap().push(i),
                Some(&mut next),
            );
            prev = next;
        }
        assert!(order.lock().unwrap().is_empty());

        scheduler.decrement_sync(gate);
        let seen = order.lock().unwrap();
        assert_eq!(seen.as_slice(), (0..16).collect::<Vec<_>>().as_slice());
        assert!(scheduler.has_finished(prev));
    }

    #[test]
    fn drained_slots_are_all_freed() {
        let scheduler = scheduler();
        let mut gate = SyncPoint::new();
        scheduler.increment_sync(&mut gate);
        let mut group = SyncPoint::new();
        for _ in 0..64 {
            scheduler.run_after(gate, || {}, Some(&mut group));
        }
        scheduler.decrement_sync(gate);
        assert!(scheduler.graph().is_idle());
    }

    #[test]
    fn run_after_stale_predecessor_runs_inline() {
        let scheduler = scheduler();
        let hits = Arc::new(AtomicU32::new(0));
        let inner = Arc::clone(&hits);
        scheduler.run_after(
            SyncPoint::new(),
            move || {
                inner.fetch_add(1, Ordering::Relaxed);
            },
            None,
        );
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[cfg(feature = "checks")]
    #[test]
    #[should_panic(expected = "single-threaded")]
    fn wait_for_pending_sync_panics() {
        let scheduler = scheduler();
        let mut gate = SyncPoint::new();
        scheduler.increment_sync(&mut gate);
        scheduler.wait_for(gate);
    }
}
