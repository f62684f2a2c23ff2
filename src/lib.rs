//! A fork-join task scheduler aiming for precision through simplicity.
//!
//! Attacca is a small scheduler for games, interactive tools, and other
//! soft-real-time programs that submit many short-lived jobs and need exact,
//! low-overhead dependency orchestration. Work is described as opaque
//! [`Job`]s; groups of work are tracked by opaque [`SyncPoint`]s. A caller
//! can fire jobs to run concurrently, chain jobs behind a group with
//! [`Scheduler::run_after`], fan in externally signaled work with
//! [`Scheduler::increment_sync`]/[`Scheduler::decrement_sync`], and block a
//! thread until a group completes with [`Scheduler::wait_for`].
//!
//! Three pieces carry the design:
//!
//! - a lock-free, versioned [`HandlePool`] that makes every task and counter
//!   a 32-bit handle, so stale handles are detected instead of dereferenced,
//!   and the last observer of a record runs its finalizer exactly once;
//! - a counter protocol in which "pending work" is literally the reference
//!   count, so completion, manual holds, and blocked waiters all compose
//!   through one pair of operations;
//! - a worker pool whose OS thread count is decoupled from its
//!   *simultaneously running* cap, so threads parked for the moment a busy
//!   sibling blocks on IO do not oversubscribe the cores in the meantime.
//!
//! # Example
//!
//! ```no_run
//! use attacca::{Scheduler, SchedulerParams, SyncPoint};
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.init(SchedulerParams::default());
//!
//! // Fan out, then chain a job behind the whole group.
//! let mut stage1 = SyncPoint::new();
//! for i in 0..64 {
//!     scheduler.run(move || do_slice(i), Some(&mut stage1));
//! }
//! let mut stage2 = SyncPoint::new();
//! scheduler.run_after(stage1, || println!("stage 1 done"), Some(&mut stage2));
//!
//! scheduler.wait_for(stage2);
//! scheduler.stop();
//! # fn do_slice(_i: usize) {}
//! ```
//!
//! A cooperative [`SingleThreadScheduler`] offers the same externally
//! observable semantics without spawning threads (and without blocking);
//! jobs execute inline as their dependencies resolve.
//!
//! # Contract checks
//!
//! Misuse of handles (double release, waiting twice on one sync point,
//! exhausting a pool) is a bug in the caller, not a recoverable condition.
//! With the default `checks` feature these are caught and raised as panics
//! on the offending thread after logging a diagnostic; a panic that would
//! cross a worker loop aborts the process instead of stranding the pool.
//! Builds that disable the feature skip the checks entirely.

// -----------------------------------------------------------------------------
// Contract-check macros

/// Logs a diagnostic and panics. Fatal contract violations only.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}

/// Checks a scheduler contract. Compiled to nothing without the `checks`
/// feature.
macro_rules! check {
    ($cond:expr, $($arg:tt)*) => {
        if cfg!(feature = "checks") && !($cond) {
            $crate::fatal!($($arg)*);
        }
    };
}

pub(crate) use fatal;

// -----------------------------------------------------------------------------
// Modules

mod job;
mod lock;
mod mem;
mod pool;
mod queue;
mod scheduler;
mod signal;
mod single_thread;
mod task;
mod tls;

// -----------------------------------------------------------------------------
// Top-level exports

pub use job::Job;
pub use job::JobFn;
pub use lock::Mutex;
pub use lock::MutexGuard;
pub use lock::Spinlock;
pub use lock::SpinlockGuard;
pub use mem::MemCallbacks;
pub use pool::Handle;
pub use pool::HandlePool;
pub use pool::MAX_CAPACITY;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerParams;
pub use single_thread::SingleThreadParams;
pub use single_thread::SingleThreadScheduler;
pub use task::SyncPoint;
pub use tls::current_thread_name;
pub use tls::current_thread_sleeps;
pub use tls::current_thread_wakes_up;
pub use tls::set_current_thread_name;
