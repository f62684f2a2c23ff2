//! Jobs: the invoke-once unit of work handed to the scheduler.
//!
//! The scheduler is generic over its job representation. The only capability
//! it needs is "invoke once, no arguments, no return value", which is what
//! the [`Job`] trait captures. [`JobFn`] is the default representation: a
//! boxed, type-erased closure. Hosts that want to avoid the allocation (a
//! function pointer plus a context word, say) implement [`Job`] on their own
//! type and instantiate the scheduler with it.

use core::fmt;
use core::mem;

// -----------------------------------------------------------------------------
// Job trait

/// A unit of work. Executing consumes the job; a job runs at most once.
pub trait Job: Send + 'static {
    /// Runs the job.
    fn execute(self);
}

// -----------------------------------------------------------------------------
// Default representation

/// The default job representation: a boxed `FnOnce`.
pub struct JobFn(Box<dyn FnOnce() + Send>);

impl JobFn {
    /// Wraps a closure into a job.
    #[inline]
    pub fn new<F>(f: F) -> JobFn
    where
        F: FnOnce() + Send + 'static,
    {
        JobFn(Box::new(f))
    }
}

impl Job for JobFn {
    #[inline]
    fn execute(self) {
        (self.0)()
    }
}

impl fmt::Debug for JobFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JobFn")
    }
}

// -----------------------------------------------------------------------------
// Execution guard

/// Aborts the process when dropped. Armed around job execution so that a
/// panicking job can never unwind through the scheduler and strand a
/// half-retired task.
pub(crate) struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        tracing::error!("job panicked inside the scheduler; aborting");
        std::process::abort();
    }
}

/// Runs a job under the abort guard.
#[inline]
pub(crate) fn run_job<J: Job>(job: J) {
    let guard = AbortOnPanic;
    job.execute();
    mem::forget(guard);
}

// -----------------------------------------------------------------------------
// Tests
