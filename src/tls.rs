//! Per-thread context: debug names, thread ids, and scheduler accounting.
//!
//! Worker threads register a weak back-reference to their scheduler here.
//! Code that is about to block on a resource the scheduler cannot see (a user
//! mutex, file IO) may call [`current_thread_sleeps`] so the pool wakes a
//! spare worker to cover the gap, and [`current_thread_wakes_up`] once it is
//! runnable again. On threads that never joined a pool both calls are no-ops.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

// -----------------------------------------------------------------------------
// Accounting hook

/// Implemented by a scheduler core so detached code can adjust the
/// active-thread accounting of the pool its thread belongs to.
pub(crate) trait WorkerHook: Send + Sync {
    /// The current thread is about to stop making progress.
    fn thread_sleeps(&self);
    /// The current thread is runnable again.
    fn thread_wakes(&self);
}

// -----------------------------------------------------------------------------
// Thread context

struct ThreadContext {
    name: RefCell<Option<String>>,
    id: Cell<u64>,
    hook: RefCell<Option<Weak<dyn WorkerHook>>>,
}

thread_local! {
    static CONTEXT: ThreadContext = const {
        ThreadContext {
            name: RefCell::new(None),
            id: Cell::new(0),
            hook: RefCell::new(None),
        }
    };
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// A small nonzero id unique to the calling thread, assigned on first use.
pub(crate) fn current_thread_id() -> u64 {
    CONTEXT.with(|ctx| {
        if ctx.id.get() == 0 {
            ctx.id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        ctx.id.get()
    })
}

/// Names the calling thread for debug output. Workers name themselves
/// `Worker-N`; callers may rename their own threads at any point.
pub fn set_current_thread_name(name: impl Into<String>) {
    let name = name.into();
    CONTEXT.with(|ctx| *ctx.name.borrow_mut() = Some(name));
}

/// The calling thread's debug name, if one was set.
pub fn current_thread_name() -> Option<String> {
    CONTEXT.with(|ctx| ctx.name.borrow().clone())
}

pub(crate) fn install_worker_hook(hook: Weak<dyn WorkerHook>) {
    CONTEXT.with(|ctx| *ctx.hook.borrow_mut() = Some(hook));
}

pub(crate) fn clear_worker_hook() {
    CONTEXT.with(|ctx| *ctx.hook.borrow_mut() = None);
}

fn with_hook(f: impl FnOnce(&dyn WorkerHook)) {
    let hook = CONTEXT.with(|ctx| ctx.hook.borrow().clone());
    if let Some(hook) = hook.and_then(|weak| weak.upgrade()) {
        f(&*hook);
    }
}

/// Tells the owning scheduler this thread is about to block outside the
/// pool, so a spare worker can be woken to take its place.
pub fn current_thread_sleeps() {
    with_hook(|hook| hook.thread_sleeps());
}

/// Tells the owning scheduler this thread is runnable again.
pub fn current_thread_wakes_up() {
    with_hook(|hook| hook.thread_wakes());
}

// -----------------------------------------------------------------------------
// Tests
