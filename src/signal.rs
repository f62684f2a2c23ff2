//! A one-shot wait/signal event.
//!
//! `Signal` carries exactly one notification, once, between exactly two
//! parties. Workers stack-allocate one per blocked cycle and publish its
//! address through their wake slot; `wait_for` callers install one into a
//! counter's waiter field. An instance must never be reused for a second
//! round of wait/signal.

use core::sync::atomic::{AtomicU32, Ordering};


// -----------------------------------------------------------------------------
// States

/// No waiter has blocked and nothing has been sent.
const IDLE: u32 = 0b00;

/// Set by the waiting side when it is about to block and needs a futex wake.
const WAIT: u32 = 0b01;

/// Set by the signaling side. Once set it never clears.
const SENT: u32 = 0b10;

// -----------------------------------------------------------------------------
// Signal

/// A single-use wait/signal event on a futex word.
pub struct Signal {
    state: AtomicU32,
}

impl Signal {
    pub fn new() -> Signal {
        Signal {
            state: AtomicU32::new(IDLE),
        }
    }

    /// Blocks the calling thread until [`Signal::signal`] fires. Returns
    /// immediately if it already has.
    pub fn wait(&self) {
        // Loop to absorb spurious futex wakes.
        loop {
            let state = self.state.fetch_or(WAIT, Ordering::Acquire);
            if state & SENT != 0 {
                return;
            }
            atomic_wait::wait(&self.state, state | WAIT);
        }
    }

    /// Fires the signal, waking the waiter if it is blocked.
    ///
    /// This takes a raw pointer because setting `SENT` releases the waiting
    /// thread, whose stack (and with it the signal itself) may be torn down
    /// the instant the store lands.
    ///
    /// # Safety
    ///
    /// `signal` must be convertible to a reference on entry and must remain
    /// valid until this call's final state transition; only the actions of
    /// `signal` itself may invalidate it. Calling this twice on the same
    /// instance is a contract violation.
    pub unsafe fn signal(signal: *const Signal) {
        // SAFETY: The caller guarantees the pointer is valid here; nothing
        // has released the waiter yet.
        let state = unsafe { (*signal).state.load(Ordering::Relaxed) };
        check!(state & SENT == 0, "one-shot signal fired twice");
        // After this fetch_or the waiter may return from `wait` and free the
        // signal, so the pointer must not be used for anything beyond the
        // wake below.
        //
        // SAFETY: As above.
        let state = unsafe { (*signal).state.fetch_or(SENT, Ordering::Release) };
        if state & WAIT != 0 {
            // The waiter is asleep or committed to sleeping; it cannot have
            // torn the signal down, because it only does so after observing
            // SENT, and a waiter that observes SENT has no further need of a
            // wake.
            //
            // SAFETY: As above.
            atomic_wait::wake_one(unsafe { &(*signal).state });
        }
    }
}

impl Default for Signal {
    fn default() -> Signal {
        Signal::new()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn pre_signaled_wait_returns_immediately() {
        let signal = Signal::new();
        // SAFETY: The signal outlives the call and has not fired before.
        unsafe { Signal::signal(&signal) };
        signal.wait();
    }

    #[test]
    fn wait_observes_writes_before_signal() {
        let signal = Arc::new(Signal::new());
        let value = Arc::new(AtomicU32::new(0));
        let sender = thread::spawn({
            let signal = Arc::clone(&signal);
            let value = Arc::clone(&value);
            move || {
                thread::sleep(Duration::from_millis(10));
                value.store(42, Ordering::Relaxed);
                // SAFETY: The Arc keeps the signal alive; first fire.
                unsafe { Signal::signal(&*signal) };
            }
        });
        signal.wait();
        assert_eq!(value.load(Ordering::Relaxed), 42);
        sender.join().unwrap();
    }
}
