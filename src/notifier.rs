//! Suspend/resume signalling, used by [`crate::thread`]
//! to park a thread until another thread releases it.
//!
//! Ported from `lib/copperplate/notifier.c`. The source delivers a
//! real-time signal (`SIGNOTIFY`) to the target thread, whose handler
//! blocks in a read on a private pipe until `notifier_release` writes
//! a byte to the other end; `notifier_signal` is what makes the target
//! actually enter that wait. A single process can't usefully emulate
//! "deliver an async signal that forces a blocking read" without unsafe
//! signal-handler trickery for no benefit here, so this port collapses
//! signal-plus-pipe into one level-triggered primitive: a
//! [`Condvar`]-guarded boolean the target thread waits on directly
//! (Open Question OQ-2). The suspend/resume contract — park until
//! released, released state sticks until consumed — is preserved.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct State {
    /// Set by [`Notifier::release`]; cleared by the next
    /// [`Notifier::wait`] that observes it, matching the one byte
    /// sitting in the source's pipe until read.
    released: bool,
    /// Set by [`Notifier::disable`]; once true, further `wait` calls
    /// return immediately, mirroring `notifier_disable` closing the
    /// read end out from under a blocked reader.
    disabled: bool,
}

/// One notifier per thread that can be suspended, matching `struct
/// notifier`.
pub struct Notifier {
    state: Mutex<State>,
    cond: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier {
            state: Mutex::new(State {
                released: false,
                disabled: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling thread until [`Notifier::release`] is
    /// called, matching `notifier_wait`'s blocking read. Returns
    /// immediately if already released or disabled.
    pub fn wait(&self) {
        let mut guard = self.state.lock();
        while !guard.released && !guard.disabled {
            self.cond.wait(&mut guard);
        }
        guard.released = false;
    }

    /// As [`Notifier::wait`], but gives up after `timeout` and returns
    /// `false`. The source has no equivalent (a real pipe read has no
    /// timeout here), but callers that need to also observe
    /// cancellation need a bounded wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut guard = self.state.lock();
        if guard.released || guard.disabled {
            guard.released = false;
            return true;
        }
        let result = self.cond.wait_for(&mut guard, timeout);
        if !result.timed_out() && (guard.released || guard.disabled) {
            guard.released = false;
            true
        } else {
            false
        }
    }

    /// Wakes a thread parked in [`Notifier::wait`], matching
    /// `notifier_release`'s write of one byte to the pipe. In the
    /// source, `notifier_signal` (a real signal) is what gets the
    /// target thread to call `notifier_wait` in the first place; here
    /// the caller that wants to suspend a thread calls `wait` itself
    /// cooperatively, so `signal` and `release` collapse to the same
    /// single step.
    pub fn release(&self) {
        let mut guard = self.state.lock();
        guard.released = true;
        self.cond.notify_one();
    }

    /// Permanently unblocks any current or future waiter, matching
    /// `notifier_disable` closing the read end.
    pub fn disable(&self) {
        let mut guard = self.state.lock();
        guard.disabled = true;
        self.cond.notify_all();
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_wakes_a_waiting_thread() {
        let nf = Arc::new(Notifier::new());
        let n2 = nf.clone();
        let h = thread::spawn(move || n2.wait());
        thread::sleep(Duration::from_millis(30));
        nf.release();
        h.join().unwrap();
    }

    #[test]
    fn disable_unblocks_immediately_and_permanently() {
        let nf = Notifier::new();
        nf.disable();
        nf.wait(); // must not hang
        nf.wait();
    }

    #[test]
    fn wait_timeout_reports_no_release() {
        let nf = Notifier::new();
        assert!(!nf.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn wait_timeout_reports_a_release() {
        let nf = Arc::new(Notifier::new());
        let n2 = nf.clone();
        let h = thread::spawn(move || n2.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        nf.release();
        assert!(h.join().unwrap());
    }
}
