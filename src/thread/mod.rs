//! Thread object: identity, priority, scheduler-lock
//! emulation, round-robin quantum, periodic timing, and the
//! cancellation/start handshake every runtime thread goes through.
//!
//! Ported from `lib/copperplate/threadobj.c`'s Mercury backend (the
//! POSIX-only path; there is no Cobalt dual-kernel mode to port here).
//! Two structural simplifications follow directly from not having
//! `pthread_cancel`/async-cancellation in safe Rust:
//!
//! - `threadobj_cancel`'s "make the thread a zombie, then
//!   `pthread_cancel` + `pthread_join`" sequence becomes a cooperative
//!   flag (`cancel_requested`) that blocking calls are expected to
//!   observe, joined normally by the owner of the [`JoinHandle`].
//! - The suspend/resume notifier (a signal pipe in the source) becomes
//!   a plain [`Condvar`]-guarded flag; see [`crate::notifier`].
//!
//! `run_entry`/`harden`/`relax` are kept as explicit trait methods on
//! [`Domain`] even though the single-kernel port only has one trivial
//! implementation, so the dual-kernel seam the original has stays
//! visible rather than silently vanishing.

mod registry;

pub use registry::{is_alive, register, unregister};

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::common::ThreadId;
use crate::error::{CopperplateError, Result};
use crate::syncobj::Syncobj;

/// Degrades `harden`/`relax` to no-ops on a single-kernel host; kept
/// as a trait so a future dual-kernel backend has somewhere to hang
/// real domain-switch logic without touching [`ThreadObj`]'s public
/// surface.
pub trait Domain {
    fn harden(&self) {}
    fn relax(&self) {}
}

/// The trivial, single-kernel [`Domain`].
pub struct PosixDomain;
impl Domain for PosixDomain {}

/// Minimal hand-rolled bitset for the five status bits
/// `threadobj.c`'s `core.status` tracks. Kept local rather than
/// reaching for a flags crate: five bits, all owned by this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Status(u32);

impl Status {
    const WARMUP: Status = Status(0b0000_0001);
    const STARTED: Status = Status(0b0000_0010);
    #[allow(dead_code)]
    const ABORTED: Status = Status(0b0000_0100);
    const SCHEDLOCK: Status = Status(0b0000_1000);
    const ROUNDROBIN: Status = Status(0b0001_0000);

    fn contains(self, other: Status) -> bool {
        self.0 & other.0 == other.0
    }
    fn insert(&mut self, other: Status) {
        self.0 |= other.0;
    }
    fn remove(&mut self, other: Status) {
        self.0 &= !other.0;
    }
}

struct PeriodicState {
    period: Duration,
    next_wakeup: Instant,
}

/// A runtime thread's descriptor. One instance per live thread,
/// registered process-wide so clusters can liveness-probe it and
/// `threadobj_set_rr`-style global operations can reach every thread.
pub struct ThreadObj {
    id: ThreadId,
    name: String,
    priority: AtomicI32,
    /// Priority to restore once the scheduler lock depth reaches zero
    /// again, matching `core.prio_unlocked`.
    prio_unlocked: AtomicI32,
    schedlock_depth: AtomicU32,
    status: Mutex<Status>,
    tslice: Mutex<Option<Duration>>,
    periodic: Mutex<Option<PeriodicState>>,
    barrier_lock: Mutex<()>,
    barrier_cond: Condvar,
    cancel_requested: AtomicBool,
    /// The syncobj this thread is currently blocked on, if any; lets
    /// `unblock` flush it directly instead of signalling a real OS
    /// thread, mirroring `thobj->wait_sobj`.
    wait_sobj: Mutex<Option<std::sync::Arc<Syncobj>>>,
}

impl ThreadObj {
    pub fn new(id: ThreadId, name: impl Into<String>, priority: i32) -> std::sync::Arc<Self> {
        let thobj = std::sync::Arc::new(ThreadObj {
            id,
            name: name.into(),
            priority: AtomicI32::new(priority),
            prio_unlocked: AtomicI32::new(priority),
            schedlock_depth: AtomicU32::new(0),
            status: Mutex::new(Status::WARMUP),
            tslice: Mutex::new(None),
            periodic: Mutex::new(None),
            barrier_lock: Mutex::new(()),
            barrier_cond: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
            wait_sobj: Mutex::new(None),
        });
        register(thobj.clone());
        thobj
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    /// Matches `threadobj_set_priority`: while the scheduler lock is
    /// held, the new priority is only recorded for restoration on
    /// unlock, not applied immediately. If the thread is currently
    /// blocked in [`ThreadObj::pend`], also reorders it within that
    /// syncobj's pend queue (`requeue_waiter`) so the new priority
    /// takes effect on the wait immediately rather than only on the
    /// next `pend` call.
    pub fn set_priority(&self, prio: i32) {
        let status = *self.status.lock();
        if status.contains(Status::SCHEDLOCK) {
            self.prio_unlocked.store(prio, Ordering::Release);
            return;
        }
        self.priority.store(prio, Ordering::Release);
        if let Some(sobj) = self.wait_sobj.lock().clone() {
            sobj.requeue_waiter(self.id, prio);
        }
    }

    /// Matches `threadobj_lock_sched`: nested calls only increment a
    /// depth counter, and priority is bumped to the runtime's
    /// scheduler-lock ceiling only on the outermost call.
    pub fn lock_sched(&self, lock_priority: i32) {
        if self.schedlock_depth.fetch_add(1, Ordering::AcqRel) > 0 {
            return;
        }
        let mut status = self.status.lock();
        self.prio_unlocked
            .store(self.priority.load(Ordering::Acquire), Ordering::Release);
        status.insert(Status::SCHEDLOCK);
        self.priority.store(lock_priority, Ordering::Release);
    }

    /// Matches `threadobj_unlock_sched`.
    pub fn unlock_sched(&self) -> Result<()> {
        let depth = self.schedlock_depth.load(Ordering::Acquire);
        if depth == 0 {
            return Err(CopperplateError::InvalidArgument(
                "scheduler lock not held".into(),
            ));
        }
        if self.schedlock_depth.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }
        let mut status = self.status.lock();
        status.remove(Status::SCHEDLOCK);
        self.priority
            .store(self.prio_unlocked.load(Ordering::Acquire), Ordering::Release);
        Ok(())
    }

    pub fn is_scheduler_locked(&self) -> bool {
        self.status.lock().contains(Status::SCHEDLOCK)
    }

    /// Enables or disables round-robin time-slicing with the given
    /// quantum, matching `threadobj_set_rr`.
    pub fn set_round_robin(&self, quantum: Option<Duration>) {
        let mut status = self.status.lock();
        let mut tslice = self.tslice.lock();
        match quantum {
            Some(q) => {
                status.insert(Status::ROUNDROBIN);
                *tslice = Some(q);
            }
            None => {
                status.remove(Status::ROUNDROBIN);
                *tslice = None;
            }
        }
    }

    pub fn round_robin_quantum(&self) -> Option<Duration> {
        *self.tslice.lock()
    }

    /// Establishes the periodic deadline schedule, matching
    /// `threadobj_set_periodic`. `initial` is an absolute deadline; if
    /// `None`, the first period starts from now.
    pub fn set_periodic(&self, initial: Option<Instant>, period: Duration) -> Result<()> {
        let now = Instant::now();
        let first_wakeup = match initial {
            Some(idate) if idate < now => return Err(CopperplateError::TimedOut),
            Some(idate) => idate,
            None => now,
        };
        *self.periodic.lock() = Some(PeriodicState {
            period,
            next_wakeup: first_wakeup + period,
        });
        Ok(())
    }

    /// Sleeps until the next periodic deadline, reporting overruns
    /// the way `threadobj_wait_period` does: if the wakeup already
    /// slipped past by one or more whole periods, the deadline jumps
    /// forward to the next period boundary, the overrun count is
    /// returned via `Ok`, and the caller is expected to treat a
    /// non-zero count as a missed deadline the way the source treats
    /// its `-ETIMEDOUT` return.
    pub fn wait_period(&self) -> Result<u64> {
        let (period, wakeup) = {
            let guard = self.periodic.lock();
            let state = guard
                .as_ref()
                .ok_or_else(|| CopperplateError::NotPermitted("no periodic schedule set".into()))?;
            (state.period, state.next_wakeup)
        };

        let now = Instant::now();
        if wakeup > now {
            std::thread::sleep(wakeup - now);
        }

        let now = Instant::now();
        let overruns = if now > wakeup {
            let late = now.duration_since(wakeup);
            (late.as_nanos() / period.as_nanos().max(1)) as u64
        } else {
            0
        };

        let mut guard = self.periodic.lock();
        if let Some(state) = guard.as_mut() {
            state.next_wakeup = wakeup + period * (overruns as u32 + 1);
        }

        Ok(overruns)
    }

    /// Matches `threadobj_start`: releases a thread parked in
    /// [`ThreadObj::wait_start`].
    pub fn start(&self) {
        let _guard = self.barrier_lock.lock();
        let mut status = self.status.lock();
        if status.contains(Status::STARTED) {
            return;
        }
        status.insert(Status::STARTED);
        drop(status);
        tracing::trace!(thread = %self.id, name = %self.name, "thread started");
        self.barrier_cond.notify_all();
    }

    /// Matches `threadobj_wait_start`: blocks until [`ThreadObj::start`]
    /// releases it or the thread was aborted before starting.
    pub fn wait_start(&self) {
        let mut guard = self.barrier_lock.lock();
        loop {
            let status = *self.status.lock();
            if status.contains(Status::STARTED) || status.contains(Status::ABORTED) {
                break;
            }
            self.barrier_cond.wait(&mut guard);
        }
    }

    /// Matches `threadobj_cancel`'s cooperative half: marks the thread
    /// for cancellation and flushes whatever syncobj it is currently
    /// blocked on (`threadobj_unblock`), waking it with
    /// [`CopperplateError::Interrupted`].
    pub fn cancel(&self) {
        tracing::debug!(thread = %self.id, name = %self.name, "cancelling thread");
        self.cancel_requested.store(true, Ordering::Release);
        if let Some(sobj) = self.wait_sobj.lock().clone() {
            sobj.flush(crate::syncobj::FlushReason::Flushed);
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Records the syncobj this thread is about to block on, so a
    /// concurrent [`ThreadObj::cancel`] can flush it (`wait_sobj`
    /// bookkeeping around `syncobj_pend`).
    pub fn enter_wait(&self, sobj: std::sync::Arc<Syncobj>) {
        *self.wait_sobj.lock() = Some(sobj);
    }

    pub fn leave_wait(&self) {
        *self.wait_sobj.lock() = None;
    }

    /// Blocks this thread on `sobj` at its current priority, identified
    /// so a concurrent [`ThreadObj::set_priority`] can requeue it and a
    /// concurrent [`ThreadObj::cancel`] can flush it. This is the
    /// thread-object-bound counterpart of calling [`Syncobj::pend`]
    /// directly (used where no particular thread identity is in play,
    /// e.g. the syncluster rendezvous).
    pub fn pend(&self, sobj: &std::sync::Arc<Syncobj>, timeout: Option<Duration>) -> Result<()> {
        self.enter_wait(sobj.clone());
        let result = sobj.pend_identified(self.id, self.priority(), None, timeout);
        self.leave_wait();
        result
    }
}

impl Drop for ThreadObj {
    fn drop(&mut self) {
        unregister(self.id);
    }
}
