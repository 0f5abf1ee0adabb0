//! Timer dispatcher: a single server thread servicing a
//! process-wide sorted list of armed timers.
//!
//! Ported from `lib/copperplate/timerobj.c`. The source arms one
//! POSIX `timer_create` per `timerobj`, all bound to deliver the same
//! signal to one dedicated server thread that sits in `sigwait`/
//! `sem_wait` and, on each wakeup, walks the sorted `svtimers` list
//! popping and running every entry whose deadline has passed,
//! re-enqueuing it first if it carries a repeat interval. Rust's
//! std doesn't expose POSIX interval timers directly, so this port
//! replaces the N-real-timers-plus-one-signal design with a single
//! dispatcher thread that computes its own next-wakeup deadline and
//! parks on a [`Condvar`] until then — observably equivalent for every
//! property this runtime cares about (handlers still run serialized,
//! on time, in deadline order), without reaching for a timer-wheel
//! crate nothing else in the stack uses.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

thread_local! {
    /// Set for the duration of a handler invocation on the dispatcher
    /// thread, so [`crate::syncobj::Syncobj::pend_identified`] can
    /// reject a handler trying to self-pend (§4.4/§4.6: "a handler
    /// must not block waiting on a syncobj it belongs to").
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// True while running on the timer dispatcher thread, inside a
/// handler invocation. Checked by [`crate::syncobj::Syncobj`] so a
/// handler's attempt to pend reports `-EPERM` instead of deadlocking
/// the one thread that would otherwise ever post to it.
pub fn in_dispatch_context() -> bool {
    IN_DISPATCH.with(|f| f.get())
}

struct TimerEntry {
    id: u64,
    deadline: Instant,
    interval: Option<Duration>,
    handler: Arc<dyn Fn() + Send + Sync>,
}

struct ServerState {
    timers: Vec<TimerEntry>,
    spawned: bool,
}

struct TimerServer {
    state: Mutex<ServerState>,
    cond: Condvar,
}

static SERVER: Lazy<TimerServer> = Lazy::new(|| TimerServer {
    state: Mutex::new(ServerState {
        timers: Vec::new(),
        spawned: false,
    }),
    cond: Condvar::new(),
});

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Reverse-scan insertion identical in spirit to `timerobj_enqueue`:
/// walk from the tail and insert right after the first entry whose
/// deadline is at or before the new one's, keeping the list sorted
/// with earliest deadline at the front.
fn enqueue(state: &mut ServerState, entry: TimerEntry) {
    let pos = state
        .timers
        .iter()
        .rposition(|t| t.deadline <= entry.deadline)
        .map(|i| i + 1)
        .unwrap_or(0);
    state.timers.insert(pos, entry);
}

fn ensure_server_spawned() {
    let mut state = SERVER.state.lock();
    if state.spawned {
        return;
    }
    state.spawned = true;
    drop(state);

    tracing::info!("timer dispatcher thread spawned");
    thread::Builder::new()
        .name("timer-internal".into())
        .spawn(server_loop)
        .expect("failed to spawn timer dispatcher thread");
}

/// The server loop, matching `timerobj_server`'s `for(;;)`: wait for
/// either new work or the earliest deadline, then run every timer
/// whose deadline has passed, serialized one at a time.
fn server_loop() {
    loop {
        let mut state = SERVER.state.lock();
        loop {
            match state.timers.first().map(|t| t.deadline) {
                None => {
                    SERVER.cond.wait(&mut state);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        break;
                    }
                    SERVER.cond.wait_for(&mut state, deadline - now);
                }
            }
        }

        let entry = state.timers.remove(0);
        let handler = entry.handler.clone();
        if let Some(interval) = entry.interval {
            enqueue(
                &mut state,
                TimerEntry {
                    id: entry.id,
                    deadline: entry.deadline + interval,
                    interval: Some(interval),
                    handler: entry.handler,
                },
            );
        }
        drop(state);

        struct DispatchGuard;
        impl Drop for DispatchGuard {
            fn drop(&mut self) {
                IN_DISPATCH.with(|f| f.set(false));
            }
        }
        IN_DISPATCH.with(|f| f.set(true));
        let _guard = DispatchGuard;
        handler();
    }
}

/// Handle to an armed or disarmed timer. Dropping it does not stop
/// the timer (matching the source, where `timerobj_destroy` is an
/// explicit call, not a destructor side effect); call
/// [`TimerObj::stop`] explicitly.
pub struct TimerObj {
    id: u64,
}

impl TimerObj {
    pub fn new() -> Self {
        TimerObj {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Arms the timer to fire `handler` at `deadline`, and every
    /// `interval` thereafter if given, matching `timerobj_start`.
    /// Spawns the shared dispatcher thread on first use, matching
    /// `timerobj_spawn_server`'s lazy, once-only start.
    pub fn start(
        &self,
        deadline: Instant,
        interval: Option<Duration>,
        handler: impl Fn() + Send + Sync + 'static,
    ) {
        ensure_server_spawned();
        let mut state = SERVER.state.lock();
        enqueue(
            &mut state,
            TimerEntry {
                id: self.id,
                deadline,
                interval,
                handler: Arc::new(handler),
            },
        );
        drop(state);
        SERVER.cond.notify_one();
    }

    /// Disarms the timer if still pending, matching `timerobj_stop`.
    /// A no-op if the timer already fired (one-shot) or was never
    /// started.
    pub fn stop(&self) {
        let mut state = SERVER.state.lock();
        state.timers.retain(|t| t.id != self.id);
    }
}

impl Default for TimerObj {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn one_shot_timer_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = TimerObj::new();
        t.start(Instant::now() + Duration::from_millis(20), None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn periodic_timer_fires_multiple_times() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = TimerObj::new();
        t.start(
            Instant::now() + Duration::from_millis(10),
            Some(Duration::from_millis(10)),
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        thread::sleep(Duration::from_millis(75));
        t.stop();
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 3, "expected at least 3 fires, got {count}");
    }

    #[test]
    fn stop_before_deadline_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = TimerObj::new();
        t.start(Instant::now() + Duration::from_millis(50), None, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        t.stop();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_handler_cannot_self_pend_on_the_dispatcher_thread() {
        use crate::error::CopperplateError;
        use crate::syncobj::{QueuingMode, Syncobj};

        let result: Arc<Mutex<Option<crate::error::Result<()>>>> = Arc::new(Mutex::new(None));
        let r = result.clone();
        let sobj = Arc::new(Syncobj::new(QueuingMode::Fifo));
        let s = sobj.clone();

        let t = TimerObj::new();
        t.start(Instant::now() + Duration::from_millis(10), None, move || {
            *r.lock() = Some(s.pend(0, Some(Duration::from_millis(50))));
        });
        thread::sleep(Duration::from_millis(100));

        assert_eq!(
            result.lock().take(),
            Some(Err(CopperplateError::NotPermitted(
                "cannot pend from the timer dispatcher's own context".into()
            )))
        );
    }
}
