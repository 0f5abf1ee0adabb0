//! Process-wide thread table backing the liveness probe every
//! [`crate::cluster::Cluster`] lookup needs.
//!
//! The original has no equivalent of this: a Mercury-backend
//! `threadobj_t` is just a node on a single linked `thread_list`
//! protected by a process-wide lock, walked by `threadobj_lock_cb`-
//! style helpers. `DashMap` is this crate's usual stand-in for that
//! kind of shared table, so that's what this is.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::common::ThreadId;

use super::ThreadObj;

static THREADS: Lazy<DashMap<ThreadId, Weak<ThreadObj>>> = Lazy::new(DashMap::new);

pub(super) fn register(thobj: Arc<ThreadObj>) {
    THREADS.insert(thobj.id(), Arc::downgrade(&thobj));
}

pub(super) fn unregister(id: ThreadId) {
    THREADS.remove(&id);
}

/// Liveness probe for cluster entries: a thread counts as alive as
/// long as its [`ThreadObj`] handle is still registered and some
/// owner keeps it alive, matching `copperplate_probe_node`'s "does
/// the owning thread still exist" check.
pub fn is_alive(id: ThreadId) -> bool {
    match THREADS.get(&id) {
        Some(weak) => weak.upgrade().is_some(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_thread_is_alive_until_dropped() {
        let id = ThreadId(9001);
        {
            let t = ThreadObj::new(id, "probe", 0);
            assert!(is_alive(id));
            drop(t);
        }
        assert!(!is_alive(id));
    }

    #[test]
    fn unknown_thread_is_not_alive() {
        assert!(!is_alive(ThreadId(123_456_789)));
    }
}
