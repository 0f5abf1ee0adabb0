//! Generic "look it up, create it if this is the first caller"
//! helper backing every named [`super::Cluster`] registry in the
//! runtime.
//!
//! Grounded on `cluster_init` in `lib/copperplate/cluster.c`: a
//! cluster is first looked up by name in a shared catalog and created
//! on demand, with a "someone slipped in and created it first" retry
//! on conflict. `dashmap`'s `entry().or_insert_with()` gives us that
//! insert-or-get behaviour atomically, so the `redo:` goto in the
//! source collapses to a single call.
//!
//! The original keeps one process-wide `main_catalog` for every
//! cluster regardless of what it holds (objects are untyped `void *`
//! at that layer). Rust's static typing makes a single mixed-type map
//! awkward without `Any` downcasting, so each subsystem that needs
//! named clusters owns its own `DashMap`-backed catalog of that one
//! object type and calls into this helper — the same lookup-or-create
//! discipline, one catalog per kind instead of one shared catalog of
//! everything. [`crate::runtime::session::Session`] is the concrete
//! caller today: `Session::thread_cluster` uses this to hand out one
//! shared [`super::Cluster<crate::thread::ThreadObj>`] per name within
//! a session.

use std::sync::Arc;

use dashmap::DashMap;

use super::Cluster;

pub fn get_or_create<T: Send + Sync + 'static>(
    registry: &DashMap<String, Arc<Cluster<T>>>,
    name: &str,
) -> Arc<Cluster<T>> {
    registry
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(Cluster::new(name)))
        .clone()
}
