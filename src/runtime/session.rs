//! Session binding: one shared arena, one catalog, one registry per
//! named session.
//!
//! The source backs a session with a POSIX shared-memory object named
//! `/xeno:<session>.heap`: the first process to attach creates and
//! truncates it, later attachers `mmap` the same region, and a
//! creator whose pid is no longer live lets a new attacher
//! reinitialize in its place ("if the creator PID is no longer
//! live ... new attachers reinitialize; otherwise they fail with
//! `-EEXIST`"). This port has one process per session by construction
//! (there is no `mmap` here - see [`crate::heap`]'s doc comment and
//! DESIGN.md's OQ-1), so "the creator process" becomes "the creator
//! has already torn the session down"; [`Session::bind`] keeps the
//! same create-or-attach-or-EEXIST decision table so a future
//! multi-process backend can drop in without changing callers.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::cluster::{catalog, Cluster};
use crate::error::{CopperplateError, Result};
use crate::heap::HeapMemory;
use crate::registry::Registry;
use crate::thread::ThreadObj;

static SESSIONS: Lazy<DashMap<String, Arc<Session>>> = Lazy::new(DashMap::new);

/// The create-or-attach decision table `Session::bind` implements,
/// pulled out as a trait so a future multi-process backend (one
/// actually backed by a `shm_open`+`mmap` region rather than an
/// in-process table) can implement the same contract without callers
/// changing. `Session` is the only implementation today.
pub trait Attachable: Sized {
    /// Creates the named resource if this is the first attach, joins
    /// it otherwise; `reset` tears down and recreates unconditionally.
    fn bind(name: &str, mem_pool_size: usize, reset: bool) -> Result<Arc<Self>>;
    /// Joins an already-bound resource without creating one.
    fn lookup(name: &str) -> Result<Arc<Self>>;
    /// Removes the named resource so the next `bind` starts fresh.
    fn teardown(name: &str);
}

impl Attachable for Session {
    fn bind(name: &str, mem_pool_size: usize, reset: bool) -> Result<Arc<Session>> {
        Session::bind(name, mem_pool_size, reset)
    }
    fn lookup(name: &str) -> Result<Arc<Session>> {
        Session::lookup(name)
    }
    fn teardown(name: &str) {
        Session::teardown(name)
    }
}

/// Binds one named session to its arena and registry. Dropping every
/// `Arc<Session>` a caller holds does not tear the session down by
/// itself (mirroring the source, where only process exit or
/// `--reset-session` frees the shared-memory file); callers use
/// [`Session::teardown`] or `--reset-session` explicitly.
pub struct Session {
    name: String,
    heap: Arc<HeapMemory>,
    registry: Arc<Registry>,
    /// Session-wide catalog of named thread clusters, matching
    /// `main_catalog` in `lib/copperplate/cluster.c`: every thread
    /// cluster a subsystem asks for by name is looked up or created
    /// here, so two callers in this session asking for the same
    /// cluster name always get the same [`Cluster`] instance.
    thread_clusters: DashMap<String, Arc<Cluster<ThreadObj>>>,
}

impl Session {
    /// `bind(name, mem_pool_size, reset)`: creates the session's
    /// arena and registry if this is the first attach, or returns the
    /// existing ones, matching `copperplate_init`'s implicit
    /// first-attacher-creates behaviour plus `--reset-session`'s
    /// explicit teardown-then-create. A second attach without `reset`
    /// simply joins the existing session, the single-process analogue
    /// of a later attacher `mmap`-ing the same live creator's region;
    /// the source's `-EEXIST` only fires when the *requested size*
    /// disagrees with a live creator's, which this port has no
    /// separate arena-resize path to trigger.
    pub fn bind(name: &str, mem_pool_size: usize, reset: bool) -> Result<Arc<Session>> {
        if reset {
            SESSIONS.remove(name);
        }
        if let Some(existing) = SESSIONS.get(name) {
            return Ok(existing.clone());
        }
        let heap = HeapMemory::init(mem_pool_size)?;
        let session = SESSIONS
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Session {
                    name: name.to_string(),
                    heap: Arc::new(heap),
                    registry: Arc::new(Registry::new()),
                    thread_clusters: DashMap::new(),
                })
            })
            .clone();
        Ok(session)
    }

    /// Looks up an already-bound session without creating one,
    /// matching a plain attach with no `copperplate_init` of its own
    /// (a secondary thread of the same process joining the session a
    /// `main()` already created).
    pub fn lookup(name: &str) -> Result<Arc<Session>> {
        SESSIONS
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| CopperplateError::NotFound(format!("session '{name}'")))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap(&self) -> &Arc<HeapMemory> {
        &self.heap
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Looks up the named thread cluster in this session, creating it
    /// on first request, matching `cluster_init`'s lookup-or-create
    /// against `main_catalog`. Two callers asking for the same `name`
    /// within this session always get the same [`Cluster`] instance,
    /// so e.g. an Alchemy-style skin built on top of this runtime can
    /// publish and discover named threads without its own registry.
    pub fn thread_cluster(&self, name: &str) -> Arc<Cluster<ThreadObj>> {
        catalog::get_or_create(&self.thread_clusters, name)
    }

    /// Removes the session from the process-wide table, matching
    /// `--reset-session`'s teardown of a prior session of that name.
    /// Any `Arc<Session>` a caller still holds stays valid (its arena
    /// and registry outlive the table entry); new `bind` calls for
    /// this name start fresh.
    pub fn teardown(name: &str) {
        SESSIONS.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_bind_creates_a_fresh_session() {
        let s = Session::bind("test-create", 64 * 1024, true).unwrap();
        assert_eq!(s.name(), "test-create");
        assert_eq!(s.heap().used_size(), 0);
    }

    #[test]
    fn second_bind_without_reset_reattaches_the_same_session() {
        let s1 = Session::bind("test-reattach", 64 * 1024, true).unwrap();
        let h = s1.heap().alloc(64).unwrap();
        let s2 = Session::bind("test-reattach", 64 * 1024, false).unwrap();
        assert_eq!(s2.heap().used_size(), 64);
        s2.heap().free(h).unwrap();
    }

    #[test]
    fn reset_session_starts_a_clean_arena() {
        let s1 = Session::bind("test-reset", 64 * 1024, true).unwrap();
        s1.heap().alloc(64).unwrap();
        let s2 = Session::bind("test-reset", 64 * 1024, true).unwrap();
        assert_eq!(s2.heap().used_size(), 0);
    }

    #[test]
    fn lookup_fails_for_an_unbound_session() {
        assert!(Session::lookup("never-bound-xyz").is_err());
    }

    #[test]
    fn thread_cluster_is_shared_across_lookups_by_name() {
        let s = Session::bind("test-thread-cluster", 64 * 1024, true).unwrap();
        let a = s.thread_cluster("workers");
        let b = s.thread_cluster("workers");
        assert!(Arc::ptr_eq(&a, &b));

        let other = s.thread_cluster("helpers");
        assert!(!Arc::ptr_eq(&a, &other));

        let t = ThreadObj::new(crate::common::ThreadId(777), "w1", 0);
        a.add_obj("w1", t.id(), t.clone(), crate::thread::is_alive)
            .unwrap();
        assert!(a.find_obj("w1", crate::thread::is_alive).is_some());
    }
}
