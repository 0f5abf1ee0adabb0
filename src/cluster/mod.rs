//! Clustered naming registry: named tables of runtime
//! objects with owner-liveness-probed stale-entry eviction.
//!
//! Grounded on `lib/copperplate/cluster.c`. The source distinguishes
//! private clusters (`pvcluster`, a plain per-process hash table) from
//! shared ones (`cluster`, indexed in a session-wide catalog so
//! several processes attached to the same session can publish and
//! look up objects by name). Our single-process port only has one
//! kind of process, so that split collapses: [`Cluster<T>`] plays
//! both roles, and [`catalog::get_or_create`] stands in for the
//! shared-catalog lookup a multi-process backend would need.
//!
//! Cross-process staleness (a creator process dying while its entry
//! is still indexed) becomes cross-thread staleness here: every entry
//! remembers the [`ThreadId`] that added it, and lookups/inserts take
//! a liveness probe closure to evict entries whose owner is gone,
//! mirroring `cluster_probe`'s `copperplate_probe_node` call.

pub mod catalog;
mod syncluster;

pub use syncluster::Syncluster;

use dashmap::DashMap;

use crate::common::ThreadId;
use crate::error::{CopperplateError, Result};

struct Entry<T> {
    owner: ThreadId,
    value: std::sync::Arc<T>,
}

/// A named table of objects of one kind, indexed by string key.
pub struct Cluster<T> {
    name: String,
    table: DashMap<String, Entry<T>>,
}

impl<T> Cluster<T> {
    pub fn new(name: &str) -> Self {
        Cluster {
            name: name.to_string(),
            table: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Indexes `value` under `key`, owned by `owner`. If a conflicting
    /// live entry already exists, returns [`CopperplateError::Exists`];
    /// a stale entry (owner no longer alive per `is_alive`) is quietly
    /// dropped and overwritten, matching `cluster_addobj`'s probe-and-
    /// overwrite behaviour.
    pub fn add_obj(
        &self,
        key: &str,
        owner: ThreadId,
        value: std::sync::Arc<T>,
        is_alive: impl Fn(ThreadId) -> bool,
    ) -> Result<()> {
        if let Some(existing) = self.table.get(key) {
            if is_alive(existing.owner) {
                return Err(CopperplateError::Exists(key.to_string()));
            }
        }
        self.table.insert(key.to_string(), Entry { owner, value });
        Ok(())
    }

    /// Same as [`Cluster::add_obj`], but never rejects on a live
    /// conflicting key - the newest entry simply shadows the previous
    /// one, matching `cluster_addobj_dup`'s admission of duplicate
    /// keys among live objects. Shadowed entries are gone, not
    /// queued; this runtime has no use for retrieving superseded
    /// duplicates.
    pub fn add_obj_dup(&self, key: &str, owner: ThreadId, value: std::sync::Arc<T>) {
        self.table.insert(key.to_string(), Entry { owner, value });
    }

    pub fn del_obj(&self, key: &str) -> Option<std::sync::Arc<T>> {
        self.table.remove(key).map(|(_, e)| e.value)
    }

    /// Looks up `key`, silently discarding (and reporting as a miss)
    /// an entry whose owning thread is no longer alive, matching
    /// `cluster_findobj`'s probe-and-discard behaviour.
    pub fn find_obj(&self, key: &str, is_alive: impl Fn(ThreadId) -> bool) -> Option<std::sync::Arc<T>> {
        let stale = match self.table.get(key) {
            Some(entry) if !is_alive(entry.owner) => true,
            Some(entry) => return Some(entry.value.clone()),
            None => return None,
        };
        if stale {
            tracing::debug!(cluster = %self.name, key, "evicting stale entry");
            self.table.remove(key);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_alive(_: ThreadId) -> bool {
        true
    }

    fn never_alive(_: ThreadId) -> bool {
        false
    }

    #[test]
    fn add_then_find_roundtrips() {
        let c: Cluster<i32> = Cluster::new("widgets");
        c.add_obj("a", ThreadId(1), std::sync::Arc::new(42), always_alive)
            .unwrap();
        assert_eq!(*c.find_obj("a", always_alive).unwrap(), 42);
    }

    #[test]
    fn conflicting_live_entry_is_rejected() {
        let c: Cluster<i32> = Cluster::new("widgets");
        c.add_obj("a", ThreadId(1), std::sync::Arc::new(1), always_alive)
            .unwrap();
        let err = c
            .add_obj("a", ThreadId(2), std::sync::Arc::new(2), always_alive)
            .unwrap_err();
        assert!(matches!(err, CopperplateError::Exists(_)));
    }

    #[test]
    fn stale_entry_is_evicted_on_insert_and_lookup() {
        let c: Cluster<i32> = Cluster::new("widgets");
        c.add_obj("a", ThreadId(1), std::sync::Arc::new(1), always_alive)
            .unwrap();
        // Owner is now gone: a lookup should silently discard it.
        assert!(c.find_obj("a", never_alive).is_none());
        assert!(c.is_empty());

        c.add_obj("a", ThreadId(1), std::sync::Arc::new(1), always_alive)
            .unwrap();
        // And an insert attempt against a stale owner should overwrite.
        c.add_obj("a", ThreadId(2), std::sync::Arc::new(9), never_alive)
            .unwrap();
        assert_eq!(*c.find_obj("a", always_alive).unwrap(), 9);
    }
}
