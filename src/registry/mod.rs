//! Registry / virtual filesystem: a user-space view of
//! live objects, one directory per session and one file per
//! registered object.
//!
//! Ported from `lib/copperplate/registry.c`, which mounts a FUSE
//! filesystem at `--registry-mountpt` and answers `read`/`write` on
//! each object's file by calling back into an object-specific
//! `fops`. Real FUSE mounting is an OS-facing concern with no bearing
//! on the runtime's own invariants, and it never sits on the fast
//! path, so this port keeps the contract — a tree of directories and
//! files, backed by per-object drivers — without shelling out to a
//! FUSE crate; a future caller can expose the same [`Registry`] over a
//! real filesystem by walking it with `readdir` and forwarding
//! `read`/`write` to [`ObjectDriver`].
//!
//! Disabled by `--no-registry` (see [`crate::runtime::config`]), exactly
//! as `registry_pkg_init` is skipped by `__no_registry_arg`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CopperplateError, Result};

/// Per-object callback pair backing one registry file, matching
/// `struct fsobj_fops`. `write` is optional: most objects are
/// read-only state snapshots (`registry_add_file` with a fixed
/// formatter), matching `read`-only drivers that pass a null `write`.
pub trait ObjectDriver: Send + Sync {
    /// Renders the object's current state as a human-readable
    /// snapshot, matching the `read` callback invoked on a `cat` of
    /// the object's registry file.
    fn read(&self) -> String;

    /// Dispatches a write to the object's handler, matching the
    /// `write` callback. The default rejects writes, i.e. read-only,
    /// matching the common case in the source.
    fn write(&self, _data: &str) -> Result<()> {
        Err(CopperplateError::NotPermitted(
            "registry object is read-only".into(),
        ))
    }
}

enum Node {
    Dir(BTreeMap<String, Node>),
    File(Arc<dyn ObjectDriver>),
}

/// A session-scoped virtual filesystem view of live runtime objects.
/// Matches `struct regfs_dir`/`struct regfs_file`'s tree, minus the
/// FUSE plumbing: [`Registry::add_dir`], [`Registry::add_file`],
/// [`Registry::remove`], [`Registry::read_file`], and
/// [`Registry::write_file`] are the whole contract a mount layer
/// needs.
pub struct Registry {
    root: Mutex<Node>,
}

fn split_path(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            root: Mutex::new(Node::Dir(BTreeMap::new())),
        }
    }

    /// Creates every missing directory component of `path`, matching
    /// `registry_add_dir`'s on-demand parent creation.
    pub fn add_dir(&self, path: &str) -> Result<()> {
        let parts = split_path(path);
        let mut root = self.root.lock();
        let mut cur = &mut *root;
        for part in parts {
            match cur {
                Node::Dir(children) => {
                    cur = children
                        .entry(part.to_string())
                        .or_insert_with(|| Node::Dir(BTreeMap::new()));
                }
                Node::File(_) => {
                    return Err(CopperplateError::InvalidArgument(
                        "path component is a file, not a directory".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Registers `driver` as a file at `path`, matching
    /// `registry_add_file`. The parent directory must already exist
    /// (the source's same requirement - callers create directories
    /// top-down as objects are created).
    pub fn add_file(&self, path: &str, driver: Arc<dyn ObjectDriver>) -> Result<()> {
        let mut parts = split_path(path);
        let name = parts
            .pop()
            .ok_or_else(|| CopperplateError::InvalidArgument("empty registry path".into()))?;
        let mut root = self.root.lock();
        let mut cur = &mut *root;
        for part in parts {
            match cur {
                Node::Dir(children) => {
                    cur = children
                        .get_mut(part)
                        .ok_or_else(|| CopperplateError::NotFound(path.to_string()))?;
                }
                Node::File(_) => return Err(CopperplateError::NotFound(path.to_string())),
            }
        }
        match cur {
            Node::Dir(children) => {
                children.insert(name.to_string(), Node::File(driver));
                Ok(())
            }
            Node::File(_) => Err(CopperplateError::InvalidArgument(
                "parent path component is a file".into(),
            )),
        }
    }

    /// Unregisters whatever lives at `path` (file or, if empty,
    /// directory), matching `registry_remove_file`/`registry_remove_dir`.
    pub fn remove(&self, path: &str) -> Result<()> {
        let mut parts = split_path(path);
        let name = parts
            .pop()
            .ok_or_else(|| CopperplateError::InvalidArgument("empty registry path".into()))?;
        let mut root = self.root.lock();
        let mut cur = &mut *root;
        for part in parts {
            match cur {
                Node::Dir(children) => {
                    cur = children
                        .get_mut(part)
                        .ok_or_else(|| CopperplateError::NotFound(path.to_string()))?;
                }
                Node::File(_) => return Err(CopperplateError::NotFound(path.to_string())),
            }
        }
        match cur {
            Node::Dir(children) => children
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| CopperplateError::NotFound(path.to_string())),
            Node::File(_) => Err(CopperplateError::NotFound(path.to_string())),
        }
    }

    fn lookup_file<'a>(root: &'a Node, path: &str) -> Result<&'a Arc<dyn ObjectDriver>> {
        let parts = split_path(path);
        let mut cur = root;
        for (i, part) in parts.iter().enumerate() {
            match cur {
                Node::Dir(children) => {
                    cur = children
                        .get(*part)
                        .ok_or_else(|| CopperplateError::NotFound(path.to_string()))?;
                }
                Node::File(driver) if i + 1 == parts.len() => return Ok(driver),
                Node::File(_) => return Err(CopperplateError::NotFound(path.to_string())),
            }
        }
        match cur {
            Node::File(driver) => Ok(driver),
            Node::Dir(_) => Err(CopperplateError::InvalidArgument(
                "path refers to a directory".into(),
            )),
        }
    }

    /// A `cat <mountpoint>/<path>` would return this: the object's
    /// current state snapshot via its driver's `read`.
    pub fn read_file(&self, path: &str) -> Result<String> {
        let root = self.root.lock();
        Self::lookup_file(&root, path).map(|d| d.read())
    }

    /// A write to `<mountpoint>/<path>` dispatches here, matching the
    /// FUSE `write` op forwarding into the object's `fops->write`.
    pub fn write_file(&self, path: &str, data: &str) -> Result<()> {
        let root = self.root.lock();
        Self::lookup_file(&root, path)?.write(data)
    }

    /// Lists the entry names directly under `path`, matching a
    /// `readdir` of the mount point.
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let parts = split_path(path);
        let root = self.root.lock();
        let mut cur = &*root;
        for part in parts {
            match cur {
                Node::Dir(children) => {
                    cur = children
                        .get(part)
                        .ok_or_else(|| CopperplateError::NotFound(path.to_string()))?;
                }
                Node::File(_) => return Err(CopperplateError::NotFound(path.to_string())),
            }
        }
        match cur {
            Node::Dir(children) => Ok(children.keys().cloned().collect()),
            Node::File(_) => Err(CopperplateError::InvalidArgument(
                "path refers to a file".into(),
            )),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(std::sync::atomic::AtomicU64);

    impl ObjectDriver for Counter {
        fn read(&self) -> String {
            self.0.load(std::sync::atomic::Ordering::Relaxed).to_string()
        }

        fn write(&self, data: &str) -> Result<()> {
            let v: u64 = data
                .trim()
                .parse()
                .map_err(|_| CopperplateError::InvalidArgument("not a number".into()))?;
            self.0.store(v, std::sync::atomic::Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn files_require_an_existing_parent_directory() {
        let reg = Registry::new();
        let err = reg
            .add_file("/threads/t1", Arc::new(Counter(0.into())))
            .unwrap_err();
        assert!(matches!(err, CopperplateError::NotFound(_)));
    }

    #[test]
    fn add_read_write_roundtrip() {
        let reg = Registry::new();
        reg.add_dir("/threads").unwrap();
        reg.add_file("/threads/t1", Arc::new(Counter(7.into()))).unwrap();
        assert_eq!(reg.read_file("/threads/t1").unwrap(), "7");
        reg.write_file("/threads/t1", "42").unwrap();
        assert_eq!(reg.read_file("/threads/t1").unwrap(), "42");
    }

    #[test]
    fn list_dir_reports_children() {
        let reg = Registry::new();
        reg.add_dir("/threads").unwrap();
        reg.add_file("/threads/t1", Arc::new(Counter(0.into()))).unwrap();
        reg.add_file("/threads/t2", Arc::new(Counter(0.into()))).unwrap();
        let mut names = reg.list_dir("/threads").unwrap();
        names.sort();
        assert_eq!(names, vec!["t1", "t2"]);
    }

    #[test]
    fn remove_drops_the_entry() {
        let reg = Registry::new();
        reg.add_dir("/threads").unwrap();
        reg.add_file("/threads/t1", Arc::new(Counter(0.into()))).unwrap();
        reg.remove("/threads/t1").unwrap();
        assert!(reg.read_file("/threads/t1").is_err());
    }

    #[test]
    fn read_only_driver_rejects_writes() {
        struct ReadOnly;
        impl ObjectDriver for ReadOnly {
            fn read(&self) -> String {
                "state".into()
            }
        }
        let reg = Registry::new();
        reg.add_dir("/x").unwrap();
        reg.add_file("/x/obj", Arc::new(ReadOnly)).unwrap();
        assert!(reg.write_file("/x/obj", "anything").is_err());
    }
}
