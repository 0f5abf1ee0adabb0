//! Shared types used across the runtime's subsystems.
//!
//! Kept deliberately small: identifiers and small value types that more
//! than one module needs.

use std::fmt;

/// Maximum length of an object name in a cluster, matching
/// `XNOBJECT_NAME_LEN` in the original sources.
pub const OBJECT_NAME_LEN: usize = 32;

/// Identifier for a live thread object, unique for the life of the
/// process (monotonically assigned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid#{}", self.0)
    }
}

/// Identifier for a session binding a process group to one arena, one
/// catalog, and one registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub String);

impl Default for SessionId {
    fn default() -> Self {
        SessionId("anon".to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Truncates (never panics) a name to the object name length limit,
/// matching the original's fixed-size NUL-terminated name buffers.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= OBJECT_NAME_LEN {
        name.to_string()
    } else {
        name.chars().take(OBJECT_NAME_LEN).collect()
    }
}
