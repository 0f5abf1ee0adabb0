//! Copperplate: a user-space real-time application runtime layered
//! over a POSIX threading substrate.
//!
//! This crate implements the portable core shared by every RTOS-style
//! skin a higher-level façade might expose (tasks, semaphores, event
//! flags, message queues, ...): a shared arena allocator suitable for
//! cross-process object sharing ([`heap`]), a clustered naming
//! registry for discovering named objects within a session
//! ([`cluster`]), a thread-object abstraction with cooperative
//! suspension, priority, round-robin, and periodic timing
//! ([`thread`]), a complex monitor serializing pend/post/drain/flush
//! waits ([`syncobj`]), and a timer dispatcher serializing expiry
//! callbacks on a dedicated thread ([`timer`]). Skin-facing APIs
//! (tasks, semaphores, events, ...) are out of scope: this crate is
//! the foundation they would be built on, not the skins themselves.

pub mod clock;
pub mod cluster;
pub mod common;
pub mod error;
pub mod heap;
pub mod notifier;
pub mod registry;
pub mod runtime;
pub mod syncobj;
pub mod thread;
pub mod timer;

pub use error::{CopperplateError, Result};

/// Crate version, exposed for banners and registry snapshots.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
