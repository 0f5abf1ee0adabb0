//! Shared arena allocator.
//!
//! An internal representation module (`extent`) plus the public-facing
//! type (`heap_memory::HeapMemory`) re-exported at this level.

mod extent;
mod heap_memory;

pub use heap_memory::{BlockHandle, HeapMemory};
pub use extent::{MIN_ALIGN, PAGE_SIZE};
