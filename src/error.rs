//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds a Copperplate-style runtime reports at its
//! public boundary: the core never unwinds on error, every operation
//! returns a `Result`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CopperplateError {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("object deleted while waiting")]
    Deleted,

    #[error("operation timed out")]
    TimedOut,

    #[error("wait interrupted by flush")]
    Interrupted,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation not permitted in this context: {0}")]
    NotPermitted(String),

    #[error("name already exists: {0}")]
    Exists(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("resource busy")]
    Busy,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<std::io::Error> for CopperplateError {
    fn from(e: std::io::Error) -> Self {
        CopperplateError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CopperplateError>;
