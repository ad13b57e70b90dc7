//! Error types for depot.
//!
//! These cover construction and embedding failures (segment setup, broker
//! configuration). Per-request failures never surface here: they travel
//! in-band as [`Status`](crate::protocol::Status) codes in responses, and
//! internal bookkeeping corruption aborts the process instead of unwinding
//! into recoverable errors.

use thiserror::Error;

/// Result type alias using depot's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for depot construction and embedding.
#[derive(Error, Debug)]
pub enum Error {
    /// Backing memory could not be created.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid memory segment operation.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
