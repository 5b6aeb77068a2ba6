//! Error types for the fibrous runtime
//!
//! Recoverable failures only: resource exhaustion at thread or poller
//! creation. Timed waits report expiry through their `bool` return value
//! rather than an error. Violated runtime invariants (double resume,
//! releasing an unowned mutex, posting a one-shot flag twice) are programming
//! errors and panic with a diagnostic instead of returning an error.

use thiserror::Error;

/// Main error type for fibrous operations
#[derive(Error, Debug)]
pub enum Error {
    /// Fiber or worker creation failed (resource exhaustion)
    #[error("failed to spawn: {reason}")]
    Spawn {
        /// Reason for the spawn failure
        reason: String,
    },

    /// Runtime-level failure
    #[error("runtime error: {reason}")]
    Runtime {
        /// Reason for the runtime failure
        reason: String,
    },

    /// Readiness-poller setup or registration failed
    #[error("event scope I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient result type alias
pub type Result<T> = std::result::Result<T, Error>;
