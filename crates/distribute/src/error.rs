//! Task Distribution Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A task distribution error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for task distribution operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// Queue operations themselves only wait; the first two variants are the
/// outcomes of waits the caller chose to bound.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The caller's cancellation token fired while waiting.
    #[display("cancelled while waiting for a task")]
    Cancelled,
    /// The caller's deadline passed while waiting.
    #[display("timed out waiting for a task")]
    TimedOut,
    /// Every handle on the other side of the queue is gone.
    #[display("task jar closed")]
    Closed,
    #[display("invalid task encoding")]
    Codec,
    #[display("could not connect to master at {_0}")]
    Connect(#[error(not(source))] String),
    #[display("connection to master lost")]
    Disconnected,
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Connect(_) | Self::Disconnected | Self::Io)
    }
}
