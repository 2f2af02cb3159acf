//! Output Pipeline Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// An output pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for output pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No sink is registered under this output type. Configuration error.
    #[display("unknown output type: {_0}")]
    UnknownOutput(#[error(not(source))] String),
    /// Drains need a non-empty data key. Configuration error.
    #[display("missing data key for namespace {_0}")]
    MissingDataKey(#[error(not(source))] String),
    #[display("invalid batch capacity")]
    InvalidCapacity,
    /// The collector has been stopped and accepts no more data.
    #[display("collector stopped")]
    Stopped,
    /// A sink reported a failure while draining.
    #[display("sink {_0} failed")]
    Sink(#[error(not(source))] String),
    /// A sink panicked while draining; the panic was contained.
    #[display("sink {_0} panicked")]
    SinkPanicked(#[error(not(source))] String),
    #[display("refreshing sink {_0} failed")]
    Refresh(#[error(not(source))] String),
    #[display("could not serialize records")]
    Serialize,
    #[display("storage error")]
    Storage,
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Sink(_) | Self::Refresh(_) | Self::Storage | Self::Io)
    }
}
