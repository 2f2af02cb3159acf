//! Configuration Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories. None of these are worth retrying: the
/// configuration has to be fixed.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// The file extension does not name a supported format.
    #[display("unsupported configuration format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// The layered sources could not be merged into a configuration.
    #[display("invalid configuration")]
    Invalid,
    /// A value parsed but is out of range.
    #[display("invalid value for {_0}: {_1}")]
    InvalidValue(#[error(not(source))] &'static str, #[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
