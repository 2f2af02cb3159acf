//! Bucket Store Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A bucket store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for bucket store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// The store never retries on its own; what to do with each of these is up to
/// the caller.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The file exists but could not be opened as a database.
    #[display("could not open database: {}", _0.display())]
    Open(#[error(not(source))] PathBuf),
    /// Another handle (in this process or another) holds the file lock.
    #[display("timed out waiting for database lock: {}", _0.display())]
    LockTimeout(#[error(not(source))] PathBuf),
    /// The handle was closed, or a compaction could not reopen the file.
    #[display("database is closed")]
    Closed,
    #[display("bucket not found: {_0}")]
    BucketNotFound(#[error(not(source))] String),
    /// Transaction, table or commit failure inside the storage engine.
    #[display("storage engine error")]
    Storage,
    #[display("I/O error")]
    Io,
    /// Compaction failed before the original file was replaced; the original
    /// remains authoritative.
    #[display("compaction failed: {}", _0.display())]
    Compaction(#[error(not(source))] PathBuf),
    /// A caller-supplied scan callback returned an error.
    #[display("scan callback failed")]
    Callback,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::Io)
    }
}
