//! Node Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors from the other trawl crates
//! are wrapped (with `or_raise`) into the category that matters to the node.

use derive_more::{Display, Error};

/// A node error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("bucket store error")]
    Storage,
    #[display("task queue error")]
    Queue,
    #[display("output pipeline error")]
    Pipeline,
    #[display("task transport error")]
    Transport,
    /// The downloader could not fetch a page.
    #[display("download failed: {_0}")]
    Download(#[error(not(source))] String),
    /// A spider failed to parse a page.
    #[display("spider {_0} failed to parse page")]
    Parse(#[error(not(source))] String),
    #[display("unknown spider: {_0}")]
    UnknownSpider(#[error(not(source))] String),
    #[display("invalid task payload")]
    InvalidPayload,
    /// A submission named no spiders.
    #[display("nothing to submit")]
    EmptySubmission,
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Download(_) | Self::Transport | Self::Io)
    }
}
