//! Embedded key/value store partitioned into named buckets.
//!
//! A [`Store`] owns a single database file (exclusively, while open). Inside it,
//! every [`Bucket`] is an independent, lexicographically ordered map of byte
//! string keys to byte string values. Every mutation runs in its own write
//! transaction, so a multi-item [`Bucket::insert`] either lands completely or
//! not at all.
//!
//! # Architecture
//! - [`Store`] is a cheap, cloneable handle. All clones (and all buckets taken
//!   from them) share the same underlying database, so a compaction that
//!   swaps the file is observed by everyone.
//! - [`Bucket`] is a name plus a store handle. It does not keep a transaction
//!   open between calls; a bucket deleted through [`Store::delete_bucket`]
//!   reports [`ErrorKind::BucketNotFound`](crate::error::ErrorKind::BucketNotFound)
//!   until it is recreated.
//! - [`Scanner`] describes a prefix or range over a bucket and can be
//!   evaluated as many times as needed.
//!
//! Operations are synchronous. Async callers should run them on a blocking
//! thread (`tokio::task::spawn_blocking`).

mod bucket;
mod db;
pub mod error;
mod item;
mod scan;

pub use crate::bucket::Bucket;
pub use crate::db::{DEFAULT_LOCK_TIMEOUT, Store};
pub use crate::item::Item;
pub use crate::scan::{ScanIter, Scanner};
