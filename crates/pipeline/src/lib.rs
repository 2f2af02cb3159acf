//! Batching output pipeline.
//!
//! Rules emit [`DataCell`]s (one extracted record each) and [`FileCell`]s
//! (binary artifacts) into a [`Collector`]. The collector gathers records into
//! batches of a configured size and hands each full batch to a background
//! drain worker, which prepares it (see [`Batch`]) and writes it to the
//! currently selected [`Sink`].
//!
//! # Sinks
//! Sinks are looked up by output type in a [`SinkRegistry`] that is assembled
//! once at startup. The provided ones are:
//! - `bolt`: [`BoltSink`], the embedded bucket store.
//! - `csv`: [`CsvSink`], one CSV file per batch.
//! - `kafka`, `mongo`, `mysql`: [`ExternalSink`], delegating to an injected
//!   [`ExternalClient`].
//!
//! A failing or panicking sink loses the batch it was given, and nothing
//! else: the drain worker logs it, counts it, and carries on.

mod batch;
mod cell;
mod collector;
pub mod error;
mod files;
mod sink;

pub use crate::batch::{Batch, Record, sanitize};
pub use crate::cell::{DataCell, FileCell};
pub use crate::collector::{Collector, DEFAULT_DOCKER_CAP, DrainReport, OutputConfig};
#[cfg(any(test, feature = "mock"))]
pub use crate::sink::MemorySink;
pub use crate::sink::{
    BoltSink, CsvSink, ExternalClient, ExternalSink, Sink, SinkHandle, SinkRegistry, SinkRegistryBuilder,
};
