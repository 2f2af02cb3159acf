//! Distributed crawling framework.
//!
//! A master node splits crawl requests into tasks and queues them in a
//! [`TaskJar`](trawl_distribute::TaskJar); worker units (local, or on remote
//! worker nodes) pull tasks, run the matching [`Spider`](spider::Spider)
//! against pages fetched by a [`Downloader`](downloader::Downloader), and emit
//! records into a [`Collector`](trawl_pipeline::Collector) that batches them
//! into the configured sink.
//!
//! # Crates
//! - `trawl-distribute`: tasks, the task jar, master/worker hand-off.
//! - `trawl-pipeline`: records, the collector, sinks.
//! - `trawl-buckets`: the embedded bucket store (also used for request
//!   history).
//! - `trawl-config`: layered configuration.

pub mod downloader;
pub mod error;
pub mod history;
pub mod node;
pub mod spider;
pub mod submit;
pub mod worker;
