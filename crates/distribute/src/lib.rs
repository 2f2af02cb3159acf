//! Task distribution between a master node and its workers.
//!
//! The [`TaskJar`] is a bounded FIFO queue of [`Task`]s. Producers wait while
//! it is full, consumers wait while it is empty, and every task is handed to
//! exactly one consumer. The [`transport`] module moves tasks from a master's
//! jar into the local jars of remote workers over TCP.

pub mod error;
mod jar;
mod task;
pub mod transport;

pub use crate::jar::{DEFAULT_CAPACITY, TaskJar};
pub use crate::task::Task;
