//! Sink trait, the registry of output types, and the provided sinks.

mod bolt;
mod csv;
mod external;
#[cfg(any(test, feature = "mock"))]
mod memory;

pub use self::bolt::BoltSink;
pub use self::csv::CsvSink;
pub use self::external::{ExternalClient, ExternalSink};
#[cfg(any(test, feature = "mock"))]
pub use self::memory::MemorySink;
use crate::batch::Batch;
use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Destination for drained batches.
///
/// A sink is called by one drain worker at a time per collector, but the same
/// sink may be shared by many collectors, so implementations must be safe to
/// call concurrently. Each call runs in its own task: an error or a panic
/// loses that one batch and nothing else.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Output type this sink is registered under (e.g. `"csv"`).
    fn name(&self) -> &str;

    /// Write one prepared batch.
    async fn drain(&self, batch: &Batch) -> Result<()>;

    /// Reconnect, or reset any pooled resources. Called when the output
    /// configuration changes at runtime. Default implementation does nothing.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

pub type SinkHandle = Arc<dyn Sink + Send + Sync>;

/// Table of output types, assembled once at startup.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    sinks: BTreeMap<String, SinkHandle>,
}

impl fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRegistry").field("sinks", &self.names()).finish()
    }
}

impl SinkRegistry {
    pub fn builder() -> SinkRegistryBuilder {
        SinkRegistryBuilder::default()
    }

    /// Look up the sink for an output type. An unknown output type is a
    /// configuration error.
    pub fn get(&self, name: &str) -> Result<SinkHandle> {
        match self.sinks.get(name) {
            Some(sink) => Ok(Arc::clone(sink)),
            None => exn::bail!(ErrorKind::UnknownOutput(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    /// Registered output types, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.sinks.keys().map(String::as_str).collect()
    }

    /// Invoke the refresh hook of the named sink.
    pub async fn refresh(&self, name: &str) -> Result<()> {
        let sink = self.get(name)?;
        sink.refresh().await
    }
}

#[derive(Default)]
pub struct SinkRegistryBuilder {
    sinks: BTreeMap<String, SinkHandle>,
}

impl SinkRegistryBuilder {
    /// Register `sink` under its own [`name`](Sink::name).
    pub fn register(self, sink: impl Sink + 'static) -> Self {
        self.register_handle(Arc::new(sink))
    }

    /// Register an already shared sink. A later registration under the same
    /// name replaces an earlier one.
    pub fn register_handle(mut self, sink: SinkHandle) -> Self {
        let name = sink.name().to_string();
        if self.sinks.insert(name.clone(), sink).is_some() {
            tracing::warn!(sink = %name, "replacing previously registered sink");
        }
        self
    }

    pub fn build(self) -> SinkRegistry {
        SinkRegistry { sinks: self.sinks }
    }
}
