use async_trait::async_trait;
use exn::ResultExt;
use std::fmt;
use std::sync::Arc;

use crate::Sink;
use crate::batch::{Batch, Record, sanitize};
use crate::error::{ErrorKind, Result};

/// Connection to an external system (message broker, document store,
/// relational database) that records can be written to.
///
/// Concrete clients live outside this crate; they are injected when the
/// [`SinkRegistry`](crate::SinkRegistry) is assembled.
#[async_trait]
pub trait ExternalClient: Send + Sync {
    /// Write `records` under `namespace` (topic, collection or table name,
    /// already sanitized), tagged with the data `key`.
    async fn write(&self, namespace: &str, key: &str, records: &[Record]) -> Result<()>;

    /// Reconnect, or reset pooled resources.
    async fn refresh(&self) -> Result<()>;
}

/// Sink backed by an [`ExternalClient`].
#[derive(Clone)]
pub struct ExternalSink {
    name: String,
    client: Arc<dyn ExternalClient>,
}

impl fmt::Debug for ExternalSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalSink").field("name", &self.name).finish_non_exhaustive()
    }
}

impl ExternalSink {
    pub fn new(name: impl Into<String>, client: Arc<dyn ExternalClient>) -> Self {
        Self { name: name.into(), client }
    }

    pub fn kafka(client: Arc<dyn ExternalClient>) -> Self {
        Self::new("kafka", client)
    }

    pub fn mongo(client: Arc<dyn ExternalClient>) -> Self {
        Self::new("mongo", client)
    }

    pub fn mysql(client: Arc<dyn ExternalClient>) -> Self {
        Self::new("mysql", client)
    }
}

#[async_trait]
impl Sink for ExternalSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn drain(&self, batch: &Batch) -> Result<()> {
        let namespace = sanitize(&batch.namespace);
        self.client
            .write(&namespace, &batch.key, &batch.records)
            .await
            .or_raise(|| ErrorKind::Sink(self.name.clone()))?;
        tracing::debug!(sink = %self.name, namespace = %namespace, records = batch.len(), "wrote batch");
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        tracing::info!(sink = %self.name, "refreshing external connection");
        self.client.refresh().await.or_raise(|| ErrorKind::Refresh(self.name.clone()))
    }
}
