use async_trait::async_trait;
use exn::ResultExt;
use trawl_buckets::{Item, Store};

use crate::Sink;
use crate::batch::{Batch, sanitize};
use crate::error::{ErrorKind, Result};

/// Writes batches into the embedded bucket store.
///
/// Each namespace gets its own bucket (the sanitized namespace name), and each
/// batch becomes one item keyed by [`Batch::storage_key`] whose value is the
/// JSON array of its records.
#[derive(Debug, Clone)]
pub struct BoltSink {
    store: Store,
}

impl BoltSink {
    pub const NAME: &'static str = "bolt";

    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Sink for BoltSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn drain(&self, batch: &Batch) -> Result<()> {
        let bucket = sanitize(&batch.namespace);
        let key = batch.storage_key();
        let value = serde_json::to_vec(&batch.records).or_raise(|| ErrorKind::Serialize)?;
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.bucket(&bucket)?.insert([Item::new(key, value)]))
            .await
            .or_raise(|| ErrorKind::SinkPanicked(Self::NAME.to_string()))?
            .or_raise(|| ErrorKind::Storage)?;
        tracing::debug!(namespace = %batch.namespace, records = batch.len(), "wrote batch to bucket store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Record;
    use serde_json::{Value, json};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_batches_land_in_namespace_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("out.db")).unwrap();
        let sink = BoltSink::new(store.clone());
        let mut batch = Batch {
            namespace: "news/daily".into(),
            key: "rust".into(),
            run: 1700000000,
            sequence: 0,
            records: vec![record(json!({"title": "a"})), record(json!({"title": "b"}))],
        };
        sink.drain(&batch).await.unwrap();
        batch.sequence = 1;
        batch.records = vec![record(json!({"title": "c"}))];
        sink.drain(&batch).await.unwrap();

        let bucket = store.bucket("news_daily").unwrap();
        let items = bucket.prefix_items("rust/").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key, b"rust/1700000000/00000000");
        let first: Value = serde_json::from_slice(&items[0].value).unwrap();
        assert_eq!(first, json!([{"title": "a"}, {"title": "b"}]));
        let second: Value = serde_json::from_slice(&items[1].value).unwrap();
        assert_eq!(second, json!([{"title": "c"}]));
    }

    #[tokio::test]
    async fn test_closed_store_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("out.db")).unwrap();
        let sink = BoltSink::new(store.clone());
        store.close();
        let batch = Batch { namespace: "n".into(), key: "k".into(), run: 0, sequence: 0, records: Vec::new() };
        let err = sink.drain(&batch).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Storage));
    }
}
