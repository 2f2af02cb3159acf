//! Per-task request history, persisted in the bucket store.
//!
//! Successful requests are remembered by fingerprint so that later runs of
//! the same (spider, keyin) pair can skip them; failed requests are stored in
//! full so they can be retried.

use exn::ResultExt;
use tokio::task::spawn_blocking;
use trawl_buckets::{Bucket, Store};

use crate::downloader::Request;
use crate::error::{ErrorKind, Result};
use crate::spider::Assignment;

/// Success and failure record of one (spider, keyin) pair.
#[derive(Debug, Clone)]
pub struct History {
    success: Bucket,
    failure: Bucket,
}

impl History {
    /// Open (creating if needed) the history buckets for `spider` and
    /// `keyin`.
    pub async fn open(store: &Store, spider: &str, keyin: &str) -> Result<Self> {
        let store = store.clone();
        let success = format!("history/success/{spider}/{keyin}");
        let failure = format!("history/failure/{spider}/{keyin}");
        blocking(move || {
            Ok(Self {
                success: store.bucket(&success).or_raise(|| ErrorKind::Storage)?,
                failure: store.bucket(&failure).or_raise(|| ErrorKind::Storage)?,
            })
        })
        .await
    }

    /// Apply the inherit flags of `assignment` and return the requests that
    /// failed last time, to be retried first.
    ///
    /// Without success inheritance every request is fetched again. Without
    /// failure inheritance old failures are forgotten.
    pub async fn prepare(&self, assignment: &Assignment) -> Result<Vec<Request>> {
        let history = self.clone();
        let (success_inherit, failure_inherit) = (assignment.success_inherit, assignment.failure_inherit);
        blocking(move || {
            if !success_inherit {
                let cleared = history.success.clear().or_raise(|| ErrorKind::Storage)?;
                tracing::debug!(bucket = %history.success.name(), cleared, "forgot successful requests");
            }
            if !failure_inherit {
                let cleared = history.failure.clear().or_raise(|| ErrorKind::Storage)?;
                tracing::debug!(bucket = %history.failure.name(), cleared, "forgot failed requests");
                return Ok(Vec::new());
            }
            let mut retries = Vec::new();
            for item in history.failure.items().or_raise(|| ErrorKind::Storage)? {
                match serde_json::from_slice::<Request>(&item.value) {
                    Ok(request) => retries.push(request),
                    Err(err) => {
                        tracing::warn!(bucket = %history.failure.name(), error = %err, "skipping unreadable failure")
                    },
                }
            }
            Ok(retries)
        })
        .await
    }

    pub async fn has_succeeded(&self, request: &Request) -> Result<bool> {
        let success = self.success.clone();
        let fingerprint = request.fingerprint();
        blocking(move || Ok(success.get(fingerprint).or_raise(|| ErrorKind::Storage)?.is_some())).await
    }

    /// Remember `request` as done, and drop any earlier failure of it.
    pub async fn record_success(&self, request: &Request) -> Result<()> {
        let history = self.clone();
        let fingerprint = request.fingerprint();
        blocking(move || {
            history.success.put_nx(&fingerprint, b"").or_raise(|| ErrorKind::Storage)?;
            history.failure.delete(&fingerprint).or_raise(|| ErrorKind::Storage)?;
            Ok(())
        })
        .await
    }

    /// Remember `request` as failed, so that the next run retries it.
    pub async fn record_failure(&self, request: &Request) -> Result<()> {
        let failure = self.failure.clone();
        let fingerprint = request.fingerprint();
        let value = serde_json::to_vec(request).or_raise(|| ErrorKind::Storage)?;
        blocking(move || failure.put(fingerprint, value).or_raise(|| ErrorKind::Storage)).await
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    spawn_blocking(f).await.or_raise(|| ErrorKind::Storage)?
}
