//! In-memory sink for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Sink;
use crate::batch::{Batch, Record};
use crate::error::Result;

/// Sink that keeps every batch it is given.
///
/// Ideal for tests that need to see exactly what a collector drained without
/// touching the filesystem.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    batches: Mutex<Vec<Batch>>,
    refreshes: AtomicUsize,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), batches: Mutex::new(Vec::new()), refreshes: AtomicUsize::new(0) }
    }

    /// Every batch drained so far, in drain order.
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    /// Every record drained so far, in drain order.
    pub fn records(&self) -> Vec<Record> {
        self.batches.lock().iter().flat_map(|batch| batch.records.clone()).collect()
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn drain(&self, batch: &Batch) -> Result<()> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
