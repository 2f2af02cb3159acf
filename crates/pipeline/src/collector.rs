use exn::{OptionExt, ResultExt};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use time::UtcDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::batch::Batch;
use crate::cell::{DataCell, FileCell};
use crate::error::{ErrorKind, Result};
use crate::files::write_file;
use crate::sink::{SinkHandle, SinkRegistry};

/// Default number of records per batch.
pub const DEFAULT_DOCKER_CAP: usize = 10_000;
// Full batches waiting for the drain worker before collectors have to wait.
const QUEUE_DEPTH: usize = 4;

/// How one collector batches and where it drains to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Output type, looked up in the [`SinkRegistry`].
    pub out_type: String,
    /// Records per batch.
    pub docker_cap: usize,
    /// Bucket, folder, topic or table the records belong to.
    pub namespace: String,
    /// Partition key stamped on every batch. Must not be empty.
    pub data_key: String,
    /// Keep `Url`, `ParentUrl` and `DownloadTime` in drained records.
    pub keep_default_fields: bool,
    /// Root directory for file artifacts.
    pub file_dir: PathBuf,
}

impl OutputConfig {
    pub fn new(out_type: impl Into<String>, namespace: impl Into<String>, data_key: impl Into<String>) -> Self {
        Self {
            out_type: out_type.into(),
            docker_cap: DEFAULT_DOCKER_CAP,
            namespace: namespace.into(),
            data_key: data_key.into(),
            keep_default_fields: false,
            file_dir: PathBuf::from("file_out"),
        }
    }

    pub fn with_docker_cap(mut self, docker_cap: usize) -> Self {
        self.docker_cap = docker_cap;
        self
    }

    pub fn with_default_fields(mut self, keep: bool) -> Self {
        self.keep_default_fields = keep;
        self
    }

    pub fn with_file_dir(mut self, file_dir: impl Into<PathBuf>) -> Self {
        self.file_dir = file_dir.into();
        self
    }
}

/// What a collector's drain worker did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Batches a sink accepted.
    pub batches: u64,
    /// Records in those batches.
    pub records: u64,
    /// File artifacts written.
    pub files: u64,
    /// Batches or files that were lost to an error or a panic.
    pub failures: u64,
}

enum Job {
    Data(Vec<DataCell>),
    File(FileCell),
}

/// Batching front-end of the output pipeline.
///
/// Records are appended to the current batch under a lock. When the batch
/// reaches [`docker_cap`](OutputConfig::docker_cap) it is swapped for an
/// empty one under that same lock and handed to a background drain worker,
/// so every record ends up in exactly one drained batch no matter how many
/// producers there are. Drains happen one at a time, in the order batches
/// reach the drain worker; batches filled by concurrent producers, or a full
/// batch racing [`stop`](Self::stop), may arrive in either order.
///
/// Cloning is cheap; clones share the same batch and drain worker. Must be
/// started from within a Tokio runtime.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

struct Inner {
    config: OutputConfig,
    registry: SinkRegistry,
    sink: Arc<RwLock<SinkHandle>>,
    // Lock order: `batch` before `intake`.
    batch: Mutex<Vec<DataCell>>,
    intake: Mutex<Option<mpsc::Sender<Job>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<DrainReport>>>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("namespace", &self.inner.config.namespace)
            .field("sink", &self.active_sink())
            .field("buffered", &self.len())
            .finish()
    }
}

impl Collector {
    /// Resolve the configured output type and start the drain worker.
    pub fn start(config: OutputConfig, registry: &SinkRegistry) -> Result<Self> {
        if config.docker_cap == 0 {
            exn::bail!(ErrorKind::InvalidCapacity);
        }
        let sink = Arc::new(RwLock::new(registry.get(&config.out_type)?));
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let run = UtcDateTime::now().unix_timestamp();
        let worker = tokio::spawn(drain_loop(config.clone(), Arc::clone(&sink), rx, run));
        tracing::debug!(namespace = %config.namespace, sink = %config.out_type, run, "collector started");
        Ok(Self {
            inner: Arc::new(Inner {
                batch: Mutex::new(Vec::with_capacity(config.docker_cap.min(DEFAULT_DOCKER_CAP))),
                config,
                registry: registry.clone(),
                sink,
                intake: Mutex::new(Some(tx)),
                worker: tokio::sync::Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.inner.config
    }

    /// Records waiting in the current, not yet full, batch.
    pub fn len(&self) -> usize {
        self.inner.batch.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Output type currently drained to.
    pub fn active_sink(&self) -> String {
        self.inner.sink.read().name().to_string()
    }

    /// Append one record. Waits only when the drain worker is far enough
    /// behind that full batches are queueing up.
    pub async fn collect_data(&self, cell: DataCell) -> Result<()> {
        let (intake, full) = {
            let mut batch = self.inner.batch.lock();
            let intake = self.inner.intake.lock().clone().ok_or_raise(|| ErrorKind::Stopped)?;
            batch.push(cell);
            let full = (batch.len() >= self.inner.config.docker_cap)
                .then(|| std::mem::replace(&mut *batch, Vec::with_capacity(self.inner.config.docker_cap)));
            (intake, full)
        };
        if let Some(full) = full {
            intake.send(Job::Data(full)).await.ok().ok_or_raise(|| ErrorKind::Stopped)?;
        }
        Ok(())
    }

    /// Queue a file artifact for writing.
    pub async fn collect_file(&self, cell: FileCell) -> Result<()> {
        let intake = self.inner.intake.lock().clone().ok_or_raise(|| ErrorKind::Stopped)?;
        intake.send(Job::File(cell)).await.ok().ok_or_raise(|| ErrorKind::Stopped)?;
        Ok(())
    }

    /// Flush the partial batch, stop accepting data and wait for everything
    /// queued to be drained.
    ///
    /// Calling this again returns an empty report.
    #[instrument(level = "debug", skip(self), fields(namespace = %self.inner.config.namespace))]
    pub async fn stop(&self) -> Result<DrainReport> {
        let (intake, rest) = {
            let mut batch = self.inner.batch.lock();
            (self.inner.intake.lock().take(), std::mem::take(&mut *batch))
        };
        if let Some(intake) = intake
            && !rest.is_empty()
        {
            intake.send(Job::Data(rest)).await.ok().ok_or_raise(|| ErrorKind::Stopped)?;
        }
        let Some(worker) = self.inner.worker.lock().await.take() else {
            return Ok(DrainReport::default());
        };
        let report = worker.await.or_raise(|| ErrorKind::Stopped)?;
        tracing::info!(
            namespace = %self.inner.config.namespace,
            batches = report.batches,
            records = report.records,
            files = report.files,
            failures = report.failures,
            "collector stopped",
        );
        Ok(report)
    }

    /// Switch to another output type (when given) and invoke the refresh
    /// hook of the now active sink.
    ///
    /// A drain that has already started finishes against the sink it started
    /// with; later batches go to the new one.
    pub async fn refresh_output(&self, out_type: Option<&str>) -> Result<()> {
        let sink = match out_type {
            Some(name) => {
                let next = self.inner.registry.get(name)?;
                *self.inner.sink.write() = Arc::clone(&next);
                tracing::info!(namespace = %self.inner.config.namespace, sink = name, "switched output");
                next
            },
            None => Arc::clone(&*self.inner.sink.read()),
        };
        sink.refresh().await.or_raise(|| ErrorKind::Refresh(sink.name().to_string()))
    }
}

async fn drain_loop(
    config: OutputConfig,
    sink: Arc<RwLock<SinkHandle>>,
    mut rx: mpsc::Receiver<Job>,
    run: i64,
) -> DrainReport {
    let mut report = DrainReport::default();
    let mut sequence = 0;
    while let Some(job) = rx.recv().await {
        match job {
            Job::Data(cells) => {
                let count = cells.len() as u64;
                let batch = match Batch::prepare(&config, run, sequence, cells) {
                    Ok(batch) => batch,
                    Err(err) => {
                        tracing::error!(namespace = %config.namespace, records = count, error = ?err, "dropping batch");
                        report.failures += 1;
                        continue;
                    },
                };
                sequence += 1;
                let current = Arc::clone(&*sink.read());
                match dispatch(current, batch).await {
                    Ok(()) => {
                        report.batches += 1;
                        report.records += count;
                    },
                    Err(err) => {
                        tracing::error!(namespace = %config.namespace, records = count, error = ?err, "batch lost");
                        report.failures += 1;
                    },
                }
            },
            Job::File(cell) => match write_file(&config.file_dir, &config.namespace, &cell).await {
                Ok(_) => report.files += 1,
                Err(err) => {
                    tracing::error!(namespace = %config.namespace, file = %cell.name, error = ?err, "file lost");
                    report.failures += 1;
                },
            },
        }
    }
    report
}

/// Hand `batch` to `sink` in a task of its own, so that a panicking sink
/// takes down only that task.
async fn dispatch(sink: SinkHandle, batch: Batch) -> Result<()> {
    let name = sink.name().to_string();
    let handle = tokio::spawn(async move { sink.drain(&batch).await });
    match handle.await {
        Ok(result) => result.or_raise(|| ErrorKind::Sink(name)),
        Err(err) if err.is_panic() => exn::bail!(ErrorKind::SinkPanicked(name)),
        Err(err) => Err(err).or_raise(|| ErrorKind::Sink(name)),
    }
}
