//! Node roles: wiring configuration, spiders and sinks into a running master
//! or worker.

use exn::ResultExt;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use trawl_buckets::Store;
use trawl_config::{Config, Mode};
use trawl_distribute::{TaskJar, transport};
use trawl_pipeline::{BoltSink, CsvSink, SinkHandle, SinkRegistry};

use crate::downloader::DownloaderHandle;
use crate::error::{ErrorKind, Result};
use crate::spider::Species;
use crate::submit::{CrawlRequest, submit};
use crate::worker::{OutputDefaults, Worker};

/// One process of a crawl cluster.
pub struct Node {
    config: Config,
    species: Species,
    downloader: DownloaderHandle,
    sinks: Vec<SinkHandle>,
    request: Option<CrawlRequest>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("mode", &self.config.run.mode)
            .field("species", &self.species)
            .field("sinks", &self.sinks.iter().map(|sink| sink.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

impl Node {
    pub fn new(config: Config, species: Species, downloader: DownloaderHandle) -> Self {
        Self { config, species, downloader, sinks: Vec::new(), request: None }
    }

    /// Register an additional output type (`kafka`, `mongo`, ...). Replaces a
    /// built-in sink of the same name.
    pub fn with_sink(mut self, sink: SinkHandle) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Crawl request a master queues as soon as it starts.
    pub fn with_request(mut self, request: CrawlRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every output type this node can drain to: `bolt` (into `store`),
    /// `csv` (into the text output directory) and the registered extras.
    pub fn registry(&self, store: &Store) -> SinkRegistry {
        let builder = SinkRegistry::builder()
            .register(BoltSink::new(store.clone()))
            .register(CsvSink::new(&self.config.output.text_dir));
        self.sinks
            .iter()
            .cloned()
            .fold(builder, |builder, sink| builder.register_handle(sink))
            .build()
    }

    /// Run in the configured mode until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        match self.config.run.mode {
            Mode::Unset => {
                tracing::warn!("no run mode configured, nothing to do");
                Ok(())
            },
            Mode::Master => self.run_master(token).await,
            Mode::Worker => self.run_worker(token).await,
        }
    }

    #[tracing::instrument(skip_all, fields(port = self.config.run.port))]
    async fn run_master(&self, token: CancellationToken) -> Result<()> {
        let run = &self.config.run;
        let store = open_store(&self.config.output.db_name).await?;
        let jar = TaskJar::new(run.jar_capacity);

        let listener = TcpListener::bind(("0.0.0.0", run.port)).await.or_raise(|| ErrorKind::Io)?;
        tracing::info!(addr = ?listener.local_addr().ok(), "master listening");
        let server = tokio::spawn(transport::serve(listener, jar.clone(), token.clone()));

        if let Some(request) = &self.request {
            let submission = submit(request, &jar).await?;
            tracing::info!(tasks = submission.tasks.len(), "queued initial request");
        }

        if run.local_workers {
            self.worker(jar, &store).run(run.thread, token.clone()).await?;
        } else {
            token.cancelled().await;
        }

        match server.await {
            Ok(served) => served.or_raise(|| ErrorKind::Transport)?,
            Err(err) => tracing::error!(error = %err, "task server died"),
        }
        store.close();
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(master = %self.config.run.master_addr()))]
    async fn run_worker(&self, token: CancellationToken) -> Result<()> {
        let run = &self.config.run;
        let store = open_store(&self.config.output.db_name).await?;
        // Only as many tasks as there are units wait locally.
        let jar = TaskJar::new(run.thread);

        let exhausted = CancellationToken::new();
        let fetcher = tokio::spawn({
            let (addr, jar, token, exhausted) = (run.master_addr(), jar.clone(), token.clone(), exhausted.clone());
            async move {
                if let Err(err) = transport::fetch(addr, jar, token).await {
                    tracing::error!(error = ?err, "lost connection to master, stopping");
                }
                exhausted.cancel();
            }
        });

        // Once the fetcher gives up, units run what was already received.
        self.worker(jar, &store).run_until_drained(run.thread, exhausted, token).await?;
        if let Err(err) = fetcher.await {
            tracing::error!(error = %err, "task fetcher died");
        }
        store.close();
        Ok(())
    }

    fn worker(&self, jar: TaskJar, store: &Store) -> Worker {
        let run = &self.config.run;
        let output = OutputDefaults {
            out_type: run.out_type.clone(),
            docker_cap: run.docker_cap,
            file_dir: self.config.output.file_dir.clone(),
        };
        Worker::new(jar, self.species.clone(), self.downloader.clone(), self.registry(store))
            .with_output(output)
            .with_history(store.clone())
    }
}

async fn open_store(path: &Path) -> Result<Store> {
    let path = path.to_path_buf();
    spawn_blocking(move || Store::open(path))
        .await
        .or_raise(|| ErrorKind::Storage)?
        .or_raise(|| ErrorKind::Storage)
}
