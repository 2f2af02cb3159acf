//! Worker units: pull a task, run its spider, drain its output.

use exn::{OptionExt, ResultExt};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use trawl_buckets::Store;
use trawl_distribute::{Task, TaskJar};
use trawl_pipeline::{Collector, DEFAULT_DOCKER_CAP, DrainReport, OutputConfig, SinkRegistry};

use crate::downloader::{DownloaderHandle, Request};
use crate::error::{ErrorKind, Result};
use crate::history::History;
use crate::spider::{Assignment, Emitter, SpiderContext, SpiderHandle, Species};

/// Output settings for tasks that do not override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDefaults {
    pub out_type: String,
    pub docker_cap: usize,
    pub file_dir: PathBuf,
}

impl Default for OutputDefaults {
    fn default() -> Self {
        Self { out_type: "csv".into(), docker_cap: DEFAULT_DOCKER_CAP, file_dir: PathBuf::from("file_out") }
    }
}

/// What running one task amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: u64,
    pub spider: String,
    pub keyin: String,
    /// Pages downloaded and parsed.
    pub pages: u64,
    /// Requests that failed to download or parse.
    pub failures: u64,
    /// Requests skipped because an earlier run already handled them.
    pub skipped: u64,
    pub emitted: u64,
    pub drain: DrainReport,
}

/// Runs tasks from a jar. Cloning is cheap; clones share everything.
#[derive(Clone)]
pub struct Worker {
    jar: TaskJar,
    species: Species,
    downloader: DownloaderHandle,
    registry: SinkRegistry,
    output: OutputDefaults,
    store: Option<Store>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("species", &self.species)
            .field("registry", &self.registry)
            .field("output", &self.output)
            .field("history", &self.store.is_some())
            .finish()
    }
}

impl Worker {
    pub fn new(jar: TaskJar, species: Species, downloader: DownloaderHandle, registry: SinkRegistry) -> Self {
        Self { jar, species, downloader, registry, output: OutputDefaults::default(), store: None }
    }

    pub fn with_output(mut self, output: OutputDefaults) -> Self {
        self.output = output;
        self
    }

    /// Keep request history in `store`, so that later runs can skip what
    /// succeeded and retry what failed.
    pub fn with_history(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Run `units` task loops in parallel until `token` is cancelled or the
    /// jar is closed.
    pub async fn run(&self, units: usize, token: CancellationToken) -> Result<()> {
        self.run_until_drained(units, CancellationToken::new(), token).await
    }

    /// Like [`run`](Self::run), but also stops once `exhausted` is cancelled
    /// and every task still buffered in the jar has been run.
    ///
    /// `exhausted` marks the end of the supply (the master went away); `token`
    /// stops the units straight away, abandoning whatever is still buffered.
    pub async fn run_until_drained(
        &self,
        units: usize,
        exhausted: CancellationToken,
        token: CancellationToken,
    ) -> Result<()> {
        let mut loops = JoinSet::new();
        for unit in 0..units.max(1) {
            loops.spawn(self.clone().unit(unit, exhausted.clone(), token.clone()));
        }
        tracing::info!(units = units.max(1), "worker started");
        while let Some(joined) = loops.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "worker unit died");
            }
        }
        tracing::info!("worker stopped");
        Ok(())
    }

    async fn unit(self, unit: usize, exhausted: CancellationToken, token: CancellationToken) {
        loop {
            let Some(task) = self.next_task(&exhausted, &token).await else {
                if !self.jar.is_empty() {
                    tracing::warn!(unit, abandoned = self.jar.len(), "unit stopping with tasks still queued");
                }
                tracing::debug!(unit, "unit stopping");
                return;
            };
            let id = task.id;
            match self.execute(task, &token).await {
                Ok(report) => tracing::info!(
                    unit,
                    task = id,
                    spider = %report.spider,
                    pages = report.pages,
                    failures = report.failures,
                    emitted = report.emitted,
                    "task finished",
                ),
                Err(err) => tracing::error!(unit, task = id, error = ?err, "task failed"),
            }
        }
    }

    /// The next task to run, or `None` once the unit should stop.
    async fn next_task(&self, exhausted: &CancellationToken, token: &CancellationToken) -> Option<Task> {
        tokio::select! {
            biased;
            () = token.cancelled() => None,
            task = self.jar.pull() => task.ok(),
            // No more tasks will arrive; finish what is buffered.
            () = exhausted.cancelled() => self.jar.try_pull().await,
        }
    }

    /// Run one task to completion: crawl its spider's frontier, then flush
    /// and stop the task's collector.
    #[instrument(level = "debug", skip_all, fields(task = task.id, spider = %task.rule))]
    pub async fn execute(&self, task: Task, token: &CancellationToken) -> Result<TaskReport> {
        let spider = self
            .species
            .get(&task.rule)
            .ok_or_raise(|| ErrorKind::UnknownSpider(task.rule.clone()))?;
        let assignment: Assignment = match task.payload {
            serde_json::Value::Null => Assignment::default(),
            payload => serde_json::from_value(payload).or_raise(|| ErrorKind::InvalidPayload)?,
        };
        let ctx = SpiderContext::new(spider.name(), task.id, &assignment);

        let data_key = match assignment.keyin.trim() {
            "" => ctx.name.clone(),
            keyin => keyin.to_string(),
        };
        let config = OutputConfig::new(
            assignment.out_type.clone().unwrap_or_else(|| self.output.out_type.clone()),
            ctx.name.clone(),
            data_key,
        )
        .with_docker_cap(assignment.docker_cap.unwrap_or(self.output.docker_cap))
        .with_default_fields(spider.keep_default_fields())
        .with_file_dir(&self.output.file_dir);
        let collector = Collector::start(config, &self.registry).or_raise(|| ErrorKind::Pipeline)?;
        let emitter = Emitter::new(collector.clone());

        let mut report = TaskReport {
            task: task.id,
            spider: ctx.name.clone(),
            keyin: ctx.keyin.clone(),
            pages: 0,
            failures: 0,
            skipped: 0,
            emitted: 0,
            drain: DrainReport::default(),
        };
        let crawled = self.crawl(&spider, &ctx, &assignment, &emitter, &mut report, token).await;
        report.emitted = emitter.emitted();
        // The partial batch is flushed whether or not the crawl succeeded.
        report.drain = collector.stop().await.or_raise(|| ErrorKind::Pipeline)?;
        crawled?;
        Ok(report)
    }

    async fn crawl(
        &self,
        spider: &SpiderHandle,
        ctx: &SpiderContext,
        assignment: &Assignment,
        emitter: &Emitter,
        report: &mut TaskReport,
        token: &CancellationToken,
    ) -> Result<()> {
        let history = match &self.store {
            Some(store) => Some(History::open(store, &ctx.name, &ctx.keyin).await?),
            None => None,
        };
        let mut frontier: VecDeque<Request> = match &history {
            Some(history) => history.prepare(assignment).await?.into(),
            None => VecDeque::new(),
        };
        frontier.extend(spider.start_requests(ctx));
        let mut seen = HashSet::new();

        while let Some(request) = frontier.pop_front() {
            if token.is_cancelled() || (ctx.limit > 0 && emitter.emitted() >= ctx.limit) {
                break;
            }
            if !seen.insert(request.fingerprint()) {
                continue;
            }
            if let Some(history) = &history
                && history.has_succeeded(&request).await?
            {
                report.skipped += 1;
                continue;
            }
            if report.pages + report.failures > 0 && !ctx.pause.is_zero() {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(ctx.pause) => {},
                }
            }

            let page = match self.downloader.download(ctx, &request).await {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(url = %request.url, error = ?err, "download failed, skipping");
                    report.failures += 1;
                    if let Some(history) = &history {
                        history.record_failure(&request).await?;
                    }
                    continue;
                },
            };
            match spider.parse(ctx, &page, emitter).await {
                Ok(follow) => {
                    report.pages += 1;
                    if let Some(history) = &history {
                        history.record_success(&request).await?;
                    }
                    frontier.extend(follow);
                },
                Err(err) => {
                    tracing::warn!(url = %request.url, error = ?err, "parse failed, skipping");
                    report.failures += 1;
                    if let Some(history) = &history {
                        history.record_failure(&request).await?;
                    }
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::{Downloader, Page};
    use crate::spider::Spider;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use trawl_pipeline::MemorySink;

    const SITE: &str = "https://example.com/page/";

    /// Serves `SITE{n}` for any n, except the listed broken pages.
    struct FakeWeb {
        broken: BTreeSet<u64>,
    }

    #[async_trait]
    impl Downloader for FakeWeb {
        async fn download(&self, _ctx: &SpiderContext, request: &Request) -> Result<Page> {
            let n: u64 = request.url.trim_start_matches(SITE).parse().unwrap();
            if self.broken.contains(&n) {
                exn::bail!(ErrorKind::Download(request.url.clone()));
            }
            Ok(Page::new(request.clone(), 200, n.to_string()))
        }
    }

    /// Follows `SITE0`, `SITE1`, ... up to `pages`, emitting one record per
    /// page tagged with the keyin.
    struct Pager {
        pages: u64,
    }

    #[async_trait]
    impl Spider for Pager {
        fn name(&self) -> &str {
            "pager"
        }

        fn start_requests(&self, _ctx: &SpiderContext) -> Vec<Request> {
            vec![Request::get(format!("{SITE}0"))]
        }

        async fn parse(&self, ctx: &SpiderContext, page: &Page, emitter: &Emitter) -> Result<Vec<Request>> {
            let n: u64 = page.text().parse().unwrap();
            let serde_json::Value::Object(data) = json!({"n": n, "keyin": ctx.keyin}) else { unreachable!() };
            emitter.output(ctx, page, data).await?;
            // Both the next page and a duplicate of this one.
            let mut follow = vec![Request::get(page.url()).with_parent(page.url())];
            if n + 1 < self.pages {
                follow.push(Request::get(format!("{SITE}{}", n + 1)).with_parent(page.url()));
            }
            Ok(follow)
        }
    }

    fn fake_worker(jar: TaskJar, broken: &[u64]) -> (Arc<MemorySink>, Worker) {
        let sink = Arc::new(MemorySink::new("memory"));
        let registry = SinkRegistry::builder().register_handle(sink.clone()).build();
        let downloader = Arc::new(FakeWeb { broken: broken.iter().copied().collect() });
        let worker = Worker::new(jar, Species::new().register(Pager { pages: 10 }), downloader, registry)
            .with_output(OutputDefaults { out_type: "memory".into(), docker_cap: 4, ..OutputDefaults::default() });
        (sink, worker)
    }

    fn task(payload: serde_json::Value) -> Task {
        Task::new("pager", payload)
    }

    fn numbers(sink: &MemorySink) -> Vec<u64> {
        sink.records().iter().map(|record| record["n"].as_u64().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_execute_crawls_frontier_and_drains() {
        let (sink, worker) = fake_worker(TaskJar::default(), &[]);
        let report = worker.execute(task(json!({"keyin": "rust"})), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.pages, 10);
        assert_eq!(report.emitted, 10);
        assert_eq!(report.drain.batches, 3);
        assert_eq!(numbers(&sink), (0..10).collect::<Vec<_>>());
        let batches = sink.batches();
        assert!(batches.iter().all(|batch| batch.namespace == "pager" && batch.key == "rust"));
    }

    #[tokio::test]
    async fn test_execute_stops_at_limit() {
        let (sink, worker) = fake_worker(TaskJar::default(), &[]);
        let report = worker.execute(task(json!({"limit": 3})), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.emitted, 3);
        assert_eq!(numbers(&sink), vec![0, 1, 2]);
        // Without a keyin the spider name partitions the output.
        assert!(sink.batches().iter().all(|batch| batch.key == "pager"));
    }

    #[tokio::test]
    async fn test_download_failures_are_skipped() {
        let (sink, worker) = fake_worker(TaskJar::default(), &[0]);
        let report = worker.execute(task(json!(null)), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.failures, 1);
        assert_eq!(report.pages, 0);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_spider_and_bad_payload() {
        let (_, worker) = fake_worker(TaskJar::default(), &[]);
        let token = CancellationToken::new();
        let err = worker.execute(Task::new("nobody", json!(null)), &token).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnknownSpider(name) if name == "nobody"));
        let err = worker.execute(task(json!({"limit": "lots"})), &token).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPayload));
    }

    #[tokio::test]
    async fn test_history_skips_successes_and_retries_failures() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("history.redb")).unwrap();
        let token = CancellationToken::new();

        // First run: page 5 is down, so the crawl ends there.
        let (first, worker) = fake_worker(TaskJar::default(), &[5]);
        let report = worker.with_history(store.clone()).execute(task(json!({"keyin": "k"})), &token).await.unwrap();
        assert_eq!((report.pages, report.failures), (5, 1));
        assert_eq!(numbers(&first), vec![0, 1, 2, 3, 4]);

        // Second run: the failed page is retried first, the rest is skipped.
        let (second, worker) = fake_worker(TaskJar::default(), &[]);
        let report = worker.with_history(store).execute(task(json!({"keyin": "k"})), &token).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(numbers(&second), vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_executes_queued_tasks() {
        let jar = TaskJar::new(8);
        let (sink, worker) = fake_worker(jar.clone(), &[]);
        for keyin in ["a", "b", "c"] {
            jar.push(task(json!({"keyin": keyin, "limit": 2}))).await.unwrap();
        }

        let token = CancellationToken::new();
        let running = tokio::spawn({
            let token = token.clone();
            async move { worker.run(2, token).await }
        });
        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.records().len() < 6 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();
        running.await.unwrap().unwrap();

        let keys: BTreeSet<String> = sink.batches().into_iter().map(|batch| batch.key).collect();
        assert_eq!(keys, BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()]));
        assert!(jar.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_buffered_tasks_run_after_supply_ends() {
        let jar = TaskJar::new(4);
        let (sink, worker) = fake_worker(jar.clone(), &[]);
        for keyin in ["a", "b", "c"] {
            jar.receive(task(json!({"keyin": keyin, "limit": 2}))).await.unwrap();
        }
        let exhausted = CancellationToken::new();
        exhausted.cancel();

        tokio::time::timeout(Duration::from_secs(10), worker.run_until_drained(2, exhausted, CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sink.records().len(), 6);
        let keys: BTreeSet<String> = sink.batches().into_iter().map(|batch| batch.key).collect();
        assert_eq!(keys, BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()]));
        assert!(jar.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_worker_abandons_buffered_tasks() {
        let jar = TaskJar::new(4);
        let (sink, worker) = fake_worker(jar.clone(), &[]);
        jar.receive(task(json!({"keyin": "a"}))).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        worker.run_until_drained(1, CancellationToken::new(), token).await.unwrap();
        assert!(sink.records().is_empty());
        assert_eq!(jar.len(), 1);
    }
}
