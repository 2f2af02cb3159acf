//! Spider contract, task assignments and the record emitter.

use async_trait::async_trait;
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use trawl_pipeline::{Collector, DataCell, FileCell};

use crate::downloader::{Page, Request};
use crate::error::{ErrorKind, Result};

/// Everything a task carries besides the spider name. This is the task's
/// JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Assignment {
    /// Custom input for the spider (search term, category, ...). Also used
    /// as the data key of its output.
    pub keyin: String,
    /// Maximum records to emit; zero means unlimited.
    pub limit: u64,
    pub pause_ms: u64,
    pub proxy_second: u64,
    pub success_inherit: bool,
    pub failure_inherit: bool,
    /// Output type override for this task's collector.
    pub out_type: Option<String>,
    /// Batch capacity override for this task's collector.
    pub docker_cap: Option<usize>,
}

impl Default for Assignment {
    fn default() -> Self {
        Self {
            keyin: String::new(),
            limit: 0,
            pause_ms: 0,
            proxy_second: 0,
            success_inherit: true,
            failure_inherit: true,
            out_type: None,
            docker_cap: None,
        }
    }
}

/// What a spider knows about the task it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderContext {
    pub name: String,
    /// Id of the task being run (diagnostics only).
    pub task: u64,
    pub keyin: String,
    pub limit: u64,
    pub pause: Duration,
    pub proxy_second: u64,
}

impl SpiderContext {
    pub fn new(name: impl Into<String>, task: u64, assignment: &Assignment) -> Self {
        Self {
            name: name.into(),
            task,
            keyin: assignment.keyin.clone(),
            limit: assignment.limit,
            pause: Duration::from_millis(assignment.pause_ms),
            proxy_second: assignment.proxy_second,
        }
    }
}

/// A set of extraction rules for one site.
///
/// The worker calls [`start_requests`](Self::start_requests) once per task,
/// then for every downloaded page calls [`parse`](Self::parse), which emits
/// records through the [`Emitter`] and returns follow-up requests.
#[async_trait]
pub trait Spider: Send + Sync {
    fn name(&self) -> &str;

    /// Keep `Url`, `ParentUrl` and `DownloadTime` in this spider's output.
    fn keep_default_fields(&self) -> bool {
        false
    }

    fn start_requests(&self, ctx: &SpiderContext) -> Vec<Request>;

    async fn parse(&self, ctx: &SpiderContext, page: &Page, emitter: &Emitter) -> Result<Vec<Request>>;
}

pub type SpiderHandle = Arc<dyn Spider + Send + Sync>;

/// The spiders a node knows about, by name.
#[derive(Clone, Default)]
pub struct Species {
    spiders: BTreeMap<String, SpiderHandle>,
}

impl fmt::Debug for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.spiders.keys()).finish()
    }
}

impl Species {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `spider` under its own name, replacing any spider of that name.
    pub fn register(mut self, spider: impl Spider + 'static) -> Self {
        self.spiders.insert(spider.name().to_string(), Arc::new(spider));
        self
    }

    pub fn get(&self, name: &str) -> Option<SpiderHandle> {
        self.spiders.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.spiders.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.spiders.is_empty()
    }
}

/// Record-emission side of a running task.
///
/// Stamps every record with the page it came from before handing it to the
/// task's collector.
#[derive(Debug)]
pub struct Emitter {
    collector: Collector,
    emitted: AtomicU64,
}

impl Emitter {
    pub fn new(collector: Collector) -> Self {
        Self { collector, emitted: AtomicU64::new(0) }
    }

    /// Emit one record extracted from `page`. The rule name is the page
    /// request's rule, or the spider name when the request has none.
    pub async fn output(&self, ctx: &SpiderContext, page: &Page, data: Map<String, Value>) -> Result<()> {
        let rule = match page.request.rule.as_str() {
            "" => ctx.name.as_str(),
            rule => rule,
        };
        let cell = DataCell::new(rule, data)
            .with_source(&page.request.url, &page.request.parent_url)
            .with_download_time(page.downloaded_at);
        self.collector.collect_data(cell).await.or_raise(|| ErrorKind::Pipeline)?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Emit a binary artifact to be saved as `name`.
    pub async fn file(&self, ctx: &SpiderContext, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let cell = FileCell::new(ctx.name.as_str(), name, bytes);
        self.collector.collect_file(cell).await.or_raise(|| ErrorKind::Pipeline)
    }

    /// Records emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}
