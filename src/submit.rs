//! Turning a crawl request into tasks.

use exn::ResultExt;
use serde::{Deserialize, Serialize};
use trawl_config::RunConfig;
use trawl_distribute::{Task, TaskJar};

use crate::error::{ErrorKind, Result};
use crate::spider::Assignment;

/// What a user asks the master to crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlRequest {
    pub spiders: Vec<String>,
    /// One keyin, or several written as `<a><b><c>`.
    pub keyins: String,
    pub thread_num: usize,
    /// Maximum records per task; zero means unlimited.
    pub limit: u64,
    pub docker_cap: usize,
    /// Pause between requests, in milliseconds.
    pub pause_time: u64,
    pub proxy_second: u64,
    pub out_type: String,
    pub success_inherit: bool,
    pub failure_inherit: bool,
}

impl Default for CrawlRequest {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for CrawlRequest {
    fn from(run: &RunConfig) -> Self {
        Self {
            spiders: Vec::new(),
            keyins: String::new(),
            thread_num: run.thread,
            limit: run.limit,
            docker_cap: run.docker_cap,
            pause_time: run.pause_ms,
            proxy_second: run.proxy_second,
            out_type: run.out_type.clone(),
            success_inherit: run.success_inherit,
            failure_inherit: run.failure_inherit,
        }
    }
}

impl CrawlRequest {
    pub fn new(spiders: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { spiders: spiders.into_iter().map(Into::into).collect(), ..Self::default() }
    }

    pub fn with_keyins(mut self, keyins: impl Into<String>) -> Self {
        self.keyins = keyins.into();
        self
    }

    /// The individual keyins. A request without keyins still yields one
    /// (empty) keyin so that every spider runs once.
    pub fn split_keyins(&self) -> Vec<String> {
        let keyins = self.keyins.trim();
        let Some(inner) = keyins.strip_prefix('<').and_then(|rest| rest.strip_suffix('>')) else {
            return vec![keyins.to_string()];
        };
        let mut split: Vec<String> = inner
            .split("><")
            .map(str::trim)
            .filter(|keyin| !keyin.is_empty())
            .map(str::to_string)
            .collect();
        split.dedup();
        if split.is_empty() {
            split.push(String::new());
        }
        split
    }

    fn assignment(&self, keyin: String) -> Assignment {
        Assignment {
            keyin,
            limit: self.limit,
            pause_ms: self.pause_time,
            proxy_second: self.proxy_second,
            success_inherit: self.success_inherit,
            failure_inherit: self.failure_inherit,
            out_type: Some(self.out_type.clone()),
            docker_cap: Some(self.docker_cap),
        }
    }
}

/// What [`submit`] queued, and the output settings the request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Ids of the queued tasks, in queue order.
    pub tasks: Vec<u64>,
    pub out_type: String,
    pub docker_cap: usize,
    pub thread_num: usize,
}

/// Queue one task per (spider, keyin) pair of `request`.
///
/// Waits while the jar is full. Fails with [`ErrorKind::EmptySubmission`]
/// when the request names no spiders.
#[tracing::instrument(level = "debug", skip_all, fields(spiders = request.spiders.len()))]
pub async fn submit(request: &CrawlRequest, jar: &TaskJar) -> Result<Submission> {
    let spiders: Vec<&str> = request.spiders.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if spiders.is_empty() {
        exn::bail!(ErrorKind::EmptySubmission);
    }
    let keyins = request.split_keyins();
    let mut tasks = Vec::with_capacity(spiders.len() * keyins.len());
    for spider in &spiders {
        for keyin in &keyins {
            let payload = serde_json::to_value(request.assignment(keyin.clone())).or_raise(|| ErrorKind::InvalidPayload)?;
            let id = jar.push(Task::new(*spider, payload)).await.or_raise(|| ErrorKind::Queue)?;
            tasks.push(id);
        }
    }
    tracing::info!(tasks = tasks.len(), out_type = %request.out_type, "submitted crawl request");
    Ok(Submission {
        tasks,
        out_type: request.out_type.clone(),
        docker_cap: request.docker_cap,
        thread_num: request.thread_num,
    })
}
