//! Requests, pages, and the downloader contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::UtcDateTime;

use crate::error::Result;
use crate::spider::SpiderContext;

/// Something a spider wants fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Page this request was discovered on; empty for start requests.
    #[serde(default)]
    pub parent_url: String,
    /// Rule of the spider that will parse the response.
    #[serde(default)]
    pub rule: String,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            parent_url: String::new(),
            rule: String::new(),
        }
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = rule.into();
        self
    }

    pub fn with_parent(mut self, parent_url: impl Into<String>) -> Self {
        self.parent_url = parent_url.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Identity of this request for deduplication: BLAKE3 of the method and
    /// URL, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.method.to_ascii_uppercase().as_bytes());
        hasher.update(b" ");
        hasher.update(self.url.as_bytes());
        hasher.finalize().to_string()
    }
}

/// A fetched response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub request: Request,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub downloaded_at: UtcDateTime,
}

impl Page {
    pub fn new(request: Request, status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self { request, status, headers: BTreeMap::new(), body: body.into(), downloaded_at: UtcDateTime::now() }
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Fetches pages for spiders.
///
/// The concrete HTTP (or headless browser) implementation lives outside this
/// crate. From a worker's point of view a download is a single call that
/// either produces a [`Page`] or fails with
/// [`ErrorKind::Download`](crate::error::ErrorKind::Download); failures are
/// logged, recorded in the request history and skipped.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, ctx: &SpiderContext, request: &Request) -> Result<Page>;
}

pub type DownloaderHandle = Arc<dyn Downloader + Send + Sync>;

/// Downloader for nodes that were started without one. Every download fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unavailable;

#[async_trait]
impl Downloader for Unavailable {
    async fn download(&self, _ctx: &SpiderContext, request: &Request) -> Result<Page> {
        exn::bail!(crate::error::ErrorKind::Download(request.url.clone()))
    }
}
