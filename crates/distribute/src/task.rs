use exn::ResultExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, Result};

/// A unit of work: which rule to run, and what to run it with.
///
/// The `id` is assigned by the [`TaskJar`](crate::TaskJar) when the task is
/// first pushed and is only meaningful for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: u64,
    pub rule: String,
    #[serde(default)]
    pub payload: Value,
}

impl Task {
    pub fn new(rule: impl Into<String>, payload: Value) -> Self {
        Self { id: 0, rule: rule.into(), payload }
    }

    /// Encode as a single line of JSON (no trailing newline).
    pub fn to_line(&self) -> Result<String> {
        serde_json::to_string(self).or_raise(|| ErrorKind::Codec)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).or_raise(|| ErrorKind::Codec)
    }
}
