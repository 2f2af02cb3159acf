use serde_json::{Map, Value};

use crate::cell::DataCell;
use crate::collector::OutputConfig;
use crate::error::{ErrorKind, Result};

/// A flattened record, as handed to sinks.
pub type Record = Map<String, Value>;

/// A prepared batch of records, ready for a sink.
///
/// `run` identifies the collector that produced the batch (its start time in
/// Unix seconds) and `sequence` counts batches within that run, so together
/// with `key` they name a batch uniquely.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub namespace: String,
    pub key: String,
    pub run: i64,
    pub sequence: u64,
    pub records: Vec<Record>,
}

impl Batch {
    /// Flatten `cells` into records for the configured namespace and key.
    ///
    /// Fails with [`ErrorKind::MissingDataKey`] when no data key is
    /// configured; the cells are dropped.
    pub(crate) fn prepare(config: &OutputConfig, run: i64, sequence: u64, cells: Vec<DataCell>) -> Result<Self> {
        if config.data_key.trim().is_empty() {
            exn::bail!(ErrorKind::MissingDataKey(config.namespace.clone()));
        }
        let records = cells
            .into_iter()
            .map(|cell| cell.into_record(config.keep_default_fields))
            .collect();
        Ok(Self {
            namespace: config.namespace.clone(),
            key: config.data_key.clone(),
            run,
            sequence,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `{key}/{run}/{sequence}`, with the sequence zero-padded so that keys
    /// sort in drain order.
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{:08}", self.key, self.run, self.sequence)
    }

    /// File-name friendly variant of [`storage_key`](Self::storage_key).
    pub fn file_stem(&self) -> String {
        format!("{}-{}-{:08}", sanitize(&self.key), self.run, self.sequence)
    }
}

/// Make `name` safe to use as a bucket name or a single path component.
///
/// Path separators, characters reserved on common filesystems and control
/// characters become `_`. Names that would still be unusable (empty, `.` or
/// `..`) become `_`.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
