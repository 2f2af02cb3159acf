use async_trait::async_trait;
use exn::ResultExt;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::Sink;
use crate::batch::{Batch, Record, sanitize};
use crate::error::{ErrorKind, Result};

/// Writes each batch as its own CSV file,
/// `{dir}/{namespace}/{key}-{run}-{sequence}.csv`.
///
/// The header is the sorted union of the batch's field names; a record
/// without one of them gets an empty cell. Strings are written as-is and any
/// other JSON value as compact JSON.
#[derive(Debug, Clone)]
pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub const NAME: &'static str = "csv";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl Sink for CsvSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn drain(&self, batch: &Batch) -> Result<()> {
        let folder = self.dir.join(sanitize(&batch.namespace));
        let path = folder.join(format!("{}.csv", batch.file_stem()));
        let records = batch.records.clone();
        let written = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&folder).or_raise(|| ErrorKind::Io)?;
            write_csv(&written, &records)
        })
        .await
        .or_raise(|| ErrorKind::SinkPanicked(Self::NAME.to_string()))??;
        tracing::debug!(path = %path.display(), records = batch.len(), "wrote batch to csv");
        Ok(())
    }
}

fn write_csv(path: &Path, records: &[Record]) -> Result<()> {
    let header: BTreeSet<&str> = records.iter().flat_map(|record| record.keys().map(String::as_str)).collect();
    let mut writer = ::csv::Writer::from_path(path).or_raise(|| ErrorKind::Io)?;
    writer.write_record(&header).or_raise(|| ErrorKind::Io)?;
    for record in records {
        writer
            .write_record(header.iter().map(|field| cell(record.get(*field))))
            .or_raise(|| ErrorKind::Io)?;
    }
    writer.flush().or_raise(|| ErrorKind::Io)?;
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}
