use serde_json::{Map, Value};
use time::UtcDateTime;
use time::format_description::well_known::Rfc3339;

use crate::batch::Record;

pub(crate) const FIELD_DATA: &str = "Data";
pub(crate) const FIELD_RULE_NAME: &str = "RuleName";
pub(crate) const FIELD_URL: &str = "Url";
pub(crate) const FIELD_PARENT_URL: &str = "ParentUrl";
pub(crate) const FIELD_DOWNLOAD_TIME: &str = "DownloadTime";

/// One extracted record, plus where and when it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DataCell {
    pub rule_name: String,
    pub data: Map<String, Value>,
    pub url: String,
    pub parent_url: String,
    pub download_time: UtcDateTime,
}

impl DataCell {
    pub fn new(rule_name: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            rule_name: rule_name.into(),
            data,
            url: String::new(),
            parent_url: String::new(),
            download_time: UtcDateTime::now(),
        }
    }

    pub fn with_source(mut self, url: impl Into<String>, parent_url: impl Into<String>) -> Self {
        self.url = url.into();
        self.parent_url = parent_url.into();
        self
    }

    pub fn with_download_time(mut self, download_time: UtcDateTime) -> Self {
        self.download_time = download_time;
        self
    }

    /// Flatten into the record a sink receives.
    ///
    /// The extracted fields are folded into the top level. `Data` and
    /// `RuleName` never survive; `Url`, `ParentUrl` and `DownloadTime` are
    /// kept only when `keep_default_fields` is set. Extracted fields that
    /// reuse one of those names are treated the same way.
    pub(crate) fn into_record(self, keep_default_fields: bool) -> Record {
        let mut record = Record::new();
        record.insert(FIELD_URL.into(), Value::String(self.url));
        record.insert(FIELD_PARENT_URL.into(), Value::String(self.parent_url));
        record.insert(FIELD_DOWNLOAD_TIME.into(), format_time(self.download_time));
        record.extend(self.data);

        record.remove(FIELD_DATA);
        record.remove(FIELD_RULE_NAME);
        if !keep_default_fields {
            record.remove(FIELD_URL);
            record.remove(FIELD_PARENT_URL);
            record.remove(FIELD_DOWNLOAD_TIME);
        }
        record
    }
}

fn format_time(time: UtcDateTime) -> Value {
    match time.format(&Rfc3339) {
        Ok(formatted) => Value::String(formatted),
        Err(_) => Value::from(time.unix_timestamp()),
    }
}

/// A binary artifact (image, document, ...) to be written to the file
/// output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCell {
    pub rule_name: String,
    pub name: String,
    pub bytes: Vec<u8>,
}

impl FileCell {
    pub fn new(rule_name: impl Into<String>, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self { rule_name: rule_name.into(), name: name.into(), bytes: bytes.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell() -> DataCell {
        let Value::Object(data) = json!({"title": "Hello", "Data": "nested", "RuleName": "spoofed"}) else {
            unreachable!()
        };
        DataCell::new("article", data)
            .with_source("https://example.com/a", "https://example.com/")
            .with_download_time(UtcDateTime::UNIX_EPOCH)
    }

    #[test]
    fn test_record_strips_bookkeeping_by_default() {
        let record = cell().into_record(false);
        assert_eq!(Value::Object(record), json!({"title": "Hello"}));
    }

    #[test]
    fn test_record_keeps_default_fields_when_asked() {
        let record = cell().into_record(true);
        assert_eq!(
            Value::Object(record),
            json!({
                "title": "Hello",
                "Url": "https://example.com/a",
                "ParentUrl": "https://example.com/",
                "DownloadTime": "1970-01-01T00:00:00Z",
            })
        );
    }
}
