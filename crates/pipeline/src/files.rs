use exn::ResultExt;
use std::path::{Path, PathBuf};

use crate::batch::sanitize;
use crate::cell::FileCell;
use crate::error::{ErrorKind, Result};

/// Write a file artifact to `{dir}/{namespace}/{name}`, creating the
/// directories as needed. Both path components are sanitized.
pub(crate) async fn write_file(dir: &Path, namespace: &str, cell: &FileCell) -> Result<PathBuf> {
    let folder = dir.join(sanitize(namespace));
    tokio::fs::create_dir_all(&folder).await.or_raise(|| ErrorKind::Io)?;
    let path = folder.join(sanitize(&cell.name));
    tokio::fs::write(&path, &cell.bytes).await.or_raise(|| ErrorKind::Io)?;
    tracing::debug!(path = %path.display(), bytes = cell.bytes.len(), rule = %cell.rule_name, "wrote file");
    Ok(path)
}
