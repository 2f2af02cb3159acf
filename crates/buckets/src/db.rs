//! Database handle, file locking and compaction.

use exn::{OptionExt, ResultExt};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use redb::{Database, DatabaseError, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::bucket::Bucket;
use crate::error::{ErrorKind, Result};

/// How long [`Store::open`] waits for another holder to release the file.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);
const TMP_SUFFIX: &str = ".tmp";

/// Every bucket is a table of raw byte strings.
pub(crate) type Table<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

pub(crate) fn table(name: &str) -> Table<'_> {
    TableDefinition::new(name)
}

/// Handle to an open bucket store.
///
/// Cloning is cheap; clones share the same open database. Ordinary operations
/// take the shared side of an internal lock, while [`Store::close`] and
/// compaction take the exclusive side, so a compaction never runs concurrently
/// with anything else on this handle.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Shared>,
}

struct Shared {
    path: PathBuf,
    timeout: Duration,
    db: RwLock<Option<Database>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("open", &self.inner.db.read_recursive().is_some())
            .finish()
    }
}

impl Store {
    /// Open (or create) the database at `path`, waiting up to
    /// [`DEFAULT_LOCK_TIMEOUT`] for the file lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open (or create) the database at `path`, waiting up to `timeout` for
    /// the file lock before giving up with [`ErrorKind::LockTimeout`].
    ///
    /// A leftover `<path>.tmp` from an interrupted compaction is removed once
    /// the lock on the main file is held.
    pub fn open_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).or_raise(|| ErrorKind::Io)?;
        }
        let db = acquire(&path, timeout)?;
        remove_stale_tmp(&path)?;
        tracing::debug!(path = %path.display(), "opened bucket store");
        Ok(Self {
            inner: Arc::new(Shared { path, timeout, db: RwLock::new(Some(db)) }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Release the file lock. Every clone of this handle (and every bucket
    /// taken from it) fails with [`ErrorKind::Closed`] afterwards.
    pub fn close(&self) {
        if self.inner.db.write().take().is_some() {
            tracing::debug!(path = %self.inner.path.display(), "closed bucket store");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.db.read_recursive().is_some()
    }

    /// Get the bucket called `name`, creating it if it does not exist.
    pub fn bucket(&self, name: impl AsRef<str>) -> Result<Bucket> {
        let name = name.as_ref();
        let db = self.database()?;
        let txn = db.begin_write().or_raise(|| ErrorKind::Storage)?;
        txn.open_table(table(name)).or_raise(|| ErrorKind::Storage)?;
        txn.commit().or_raise(|| ErrorKind::Storage)?;
        Ok(Bucket::new(self.clone(), name.to_string()))
    }

    /// Drop the bucket called `name` and everything in it.
    pub fn delete_bucket(&self, name: impl AsRef<str>) -> Result<()> {
        let name = name.as_ref();
        let db = self.database()?;
        let txn = db.begin_write().or_raise(|| ErrorKind::Storage)?;
        let existed = txn.delete_table(table(name)).or_raise(|| ErrorKind::Storage)?;
        if !existed {
            txn.abort().or_raise(|| ErrorKind::Storage)?;
            exn::bail!(ErrorKind::BucketNotFound(name.to_string()));
        }
        txn.commit().or_raise(|| ErrorKind::Storage)?;
        tracing::info!(bucket = name, "deleted bucket");
        Ok(())
    }

    /// Names of every bucket in the store, in lexicographic order.
    pub fn buckets(&self) -> Result<Vec<String>> {
        let db = self.database()?;
        let txn = db.begin_read().or_raise(|| ErrorKind::Storage)?;
        let mut names: Vec<String> = txn
            .list_tables()
            .or_raise(|| ErrorKind::Storage)?
            .map(|handle| handle.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Shared access to the open database.
    ///
    /// Recursive, so that a scan callback can use the store again while a
    /// compaction is queued for the exclusive side.
    pub(crate) fn database(&self) -> Result<MappedRwLockReadGuard<'_, Database>> {
        RwLockReadGuard::try_map(self.inner.db.read_recursive(), Option::as_ref)
            .ok()
            .ok_or_raise(|| ErrorKind::Closed)
    }

    /// Rewrite the whole file without the contents of `target`.
    ///
    /// Holds the exclusive side of the handle lock throughout. Until the
    /// rename, the original file stays open and authoritative; a failure
    /// there removes the temporary file and leaves everything as it was.
    #[instrument(level = "debug", skip(self), fields(path = %self.inner.path.display()))]
    pub(crate) fn clear_and_compact(&self, target: &str) -> Result<()> {
        let path = self.inner.path.clone();
        let tmp = tmp_path(&path);
        let mut guard = self.inner.db.write();
        let Some(db) = &*guard else {
            exn::bail!(ErrorKind::Closed);
        };
        if !has_table(db, target)? {
            exn::bail!(ErrorKind::BucketNotFound(target.to_string()));
        }
        if let Err(err) = copy_without(db, &tmp, target) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.raise(ErrorKind::Compaction(path)));
        }

        // The original has to be closed (lock released) before it can be
        // replaced and reopened.
        drop(guard.take());
        if let Err(err) = std::fs::rename(&tmp, &path).or_raise(|| ErrorKind::Io) {
            let _ = std::fs::remove_file(&tmp);
            *guard = Some(acquire(&path, self.inner.timeout)?);
            return Err(err.raise(ErrorKind::Compaction(path)));
        }
        *guard = Some(acquire(&path, self.inner.timeout)?);
        tracing::info!(bucket = target, "cleared and compacted");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    PathBuf::from(tmp)
}

fn remove_stale_tmp(path: &Path) -> Result<()> {
    let tmp = tmp_path(path);
    match std::fs::remove_file(&tmp) {
        Ok(()) => {
            tracing::warn!(path = %tmp.display(), "removed leftover compaction file");
            Ok(())
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).or_raise(|| ErrorKind::Io),
    }
}

/// Open the file, polling while another handle holds its lock.
fn acquire(path: &Path, timeout: Duration) -> Result<Database> {
    let deadline = Instant::now() + timeout;
    loop {
        match Database::create(path) {
            Ok(db) => return Ok(db),
            Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                std::thread::sleep(LOCK_POLL_INTERVAL);
            },
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                exn::bail!(ErrorKind::LockTimeout(path.to_path_buf()));
            },
            Err(err) => return Err(err).or_raise(|| ErrorKind::Open(path.to_path_buf())),
        }
    }
}

fn has_table(db: &Database, name: &str) -> Result<bool> {
    let txn = db.begin_read().or_raise(|| ErrorKind::Storage)?;
    let found = txn
        .list_tables()
        .or_raise(|| ErrorKind::Storage)?
        .any(|handle| handle.name() == name);
    Ok(found)
}

/// Copy every table except `skip` into a fresh database at `tmp`. The skipped
/// table is recreated empty so it still exists after the swap.
fn copy_without(source: &Database, tmp: &Path, skip: &str) -> Result<()> {
    let _ = std::fs::remove_file(tmp);
    let fresh = Database::create(tmp).or_raise(|| ErrorKind::Open(tmp.to_path_buf()))?;
    let read = source.begin_read().or_raise(|| ErrorKind::Storage)?;
    let write = fresh.begin_write().or_raise(|| ErrorKind::Storage)?;
    for handle in read.list_tables().or_raise(|| ErrorKind::Storage)? {
        let name = handle.name();
        let mut dst = write.open_table(table(name)).or_raise(|| ErrorKind::Storage)?;
        if name == skip {
            continue;
        }
        let src = read.open_table(table(name)).or_raise(|| ErrorKind::Storage)?;
        for entry in src.iter().or_raise(|| ErrorKind::Storage)? {
            let (key, value) = entry.or_raise(|| ErrorKind::Storage)?;
            dst.insert(key.value(), value.value()).or_raise(|| ErrorKind::Storage)?;
        }
    }
    write.commit().or_raise(|| ErrorKind::Storage)?;
    Ok(())
}
