//! Ordered key walks shared by bucket reads and scanners.

use exn::ResultExt;
use redb::ReadableTable;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use crate::bucket::Bucket;
use crate::error::{ErrorKind, Result};
use crate::item::Item;

/// Number of items [`ScanIter`] fetches per read transaction.
const PAGE_SIZE: usize = 256;

/// Which keys of a bucket a walk visits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Bounds {
    All,
    Prefix(Vec<u8>),
    /// Half-open `[min, max)`.
    Range(Vec<u8>, Vec<u8>),
}

/// Visit the entries of `table` within `bounds` in key order, starting
/// strictly after `after` when given. `visit` returns `false` to stop early.
pub(crate) fn walk<T>(
    table: &T,
    bounds: &Bounds,
    after: Option<&[u8]>,
    mut visit: impl FnMut(&[u8], &[u8]) -> Result<bool>,
) -> Result<()>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    if let Bounds::Range(min, max) = bounds
        && min >= max
    {
        return Ok(());
    }
    let start: Bound<&[u8]> = match (after, bounds) {
        (Some(key), _) => Bound::Excluded(key),
        (None, Bounds::All) => Bound::Unbounded,
        (None, Bounds::Prefix(prefix)) => Bound::Included(prefix.as_slice()),
        (None, Bounds::Range(min, _)) => Bound::Included(min.as_slice()),
    };
    let end: Bound<&[u8]> = match bounds {
        Bounds::Range(_, max) => Bound::Excluded(max.as_slice()),
        _ => Bound::Unbounded,
    };
    if let (Bound::Excluded(from), Bound::Excluded(to)) = (start, end)
        && from >= to
    {
        return Ok(());
    }
    for entry in table.range::<&[u8]>((start, end)).or_raise(|| ErrorKind::Storage)? {
        let (key, value) = entry.or_raise(|| ErrorKind::Storage)?;
        let (key, value) = (key.value(), value.value());
        if let Bounds::Prefix(prefix) = bounds
            && !key.starts_with(prefix)
        {
            break;
        }
        if !visit(key, value)? {
            break;
        }
    }
    Ok(())
}

/// A reusable description of a prefix or range over one bucket.
///
/// Nothing is read until one of the evaluating methods is called, and every
/// call reads the bucket afresh.
#[derive(Debug, Clone)]
pub struct Scanner {
    bucket: Bucket,
    bounds: Bounds,
}

impl Scanner {
    pub(crate) fn new(bucket: Bucket, bounds: Bounds) -> Self {
        Self { bucket, bounds }
    }

    pub fn items(&self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        self.bucket.walk(&self.bounds, None, |key, value| {
            items.push(Item::new(key, value));
            Ok(true)
        })?;
        Ok(items)
    }

    pub fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.bucket.walk(&self.bounds, None, |key, _| {
            keys.push(key.to_vec());
            Ok(true)
        })?;
        Ok(keys)
    }

    pub fn values(&self) -> Result<Vec<Vec<u8>>> {
        let mut values = Vec::new();
        self.bucket.walk(&self.bounds, None, |_, value| {
            values.push(value.to_vec());
            Ok(true)
        })?;
        Ok(values)
    }

    pub fn count(&self) -> Result<usize> {
        let mut count = 0;
        self.bucket.walk(&self.bounds, None, |_, _| {
            count += 1;
            Ok(true)
        })?;
        Ok(count)
    }

    /// Apply `f` to every matching entry; the first callback error aborts the
    /// scan and is returned as [`ErrorKind::Callback`].
    pub fn map<F, E>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> std::result::Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.bucket.walk(&self.bounds, None, |key, value| {
            f(key, value).or_raise(|| ErrorKind::Callback)?;
            Ok(true)
        })
    }

    pub fn item_mapping(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut mapping = BTreeMap::new();
        self.bucket.walk(&self.bounds, None, |key, value| {
            mapping.insert(key.to_vec(), value.to_vec());
            Ok(true)
        })?;
        Ok(mapping)
    }

    /// Lazily page through the matching entries.
    pub fn iter(&self) -> ScanIter {
        ScanIter {
            bucket: self.bucket.clone(),
            bounds: self.bounds.clone(),
            after: None,
            page: VecDeque::new(),
            done: false,
        }
    }
}

impl IntoIterator for &Scanner {
    type Item = Result<Item>;
    type IntoIter = ScanIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator returned by [`Scanner::iter`].
///
/// Reads one page per read transaction and resumes after the last key it
/// returned, so no transaction is held between calls to `next` and writes
/// made in between are visible to later pages. Stops after the first error.
#[derive(Debug)]
pub struct ScanIter {
    bucket: Bucket,
    bounds: Bounds,
    after: Option<Vec<u8>>,
    page: VecDeque<Item>,
    done: bool,
}

impl ScanIter {
    fn fill(&mut self) -> Result<()> {
        let mut page = Vec::with_capacity(PAGE_SIZE);
        self.bucket.walk(&self.bounds, self.after.as_deref(), |key, value| {
            page.push(Item::new(key, value));
            Ok(page.len() < PAGE_SIZE)
        })?;
        if page.len() < PAGE_SIZE {
            self.done = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(last.key.clone());
        }
        self.page.extend(page);
        Ok(())
    }
}

impl Iterator for ScanIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.done {
            if let Err(err) = self.fill() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.page.pop_front().map(Ok)
    }
}
