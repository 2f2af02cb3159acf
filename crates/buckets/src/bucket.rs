use exn::ResultExt;
use redb::{ReadOnlyTable, ReadableDatabase, ReadableTable, TableError, TableHandle};
use std::fmt;

use crate::db::{Store, table};
use crate::error::{ErrorKind, Result};
use crate::item::Item;
use crate::scan::{self, Bounds, Scanner};

type WriteTable<'txn> = redb::Table<'txn, &'static [u8], &'static [u8]>;

/// A named key/value namespace inside a [`Store`].
///
/// Keys are ordered lexicographically by their bytes. Every mutating method
/// is a single write transaction; every read sees one consistent snapshot.
#[derive(Clone)]
pub struct Bucket {
    store: Store,
    name: String,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("path", &self.store.path())
            .finish()
    }
}

impl Bucket {
    pub(crate) fn new(store: Store, name: String) -> Self {
        Self { store, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Run `f` against this bucket's table inside one write transaction,
    /// committing only when `f` succeeds.
    ///
    /// The table must already exist: opening a table for writing would
    /// otherwise silently recreate a bucket that has been deleted.
    fn write<T>(&self, f: impl FnOnce(&mut WriteTable<'_>) -> Result<T>) -> Result<T> {
        let db = self.store.database()?;
        let txn = db.begin_write().or_raise(|| ErrorKind::Storage)?;
        let exists = txn
            .list_tables()
            .or_raise(|| ErrorKind::Storage)?
            .any(|handle| handle.name() == self.name);
        if !exists {
            txn.abort().or_raise(|| ErrorKind::Storage)?;
            exn::bail!(ErrorKind::BucketNotFound(self.name.clone()));
        }
        let output = {
            let mut table = txn.open_table(table(&self.name)).or_raise(|| ErrorKind::Storage)?;
            f(&mut table)?
        };
        txn.commit().or_raise(|| ErrorKind::Storage)?;
        Ok(output)
    }

    fn read<T>(&self, f: impl FnOnce(&ReadOnlyTable<&'static [u8], &'static [u8]>) -> Result<T>) -> Result<T> {
        let db = self.store.database()?;
        let txn = db.begin_read().or_raise(|| ErrorKind::Storage)?;
        let table = match txn.open_table(table(&self.name)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                exn::bail!(ErrorKind::BucketNotFound(self.name.clone()));
            },
            Err(err) => return Err(err).or_raise(|| ErrorKind::Storage),
        };
        f(&table)
    }

    pub(crate) fn walk(
        &self,
        bounds: &Bounds,
        after: Option<&[u8]>,
        visit: impl FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        self.read(|table| scan::walk(table, bounds, after, visit))
    }

    /// Insert or overwrite a single key.
    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.write(|table| {
            table.insert(key.as_ref(), value.as_ref()).or_raise(|| ErrorKind::Storage)?;
            Ok(())
        })
    }

    /// Write `value` only if `key` is absent. Returns whether it was written;
    /// an existing key is left untouched and is not an error.
    pub fn put_nx(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<bool> {
        let key = key.as_ref();
        self.write(|table| {
            if table.get(key).or_raise(|| ErrorKind::Storage)?.is_some() {
                return Ok(false);
            }
            table.insert(key, value.as_ref()).or_raise(|| ErrorKind::Storage)?;
            Ok(true)
        })
    }

    /// Insert or overwrite many items in one transaction.
    pub fn insert(&self, items: impl IntoIterator<Item = Item>) -> Result<()> {
        self.write(|table| {
            for item in items {
                table
                    .insert(item.key.as_slice(), item.value.as_slice())
                    .or_raise(|| ErrorKind::Storage)?;
            }
            Ok(())
        })
    }

    /// Insert the items whose keys are absent, in one transaction. Returns
    /// how many were written. When the same key appears twice the first one
    /// wins.
    pub fn insert_nx(&self, items: impl IntoIterator<Item = Item>) -> Result<usize> {
        self.write(|table| {
            let mut written = 0;
            for item in items {
                let key = item.key.as_slice();
                if table.get(key).or_raise(|| ErrorKind::Storage)?.is_some() {
                    continue;
                }
                table.insert(key, item.value.as_slice()).or_raise(|| ErrorKind::Storage)?;
                written += 1;
            }
            Ok(written)
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        self.read(|table| {
            let value = table.get(key.as_ref()).or_raise(|| ErrorKind::Storage)?;
            Ok(value.map(|guard| guard.value().to_vec()))
        })
    }

    /// Remove a single key. Returns whether it was present.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.write(|table| {
            let removed = table.remove(key.as_ref()).or_raise(|| ErrorKind::Storage)?;
            Ok(removed.is_some())
        })
    }

    /// Number of keys in the bucket. This is a full scan.
    pub fn count(&self) -> Result<usize> {
        self.read(|table| {
            let mut count = 0;
            for entry in table.iter().or_raise(|| ErrorKind::Storage)? {
                entry.or_raise(|| ErrorKind::Storage)?;
                count += 1;
            }
            Ok(count)
        })
    }

    /// Delete every key in one transaction. The bucket itself stays. Returns
    /// how many keys were removed.
    pub fn clear(&self) -> Result<usize> {
        self.write(|table| {
            let mut keys = Vec::new();
            for entry in table.iter().or_raise(|| ErrorKind::Storage)? {
                let (key, _) = entry.or_raise(|| ErrorKind::Storage)?;
                keys.push(key.value().to_vec());
            }
            for key in &keys {
                table.remove(key.as_slice()).or_raise(|| ErrorKind::Storage)?;
            }
            Ok(keys.len())
        })
    }

    /// Empty this bucket and rewrite the database file so the space it used
    /// is returned to the filesystem.
    ///
    /// Every other bucket is copied verbatim into `<path>.tmp`, which then
    /// replaces the original. All other operations on the store wait for this
    /// to finish. See [`Store`] for the failure guarantees.
    pub fn clear_and_compact(&self) -> Result<()> {
        self.store.clear_and_compact(&self.name)
    }

    pub fn items(&self) -> Result<Vec<Item>> {
        self.collect(&Bounds::All)
    }

    /// At most `limit` items, skipping the first `offset` in key order.
    pub fn list_items(&self, offset: usize, limit: usize) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        if limit == 0 {
            return Ok(items);
        }
        let mut skipped = 0;
        self.walk(&Bounds::All, None, |key, value| {
            if skipped < offset {
                skipped += 1;
                return Ok(true);
            }
            items.push(Item::new(key, value));
            Ok(items.len() < limit)
        })?;
        Ok(items)
    }

    pub fn prefix_items(&self, prefix: impl AsRef<[u8]>) -> Result<Vec<Item>> {
        self.collect(&Bounds::Prefix(prefix.as_ref().to_vec()))
    }

    /// Items with `min <= key < max`. Empty when `min >= max`.
    pub fn range_items(&self, min: impl AsRef<[u8]>, max: impl AsRef<[u8]>) -> Result<Vec<Item>> {
        self.collect(&Bounds::Range(min.as_ref().to_vec(), max.as_ref().to_vec()))
    }

    fn collect(&self, bounds: &Bounds) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        self.walk(bounds, None, |key, value| {
            items.push(Item::new(key, value));
            Ok(true)
        })?;
        Ok(items)
    }

    /// Apply `f` to every item in key order. The first callback error aborts
    /// the walk and is returned as [`ErrorKind::Callback`].
    pub fn map<F, E>(&self, f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> std::result::Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Scanner::new(self.clone(), Bounds::All).map(f)
    }

    pub fn map_prefix<F, E>(&self, f: F, prefix: impl AsRef<[u8]>) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> std::result::Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.prefix_scanner(prefix).map(f)
    }

    pub fn map_range<F, E>(&self, f: F, min: impl AsRef<[u8]>, max: impl AsRef<[u8]>) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> std::result::Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.range_scanner(min, max).map(f)
    }

    /// Apply `f` to one page of items. Callback errors are logged and the
    /// walk carries on; only storage errors are returned.
    pub fn map_list_items<F, E>(&self, mut f: F, offset: usize, limit: usize) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        for item in self.list_items(offset, limit)? {
            if let Err(err) = f(&item.key, &item.value) {
                tracing::debug!(bucket = %self.name, error = %err, "ignoring callback error");
            }
        }
        Ok(())
    }

    pub fn prefix_scanner(&self, prefix: impl AsRef<[u8]>) -> Scanner {
        Scanner::new(self.clone(), Bounds::Prefix(prefix.as_ref().to_vec()))
    }

    pub fn range_scanner(&self, min: impl AsRef<[u8]>, max: impl AsRef<[u8]>) -> Scanner {
        Scanner::new(self.clone(), Bounds::Range(min.as_ref().to_vec(), max.as_ref().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("store.db")).unwrap();
        (dir, store)
    }

    fn keys(items: &[Item]) -> Vec<&[u8]> {
        items.iter().map(|item| item.key.as_slice()).collect()
    }

    #[test]
    fn test_put_get_and_overwrite() {
        let (_dir, store) = store();
        let bucket = store.bucket("data").unwrap();
        assert_eq!(bucket.get("missing").unwrap(), None);
        bucket.put("k", "v1").unwrap();
        assert_eq!(bucket.get("k").unwrap(), Some(b"v1".to_vec()));
        bucket.put("k", "v2").unwrap();
        assert_eq!(bucket.get("k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_put_nx_first_write_wins() {
        let (_dir, store) = store();
        let bucket = store.bucket("b").unwrap();
        assert!(bucket.put_nx("k", "v1").unwrap());
        assert!(!bucket.put_nx("k", "v2").unwrap());
        assert_eq!(bucket.get("k").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_insert_round_trip() {
        let (_dir, store) = store();
        let bucket = store.bucket("b").unwrap();
        let items = vec![Item::new("x", "1"), Item::new("y", "2")];
        bucket.insert(items.clone()).unwrap();
        for item in &items {
            assert_eq!(bucket.get(&item.key).unwrap(), Some(item.value.clone()));
        }
        assert_eq!(bucket.count().unwrap(), 2);
    }

    #[test]
    fn test_insert_nx_skips_existing_keys() {
        let (_dir, store) = store();
        let bucket = store.bucket("b").unwrap();
        bucket.put("a", "old").unwrap();
        let written = bucket
            .insert_nx([Item::new("a", "new"), Item::new("b", "1"), Item::new("b", "2")])
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(bucket.get("a").unwrap(), Some(b"old".to_vec()));
        assert_eq!(bucket.get("b").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_delete_and_clear() {
        let (_dir, store) = store();
        let bucket = store.bucket("b").unwrap();
        bucket.insert([Item::new("a", "1"), Item::new("b", "2"), Item::new("c", "3")]).unwrap();
        assert!(bucket.delete("a").unwrap());
        assert!(!bucket.delete("a").unwrap());
        assert_eq!(bucket.clear().unwrap(), 2);
        assert_eq!(bucket.count().unwrap(), 0);
        // Cleared, not deleted.
        assert_eq!(store.buckets().unwrap(), vec!["b"]);
        bucket.put("d", "4").unwrap();
        assert_eq!(bucket.count().unwrap(), 1);
    }

    #[test]
    fn test_deleted_bucket_is_neither_readable_nor_writable() {
        let (_dir, store) = store();
        let bucket = store.bucket("b").unwrap();
        bucket.put("k", "v").unwrap();
        store.delete_bucket("b").unwrap();

        assert!(matches!(&*bucket.get("k").unwrap_err(), ErrorKind::BucketNotFound(_)));
        assert!(matches!(&*bucket.put("k", "v").unwrap_err(), ErrorKind::BucketNotFound(_)));
        assert!(matches!(&*bucket.count().unwrap_err(), ErrorKind::BucketNotFound(_)));
        // The failed write must not have brought the bucket back.
        assert!(store.buckets().unwrap().is_empty());

        let recreated = store.bucket("b").unwrap();
        assert_eq!(recreated.get("k").unwrap(), None);
        assert_eq!(bucket.count().unwrap(), 0);
    }

    #[rstest]
    #[case::half_open("a", "c", &[b"a".as_slice(), b"b"])]
    #[case::everything("", "z", &[b"a".as_slice(), b"b", b"c"])]
    #[case::between_keys("aa", "bb", &[b"b".as_slice()])]
    #[case::equal_bounds("b", "b", &[])]
    #[case::inverted_bounds("c", "a", &[])]
    fn test_range_items(#[case] min: &str, #[case] max: &str, #[case] expected: &[&[u8]]) {
        let (_dir, store) = store();
        let bucket = store.bucket("r").unwrap();
        bucket.insert([Item::new("a", "1"), Item::new("b", "2"), Item::new("c", "3")]).unwrap();
        assert_eq!(keys(&bucket.range_items(min, max).unwrap()), expected);
    }

    #[test]
    fn test_prefix_items_are_ordered_and_bounded() {
        let (_dir, store) = store();
        let bucket = store.bucket("p").unwrap();
        bucket
            .insert(["user/2", "user/10", "user/1", "users", "use", "video/1"].map(|key| Item::new(key, "")))
            .unwrap();
        let items = bucket.prefix_items("user/").unwrap();
        assert_eq!(keys(&items), vec![b"user/1".as_slice(), b"user/10", b"user/2"]);
        assert!(bucket.prefix_items("nothing").unwrap().is_empty());
        assert_eq!(bucket.items().unwrap().len(), 6);
    }

    #[rstest]
    #[case::first_page(0, 2, &[b"k0".as_slice(), b"k1"])]
    #[case::middle_page(2, 2, &[b"k2".as_slice(), b"k3"])]
    #[case::short_last_page(4, 2, &[b"k4".as_slice()])]
    #[case::past_the_end(9, 2, &[])]
    #[case::zero_limit(0, 0, &[])]
    fn test_list_items_pagination(#[case] offset: usize, #[case] limit: usize, #[case] expected: &[&[u8]]) {
        let (_dir, store) = store();
        let bucket = store.bucket("l").unwrap();
        bucket.insert((0..5).map(|n| Item::new(format!("k{n}"), ""))).unwrap();
        assert_eq!(keys(&bucket.list_items(offset, limit).unwrap()), expected);
    }

    #[test]
    fn test_map_range_propagates_callback_error() {
        let (_dir, store) = store();
        let bucket = store.bucket("m").unwrap();
        bucket.insert((0..5).map(|n| Item::new(format!("k{n}"), ""))).unwrap();

        let mut visited = Vec::new();
        let err = bucket
            .map_range(
                |key, _| {
                    visited.push(key.to_vec());
                    match key {
                        b"k2" => Err(std::io::Error::other("bad record")),
                        _ => Ok(()),
                    }
                },
                "k1",
                "k4",
            )
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Callback));
        assert_eq!(visited, vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn test_map_list_items_ignores_callback_errors() {
        let (_dir, store) = store();
        let bucket = store.bucket("m").unwrap();
        bucket.insert((0..5).map(|n| Item::new(format!("k{n}"), ""))).unwrap();

        let mut visited = 0;
        bucket
            .map_list_items(
                |_, _| {
                    visited += 1;
                    Err(std::io::Error::other("always fails"))
                },
                1,
                3,
            )
            .unwrap();
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_map_prefix_visits_every_match() {
        let (_dir, store) = store();
        let bucket = store.bucket("m").unwrap();
        bucket.insert([Item::new("a/1", "x"), Item::new("a/2", "y"), Item::new("b/1", "z")]).unwrap();
        let mut values = Vec::new();
        bucket
            .map_prefix(
                |_, value| {
                    values.push(value.to_vec());
                    Ok::<_, std::io::Error>(())
                },
                "a/",
            )
            .unwrap();
        assert_eq!(values, vec![b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn test_clear_and_compact_preserves_other_buckets() {
        let (dir, store) = store();
        let keep = store.bucket("keep").unwrap();
        let purge = store.bucket("drop").unwrap();
        keep.insert((0..100).map(|n| Item::new(format!("k{n:03}"), vec![n as u8; 64]))).unwrap();
        purge.insert((0..2000).map(|n| Item::new(format!("d{n:05}"), vec![0xAB; 512]))).unwrap();

        purge.clear_and_compact().unwrap();

        // The same handles keep working against the rebound database.
        assert_eq!(purge.count().unwrap(), 0);
        assert_eq!(keep.count().unwrap(), 100);
        assert_eq!(keep.get("k042").unwrap(), Some(vec![42u8; 64]));
        assert_eq!(store.buckets().unwrap(), vec!["drop", "keep"]);
        assert!(!dir.path().join("store.db.tmp").exists());
        purge.put("fresh", "1").unwrap();

        // And the result is durable.
        let path = store.path().to_path_buf();
        store.close();
        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.bucket("keep").unwrap().count().unwrap(), 100);
        assert_eq!(reopened.bucket("drop").unwrap().get("fresh").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_clear_and_compact_missing_bucket_leaves_store_open() {
        let (_dir, store) = store();
        let bucket = store.bucket("gone").unwrap();
        store.bucket("other").unwrap().put("k", "v").unwrap();
        store.delete_bucket("gone").unwrap();

        let err = bucket.clear_and_compact().unwrap_err();
        assert!(matches!(&*err, ErrorKind::BucketNotFound(_)));
        assert!(store.is_open());
        assert_eq!(store.bucket("other").unwrap().get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_closed_store_rejects_bucket_operations() {
        let (_dir, store) = store();
        let bucket = store.bucket("b").unwrap();
        store.close();
        assert!(matches!(&*bucket.put("k", "v").unwrap_err(), ErrorKind::Closed));
        assert!(matches!(&*bucket.get("k").unwrap_err(), ErrorKind::Closed));
    }
}
