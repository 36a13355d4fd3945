//! Ordered key-value backends under the metadata store.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::path::Path;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use tracing::debug;

use crate::codec::{describe_row, prefix_upper_bound};
use crate::error::SyncError;

const ROWS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rows");

pub type Row = (Vec<u8>, Vec<u8>);

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SyncError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), SyncError>;
    fn delete(&self, key: &[u8]) -> Result<(), SyncError>;

    /// Up to `limit` rows starting with `prefix` and strictly after `after`, in key order.
    fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<Row>, SyncError>;

    /// Adds `delta` to the big-endian i64 under `key` (absent reads as 0) and returns the new value.
    fn increment(&self, key: &[u8], delta: i64) -> Result<i64, SyncError>;

    /// Writes `new` (or deletes on `None`) only if the current value equals `expected`.
    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, SyncError>;
}

fn store_err(err: impl std::fmt::Display) -> SyncError {
    SyncError::Store(err.to_string())
}

fn decode_counter(key: &[u8], bytes: &[u8]) -> Result<i64, SyncError> {
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
        SyncError::Store(format!("counter {} is not an 8-byte integer", describe_row(key)))
    })?;
    Ok(i64::from_be_bytes(bytes))
}

fn add_to_counter(key: &[u8], current: i64, delta: i64) -> Result<i64, SyncError> {
    current.checked_add(delta).ok_or_else(|| {
        SyncError::Store(format!("counter {} overflows adding {delta}", describe_row(key)))
    })
}

type KeyRange<'a> = (Bound<&'a [u8]>, Bound<&'a [u8]>);

/// Range for one page of a prefix scan, `None` when the cursor is already past the prefix.
fn scan_bounds<'a>(
    prefix: &'a [u8],
    after: Option<&'a [u8]>,
    upper: Option<&'a [u8]>,
) -> Option<KeyRange<'a>> {
    if let (Some(after), Some(upper)) = (after, upper) {
        if after >= upper {
            return None;
        }
    }
    let start = match after {
        Some(after) if after >= prefix => Bound::Excluded(after),
        _ => Bound::Included(prefix),
    };
    let end = match upper {
        Some(upper) => Bound::Excluded(upper),
        None => Bound::Unbounded,
    };
    Some((start, end))
}

/// Persistent store in a single redb table. Every mutation is its own write transaction.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(store_err)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let write_txn = db.begin_write().map_err(store_err)?;
        {
            let _rows = write_txn.open_table(ROWS).map_err(store_err)?;
        }
        write_txn.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    fn write<T>(
        &self,
        apply: impl FnOnce(&mut redb::Table<'_, &'static [u8], &'static [u8]>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let write_txn = self.db.begin_write().map_err(store_err)?;
        let result = {
            let mut table = write_txn.open_table(ROWS).map_err(store_err)?;
            apply(&mut table)?
        };
        write_txn.commit().map_err(store_err)?;
        Ok(result)
    }

    fn read_table(&self) -> Result<redb::ReadOnlyTable<&'static [u8], &'static [u8]>, SyncError> {
        let read_txn = self.db.begin_read().map_err(store_err)?;
        read_txn.open_table(ROWS).map_err(|err| match err {
            TableError::TableDoesNotExist(name) => SyncError::StoreUnavailable(name),
            other => store_err(other),
        })
    }
}

impl KeyValueStore for RedbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SyncError> {
        let table = self.read_table()?;
        let value = table.get(key).map_err(store_err)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), SyncError> {
        self.write(|table| {
            table.insert(key, value).map_err(store_err)?;
            Ok(())
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), SyncError> {
        self.write(|table| {
            table.remove(key).map_err(store_err)?;
            Ok(())
        })
    }

    fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<Row>, SyncError> {
        let upper = prefix_upper_bound(prefix);
        let Some(bounds) = scan_bounds(prefix, after, upper.as_deref()) else {
            return Ok(Vec::new());
        };
        let table = self.read_table()?;
        let range = table.range::<&[u8]>(bounds).map_err(store_err)?;
        let mut rows = Vec::new();
        for entry in range.take(limit) {
            let (key, value) = entry.map_err(store_err)?;
            rows.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(rows)
    }

    fn increment(&self, key: &[u8], delta: i64) -> Result<i64, SyncError> {
        self.write(|table| {
            let current = match table.get(key).map_err(store_err)? {
                Some(bytes) => decode_counter(key, bytes.value())?,
                None => 0,
            };
            let next = add_to_counter(key, current, delta)?;
            table.insert(key, next.to_be_bytes().as_slice()).map_err(store_err)?;
            Ok(next)
        })
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, SyncError> {
        self.write(|table| {
            let matches = {
                let current = table.get(key).map_err(store_err)?;
                current.as_ref().map(|guard| guard.value()) == expected
            };
            if !matches {
                return Ok(false);
            }
            match new {
                Some(value) => {
                    table.insert(key, value).map_err(store_err)?;
                }
                None => {
                    table.remove(key).map_err(store_err)?;
                }
            }
            Ok(true)
        })
    }
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.rows.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), SyncError> {
        self.rows.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), SyncError> {
        self.rows.write().remove(key);
        Ok(())
    }

    fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<Row>, SyncError> {
        let upper = prefix_upper_bound(prefix);
        let Some(bounds) = scan_bounds(prefix, after, upper.as_deref()) else {
            return Ok(Vec::new());
        };
        let rows = self.rows.read();
        Ok(rows
            .range::<[u8], _>(bounds)
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn increment(&self, key: &[u8], delta: i64) -> Result<i64, SyncError> {
        let mut rows = self.rows.write();
        let current = match rows.get(key) {
            Some(bytes) => decode_counter(key, bytes)?,
            None => 0,
        };
        let next = add_to_counter(key, current, delta)?;
        rows.insert(key.to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<bool, SyncError> {
        let mut rows = self.rows.write();
        if rows.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                rows.insert(key.to_vec(), value.to_vec());
            }
            None => {
                rows.remove(key);
            }
        }
        Ok(true)
    }
}

/// Lazy prefix scan that reads `page_size` rows at a time.
///
/// Each page is fetched in its own read transaction that is closed before the
/// page is handed out, so dropping the iterator early leaks nothing. Rows written
/// behind the cursor during iteration are not revisited. A missing store or table
/// ends the scan as empty.
pub struct PrefixScan<'a> {
    store: &'a dyn KeyValueStore,
    prefix: Vec<u8>,
    after: Option<Vec<u8>>,
    page: VecDeque<Row>,
    page_size: usize,
    exhausted: bool,
}

impl<'a> PrefixScan<'a> {
    pub fn new(store: &'a dyn KeyValueStore, prefix: Vec<u8>, page_size: usize) -> Self {
        Self {
            store,
            prefix,
            after: None,
            page: VecDeque::new(),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> Result<(), SyncError> {
        let rows = match self
            .store
            .scan_page(&self.prefix, self.after.as_deref(), self.page_size)
        {
            Ok(rows) => rows,
            Err(SyncError::StoreUnavailable(reason)) => {
                debug!("scan of {} reads as empty: {reason}", describe_row(&self.prefix));
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some((last, _)) = rows.last() {
            self.after = Some(last.clone());
        }
        self.page.extend(rows);
        Ok(())
    }
}

impl Iterator for PrefixScan<'_> {
    type Item = Result<Row, SyncError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        self.page.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn seed(store: &dyn KeyValueStore) {
        for key in ["a1", "a2", "a3", "b1", "a0"] {
            store.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
    }

    #[test]
    fn scan_page_is_prefix_bounded_and_ordered() {
        let store = MemoryStore::new();
        seed(&store);
        let rows = store.scan_page(b"a", None, 10).unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a0".as_slice(), b"a1", b"a2", b"a3"]);
        let rows = store.scan_page(b"a", Some(b"a1"), 2).unwrap();
        assert_eq!(rows[0].0, b"a2");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn prefix_scan_pages_through_everything() {
        let store = MemoryStore::new();
        seed(&store);
        let keys: Vec<_> = PrefixScan::new(&store, b"a".to_vec(), 1)
            .map(|row| row.unwrap().0)
            .collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys.last().unwrap(), b"a3");
    }

    #[test]
    fn increment_starts_from_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.increment(b"#c", 1).unwrap(), 1);
        assert_eq!(store.increment(b"#c", 5).unwrap(), 6);
    }

    #[test]
    fn increment_rejects_overflow() {
        let store = MemoryStore::new();
        store.increment(b"#c", i64::MAX).unwrap();
        assert_matches!(store.increment(b"#c", 1), Err(SyncError::Store(_)));
        assert_eq!(store.increment(b"#c", 0).unwrap(), i64::MAX);
    }

    #[test]
    fn compare_and_swap_checks_current_value() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap(b"k", None, Some(b"v1")).unwrap());
        assert!(!store.compare_and_swap(b"k", None, Some(b"v2")).unwrap());
        assert!(store.compare_and_swap(b"k", Some(b"v1"), None).unwrap());
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn redb_store_matches_memory_store() {
        let temp = tempfile::tempdir().unwrap();
        let store = RedbStore::open(temp.path().join("meta/metadata.redb")).unwrap();
        seed(&store);
        let keys: Vec<_> = PrefixScan::new(&store, b"a".to_vec(), 3)
            .map(|row| row.unwrap().0)
            .collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(store.increment(b"#c", 2).unwrap(), 2);
        assert!(store.compare_and_swap(b"a0", Some(b"a0"), Some(b"x")).unwrap());
        assert_eq!(store.get(b"a0").unwrap(), Some(b"x".to_vec()));
        store.delete(b"a0").unwrap();
        assert_eq!(store.get(b"a0").unwrap(), None);
    }
}
