//! Id minting from counter rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::codec::{PROJECT_ROW, counter_prefix, counter_row, decode_counter_name};
use crate::domain::StudyId;
use crate::error::SyncError;
use crate::kv::{KeyValueStore, PrefixScan};
use crate::lock::LockManager;

pub const COUNTERS_LOCK: &str = "counters";

/// Mints ids by incrementing a named counter while holding the project counter lock.
pub struct IdGenerator {
    kv: Arc<dyn KeyValueStore>,
    locks: Arc<LockManager>,
}

impl IdGenerator {
    pub fn new(kv: Arc<dyn KeyValueStore>, locks: Arc<LockManager>) -> Self {
        Self { kv, locks }
    }

    /// Next id for `name`, scoped to `study` or, with `None`, to the project.
    ///
    /// Ids start at 1 and never repeat, even when a previous holder crashed
    /// between incrementing and using an id.
    pub fn next_id(&self, study: Option<StudyId>, name: &str) -> Result<i32, SyncError> {
        let lock = self.locks.acquire(PROJECT_ROW, COUNTERS_LOCK)?;
        let value = self.kv.increment(&counter_row(study, name), 1)?;
        lock.release()?;
        i32::try_from(value)
            .map_err(|_| SyncError::Store(format!("counter {name} overflowed: {value}")))
    }

    /// Current value of a counter without bumping it; 0 when never used.
    pub fn current(&self, study: Option<StudyId>, name: &str) -> Result<i64, SyncError> {
        let value = match self.kv.get(&counter_row(study, name)) {
            Ok(value) => value,
            Err(SyncError::StoreUnavailable(_)) => None,
            Err(err) => return Err(err),
        };
        match value {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    SyncError::Store(format!("counter {name} is not an 8-byte integer"))
                })?;
                Ok(i64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    /// Every counter of a scope by name.
    pub fn snapshot(&self, study: Option<StudyId>) -> Result<BTreeMap<String, i64>, SyncError> {
        let mut counters = BTreeMap::new();
        for row in PrefixScan::new(self.kv.as_ref(), counter_prefix(study), 256) {
            let (key, value) = row?;
            let Some(name) = decode_counter_name(&key) else {
                continue;
            };
            let Ok(bytes) = <[u8; 8]>::try_from(value.as_slice()) else {
                continue;
            };
            counters.insert(name.to_string(), i64::from_be_bytes(bytes));
        }
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use assert_matches::assert_matches;

    use super::*;
    use crate::kv::MemoryStore;
    use crate::lock::LockSettings;

    fn generator(timeout_ms: u64) -> (IdGenerator, Arc<LockManager>) {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let locks = Arc::new(LockManager::new(
            kv.clone(),
            LockSettings {
                duration: std::time::Duration::from_secs(5),
                timeout: std::time::Duration::from_millis(timeout_ms),
            },
        ));
        (IdGenerator::new(kv, locks.clone()), locks)
    }

    #[test]
    fn ids_increase_per_counter_and_scope() {
        let (ids, _) = generator(100);
        assert_eq!(ids.next_id(Some(StudyId(1)), "file").unwrap(), 1);
        assert_eq!(ids.next_id(Some(StudyId(1)), "file").unwrap(), 2);
        assert_eq!(ids.next_id(Some(StudyId(1)), "sample").unwrap(), 1);
        assert_eq!(ids.next_id(Some(StudyId(2)), "file").unwrap(), 1);
        assert_eq!(ids.next_id(None, "study").unwrap(), 1);
        assert_eq!(ids.current(Some(StudyId(1)), "file").unwrap(), 2);
        let snapshot = ids.snapshot(None).unwrap();
        assert_eq!(snapshot.get("study"), Some(&1));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn concurrent_minting_never_repeats() {
        let (ids, _) = generator(10_000);
        let ids = Arc::new(ids);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| ids.next_id(Some(StudyId(1)), "file").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<i32> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
        assert_eq!(all.last(), Some(&100));
    }

    #[test]
    fn held_counter_lock_times_out_minting() {
        let (ids, locks) = generator(50);
        let _held = locks.acquire(PROJECT_ROW, COUNTERS_LOCK).unwrap();
        assert_matches!(
            ids.next_id(None, "study"),
            Err(SyncError::LockTimeout { .. })
        );
    }
}
