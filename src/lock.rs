//! Lease locks on `(row, column)` pairs.
//!
//! A lease is a token `{owner, expires_at_ms}` stored under the lock row and
//! swapped in with compare-and-swap. An expired lease is free to take, so a
//! crashed holder never wedges a row for longer than the lease duration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::{describe_row, lock_row};
use crate::error::SyncError;
use crate::kv::KeyValueStore;

const INITIAL_BACKOFF_MS: u64 = 10;
const MAX_BACKOFF_MS: u64 = 500;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    pub duration: Duration,
    pub timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(5_000),
            timeout: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    owner: String,
    expires_at_ms: i64,
}

impl Lease {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_owner() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

fn encode_lease(lease: &Lease) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(lease).map_err(|err| SyncError::serialization("lock", err))
}

pub struct LockManager {
    kv: Arc<dyn KeyValueStore>,
    settings: LockSettings,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: LockSettings) -> Self {
        Self { kv, settings }
    }

    pub fn settings(&self) -> LockSettings {
        self.settings
    }

    /// Blocks until the lease is taken or the configured timeout elapses.
    pub fn acquire(&self, row: &[u8], column: &str) -> Result<Lock<'_>, SyncError> {
        self.acquire_with(row, column, self.settings.duration, self.settings.timeout)
    }

    pub fn acquire_with(
        &self,
        row: &[u8],
        column: &str,
        duration: Duration,
        timeout: Duration,
    ) -> Result<Lock<'_>, SyncError> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(INITIAL_BACKOFF_MS);
        loop {
            if let Some(lock) = self.try_acquire(row, column, duration)? {
                return Ok(lock);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(SyncError::LockTimeout {
                    row: describe_row(row),
                    column: column.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            let pause = backoff.min(timeout - waited);
            debug!(
                "lock {column} on {} busy; retrying in {}ms",
                describe_row(row),
                pause.as_millis()
            );
            thread::sleep(pause);
            backoff = (backoff * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
        }
    }

    /// Takes the lease if it is free or expired; never waits.
    pub fn try_acquire(
        &self,
        row: &[u8],
        column: &str,
        duration: Duration,
    ) -> Result<Option<Lock<'_>>, SyncError> {
        let key = lock_row(row, column);
        let current = self.kv.get(&key)?;
        if let Some(bytes) = &current {
            match serde_json::from_slice::<Lease>(bytes) {
                Ok(lease) if !lease.is_expired(now_ms()) => return Ok(None),
                Ok(_) => {}
                Err(err) => warn!("replacing unreadable lease on {}: {err}", describe_row(&key)),
            }
        }
        let lease = Lease {
            owner: new_owner(),
            expires_at_ms: now_ms() + duration.as_millis() as i64,
        };
        let token = encode_lease(&lease)?;
        if !self
            .kv
            .compare_and_swap(&key, current.as_deref(), Some(&token))?
        {
            return Ok(None);
        }
        Ok(Some(Lock {
            manager: self,
            key,
            row: describe_row(row),
            column: column.to_string(),
            token,
            released: false,
        }))
    }

    fn release_token(&self, key: &[u8], token: &[u8]) -> Result<bool, SyncError> {
        self.kv.compare_and_swap(key, Some(token), None)
    }

    fn check_token(&self, key: &[u8], token: &[u8]) -> Result<bool, SyncError> {
        let current = self.kv.get(key)?;
        if current.as_deref() != Some(token) {
            return Ok(false);
        }
        let lease: Lease =
            serde_json::from_slice(token).map_err(|err| SyncError::serialization("lock", err))?;
        Ok(!lease.is_expired(now_ms()))
    }
}

/// A held lease. Dropping it releases the lease.
pub struct Lock<'a> {
    manager: &'a LockManager,
    key: Vec<u8>,
    row: String,
    column: String,
    token: Vec<u8>,
    released: bool,
}

impl Lock<'_> {
    /// Fails with `LockLost` once the lease has expired or been taken over.
    pub fn check_locked(&self) -> Result<(), SyncError> {
        if self.manager.check_token(&self.key, &self.token)? {
            Ok(())
        } else {
            Err(SyncError::LockLost {
                row: self.row.clone(),
                column: self.column.clone(),
            })
        }
    }

    /// Extends the lease by `duration` from now.
    pub fn refresh(&mut self, duration: Duration) -> Result<(), SyncError> {
        let mut lease: Lease = serde_json::from_slice(&self.token)
            .map_err(|err| SyncError::serialization("lock", err))?;
        lease.expires_at_ms = now_ms() + duration.as_millis() as i64;
        let token = encode_lease(&lease)?;
        if !self
            .manager
            .kv
            .compare_and_swap(&self.key, Some(&self.token), Some(&token))?
        {
            return Err(SyncError::LockLost {
                row: self.row.clone(),
                column: self.column.clone(),
            });
        }
        self.token = token;
        Ok(())
    }

    pub fn release(mut self) -> Result<(), SyncError> {
        self.released = true;
        if !self.manager.release_token(&self.key, &self.token)? {
            debug!("lock {} on {} already expired or taken", self.column, self.row);
        }
        Ok(())
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.manager.release_token(&self.key, &self.token) {
            warn!("failed to release lock {} on {}: {err}", self.column, self.row);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::kv::MemoryStore;

    fn manager(timeout_ms: u64) -> LockManager {
        LockManager::new(
            Arc::new(MemoryStore::new()),
            LockSettings {
                duration: Duration::from_secs(5),
                timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[test]
    fn second_holder_times_out() {
        let locks = manager(50);
        let _held = locks.acquire(b"S:1", "lock").unwrap();
        let err = locks.acquire(b"S:1", "lock").err().unwrap();
        assert_matches!(err, SyncError::LockTimeout { column, .. } if column == "lock");
    }

    #[test]
    fn columns_are_independent() {
        let locks = manager(50);
        let _a = locks.acquire(b"S:1", "a").unwrap();
        assert!(locks.try_acquire(b"S:1", "b", Duration::from_secs(1)).unwrap().is_some());
    }

    #[test]
    fn release_frees_the_row() {
        let locks = manager(50);
        let held = locks.acquire(b"P", "counters").unwrap();
        held.release().unwrap();
        assert!(locks.try_acquire(b"P", "counters", Duration::from_secs(1)).unwrap().is_some());
    }

    #[test]
    fn drop_frees_the_row() {
        let locks = manager(50);
        {
            let _held = locks.acquire(b"P", "counters").unwrap();
        }
        assert!(locks.acquire(b"P", "counters").is_ok());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let locks = manager(1_000);
        let stale = locks
            .try_acquire(b"S:1", "lock", Duration::from_millis(20))
            .unwrap()
            .unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_matches!(stale.check_locked(), Err(SyncError::LockLost { .. }));
        let fresh = locks.acquire(b"S:1", "lock").unwrap();
        fresh.check_locked().unwrap();
        drop(stale);
        fresh.check_locked().unwrap();
    }

    #[test]
    fn refresh_extends_the_lease() {
        let locks = manager(50);
        let mut held = locks
            .try_acquire(b"S:1", "lock", Duration::from_millis(20))
            .unwrap()
            .unwrap();
        held.refresh(Duration::from_secs(5)).unwrap();
        thread::sleep(Duration::from_millis(40));
        held.check_locked().unwrap();
    }
}
