//! Idempotence locks for routine fires: a single conditional "set if not
//! exists" with a TTL. The store is swappable so tests run against the
//! in-memory variant while deployments share the SQLite-backed one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::Mutex;

use crate::core::store::Store;

#[async_trait]
pub trait IdempotenceStore: Send + Sync {
    /// Returns true only for the caller that created the key; false when
    /// another holder already owns it and it has not expired.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotenceStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, expiry| *expiry > now);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

pub struct SqliteLockStore {
    store: Arc<Store>,
}

impl SqliteLockStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IdempotenceStore for SqliteLockStore {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let expires_at = (Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        self.store.try_acquire_sched_lock(key, &expires_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lock_acquires_once_per_key() {
        let locks = MemoryLockStore::new();
        assert!(locks.try_acquire("r1:2026-08-05T19:30", Duration::from_secs(3600)).await.unwrap());
        assert!(!locks.try_acquire("r1:2026-08-05T19:30", Duration::from_secs(3600)).await.unwrap());
        assert!(locks.try_acquire("r1:2026-08-05T19:31", Duration::from_secs(3600)).await.unwrap());
    }

    #[tokio::test]
    async fn memory_lock_expires() {
        let locks = MemoryLockStore::new();
        assert!(locks.try_acquire("k", Duration::from_millis(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks.try_acquire("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn sqlite_lock_acquires_once_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("engine.db")).await.unwrap());
        let locks = SqliteLockStore::new(store);
        assert!(locks.try_acquire("r1:2026-08-05T19:30", Duration::from_secs(3600)).await.unwrap());
        assert!(!locks.try_acquire("r1:2026-08-05T19:30", Duration::from_secs(3600)).await.unwrap());
        assert!(locks.try_acquire("r2:2026-08-05T19:30", Duration::from_secs(3600)).await.unwrap());
    }
}
