use async_trait::async_trait;
use std::collections::HashMap;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::rate_limiter::RateLimitRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode rate limit record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for rate limit records, keyed by identity.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn get_limit(&self, identity: &str) -> Result<Option<RateLimitRecord>, StoreError>;

    async fn upsert_limit(&self, record: RateLimitRecord) -> Result<(), StoreError>;

    /// Checks that the backing store is reachable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Drops records whose window has elapsed. Returns how many were removed.
    async fn evict_expired(&self, _now: SystemTime) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// In-process store used when no Redis URL is configured.
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    records: RwLock<HashMap<String, RateLimitRecord>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn get_limit(&self, identity: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        Ok(self.records.read().await.get(identity).cloned())
    }

    async fn upsert_limit(&self, record: RateLimitRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.identity.clone(), record);
        Ok(())
    }

    async fn evict_expired(&self, now: SystemTime) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    #[tokio::test]
    async fn test_get_missing_record() {
        let store = MemoryRateLimitStore::new();
        assert!(store.get_limit("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_record() {
        let store = MemoryRateLimitStore::new();
        let mut record = RateLimitRecord::new("10.0.0.1", at(0), Duration::from_secs(60), 5);
        store.upsert_limit(record.clone()).await.unwrap();

        record.decrement();
        store.upsert_limit(record.clone()).await.unwrap();

        assert_eq!(store.get_limit("10.0.0.1").await.unwrap(), Some(record));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let store = MemoryRateLimitStore::new();
        let window = Duration::from_secs(60);
        store
            .upsert_limit(RateLimitRecord::new("old", at(0), window, 5))
            .await
            .unwrap();
        store
            .upsert_limit(RateLimitRecord::new("new", at(100), window, 5))
            .await
            .unwrap();

        let evicted = store.evict_expired(at(120)).await.unwrap();

        assert_eq!(evicted, 1);
        assert!(store.get_limit("old").await.unwrap().is_none());
        assert!(store.get_limit("new").await.unwrap().is_some());
    }
}
