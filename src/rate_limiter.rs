use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{cause_of, Fault, IntoFault};
use crate::response::RateLimitDecision;
use crate::store::{RateLimitStore, StoreError};

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("failed to get rate limit: {0}")]
    Fetch(#[source] StoreError),

    #[error("failed to update rate limit: {0}")]
    Update(#[source] StoreError),

    #[error("failed to acquire lock for identity {0}")]
    Lock(String),
}

impl IntoFault for RateLimitError {
    fn into_fault(self) -> Fault {
        let message = match &self {
            RateLimitError::Fetch(_) => "failed to get rate limit",
            RateLimitError::Update(_) => "failed to update rate limit",
            RateLimitError::Lock(_) => "failed to get determine rate limit for incoming request",
        };
        Fault::internal(message).with_cause(cause_of("rate_limit_error", &self))
    }
}

/// Fixed-window budget tracked for one identity.
///
/// `window_start` is milliseconds since the unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    pub identity: String,
    pub window_start: u64,
    #[serde(with = "humantime_serde")]
    pub window_length: Duration,
    pub limit: u32,
    pub remaining: u32,
}

impl RateLimitRecord {
    pub fn new(identity: &str, now: SystemTime, window_length: Duration, limit: u32) -> Self {
        Self {
            identity: identity.to_string(),
            window_start: unix_millis(now),
            window_length,
            limit,
            remaining: limit,
        }
    }

    pub fn decrement(&mut self) {
        self.remaining = self.remaining.saturating_sub(1);
    }

    pub fn is_limited(&self) -> bool {
        self.remaining == 0
    }

    /// A depleted window may restart once it has fully elapsed.
    pub fn can_reset(&self, now: SystemTime) -> bool {
        self.is_limited() && unix_millis(now) > self.window_end_millis()
    }

    pub fn reset(&mut self, now: SystemTime) {
        self.window_start = unix_millis(now);
        self.remaining = self.limit;
    }

    /// Unix timestamp (seconds) at which the window ends.
    pub fn reset_at(&self) -> u64 {
        self.window_end_millis() / 1000
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        unix_millis(now) > self.window_end_millis()
    }

    /// Evaluates one request at `now`, mutating the record only when it is admitted.
    pub fn admit(&mut self, now: SystemTime) -> RateLimitDecision {
        if self.is_limited() {
            if !self.can_reset(now) {
                let retry_after = self
                    .window_end_millis()
                    .saturating_sub(unix_millis(now))
                    .div_ceil(1000)
                    .max(1);
                return RateLimitDecision::denied(
                    self.limit,
                    self.remaining,
                    self.reset_at(),
                    retry_after,
                );
            }
            self.reset(now);
        }

        self.decrement();
        RateLimitDecision::allowed(self.limit, self.remaining, self.reset_at())
    }

    fn window_end_millis(&self) -> u64 {
        self.window_start
            .saturating_add(self.window_length.as_millis() as u64)
    }
}

pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-key async locks; an entry lives only while someone holds or waits for it.
#[derive(Debug, Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<String, KeySlot>>,
}

#[derive(Debug)]
struct KeySlot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

/// Counted as a user of its slot from creation, so a waiter dropped mid-await
/// still releases the entry.
struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> Result<KeyGuard<'_>, RateLimitError> {
        let lock = {
            let mut locks = self
                .inner
                .lock()
                .map_err(|_| RateLimitError::Lock(key.to_string()))?;
            let slot = locks.entry(key.to_string()).or_insert_with(|| KeySlot {
                lock: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            slot.users += 1;
            slot.lock.clone()
        };

        let mut pending = KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: None,
        };
        pending.guard = Some(lock.lock_owned().await);
        Ok(pending)
    }

    fn len(&self) -> usize {
        self.inner.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        if let Ok(mut locks) = self.locks.inner.lock() {
            if let Some(slot) = locks.get_mut(&self.key) {
                slot.users = slot.users.saturating_sub(1);
                if slot.users == 0 {
                    locks.remove(&self.key);
                }
            }
        }
    }
}

/// Fixed-window limiter over a pluggable record store.
///
/// The fetch, evaluate and persist sequence runs under a per-identity lock so
/// concurrent requests from one caller cannot overrun the budget.
pub struct FixedWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    limit: u32,
    window: Duration,
    locks: KeyedLocks,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, limit: u32, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
            locks: KeyedLocks::default(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Check rate limit for an identity at the current time.
    pub async fn check(&self, identity: &str) -> Result<RateLimitDecision, RateLimitError> {
        self.check_at(identity, SystemTime::now()).await
    }

    /// Check rate limit for an identity at `now`.
    pub async fn check_at(
        &self,
        identity: &str,
        now: SystemTime,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let _guard = self.locks.lock(identity).await?;

        let mut record = match self
            .store
            .get_limit(identity)
            .await
            .map_err(RateLimitError::Fetch)?
        {
            Some(record) => record,
            None => RateLimitRecord::new(identity, now, self.window, self.limit),
        };

        let decision = record.admit(now);
        if decision.allowed {
            self.store
                .upsert_limit(record)
                .await
                .map_err(RateLimitError::Update)?;
        }

        debug!(
            identity = %identity,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Rate limit evaluated"
        );

        Ok(decision)
    }

    /// Number of identities currently being evaluated.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}
