use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use tracing::{debug, info};

use crate::key_generator::KeyGenerator;
use crate::rate_limiter::RateLimitRecord;
use crate::store::{RateLimitStore, StoreError};

/// Rate limit records kept in Redis as JSON strings.
///
/// Each key expires after twice its window so abandoned identities clean themselves up.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    connection: MultiplexedConnection,
    keys: KeyGenerator,
}

impl RedisRateLimitStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(event = "redis_connected", "Connected to Redis");

        Ok(Self {
            connection,
            keys: KeyGenerator::default(),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn get_limit(&self, identity: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.store_key(identity))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn upsert_limit(&self, record: RateLimitRecord) -> Result<(), StoreError> {
        let key = self.keys.store_key(&record.identity);
        let ttl = record.window_length.as_secs().saturating_mul(2).max(1);
        let json = serde_json::to_string(&record)?;

        let mut conn = self.connection.clone();
        redis::cmd("SET")
            .arg(&key)
            .arg(json)
            .arg("EX")
            .arg(ttl)
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(key = %key, remaining = record.remaining, "Rate limit record stored");
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let result: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        result?;
        Ok(())
    }
}
