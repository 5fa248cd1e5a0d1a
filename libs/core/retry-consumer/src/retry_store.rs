//! Retry counter storage
//!
//! The retry count of a message lives outside the broker, keyed by message
//! id, so it survives redeliveries and re-submissions. Redis is the
//! production backend; [`MemoryRetryStore`] serves tests and local runs.

use crate::error::ConsumerError;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Prefix of every retry record key.
pub const RETRY_KEY_PREFIX: &str = "retry:";

/// Build the retry record key for a message id.
pub fn retry_key(message_id: &str) -> String {
    format!("{}{}", RETRY_KEY_PREFIX, message_id)
}

/// Durable per-message retry counter.
///
/// Implementations must be safe to share between workers processing
/// different messages concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Current retry count, 0 when no record exists.
    async fn get(&self, message_id: &str) -> Result<u32, ConsumerError>;

    /// Overwrite the retry count.
    async fn set(&self, message_id: &str, count: u32) -> Result<(), ConsumerError>;

    /// Remove the record.
    async fn delete(&self, message_id: &str) -> Result<(), ConsumerError>;
}

/// Redis-backed retry store.
#[derive(Clone)]
pub struct RedisRetryStore {
    redis: ConnectionManager,
    ttl_secs: Option<u64>,
}

impl RedisRetryStore {
    /// Create a store without expiry on records.
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            ttl_secs: None,
        }
    }

    /// Expire records after `ttl_secs` so abandoned counters do not pile up.
    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = (ttl_secs > 0).then_some(ttl_secs);
        self
    }
}

#[async_trait]
impl RetryStore for RedisRetryStore {
    async fn get(&self, message_id: &str) -> Result<u32, ConsumerError> {
        let mut conn = self.redis.clone();
        let count: Option<u32> = conn.get(retry_key(message_id)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn set(&self, message_id: &str, count: u32) -> Result<(), ConsumerError> {
        let mut conn = self.redis.clone();
        let key = retry_key(message_id);

        match self.ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(&key, count, ttl).await?,
            None => conn.set::<_, _, ()>(&key, count).await?,
        }

        debug!(message_id = %message_id, retry_count = count, "Persisted retry count");
        Ok(())
    }

    async fn delete(&self, message_id: &str) -> Result<(), ConsumerError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(retry_key(message_id)).await?;

        debug!(message_id = %message_id, "Deleted retry record");
        Ok(())
    }
}

/// In-process retry store.
#[derive(Debug, Default)]
pub struct MemoryRetryStore {
    counts: RwLock<HashMap<String, u32>>,
}

impl MemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a record exists for the message.
    pub fn contains(&self, message_id: &str) -> bool {
        self.counts
            .read()
            .map(|counts| counts.contains_key(message_id))
            .unwrap_or(false)
    }

    fn poisoned() -> ConsumerError {
        ConsumerError::Config("retry store lock poisoned".to_string())
    }
}

#[async_trait]
impl RetryStore for MemoryRetryStore {
    async fn get(&self, message_id: &str) -> Result<u32, ConsumerError> {
        let counts = self.counts.read().map_err(|_| Self::poisoned())?;
        Ok(counts.get(message_id).copied().unwrap_or(0))
    }

    async fn set(&self, message_id: &str, count: u32) -> Result<(), ConsumerError> {
        let mut counts = self.counts.write().map_err(|_| Self::poisoned())?;
        counts.insert(message_id.to_string(), count);
        Ok(())
    }

    async fn delete(&self, message_id: &str) -> Result<(), ConsumerError> {
        let mut counts = self.counts.write().map_err(|_| Self::poisoned())?;
        counts.remove(message_id);
        Ok(())
    }
}
