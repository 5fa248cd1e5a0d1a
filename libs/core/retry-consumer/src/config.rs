//! Consumer configuration
//!
//! - `ApiConfig`: where the remote produce/log services live
//! - `EngineConfig`: retry policy knobs of the consumption engine
//! - `WorkerConfig`: consumer identity and polling behaviour of a queue worker
//!
//! With the `config` feature each of them can be loaded from the environment
//! through `core_config::FromEnv`.

use std::ops::RangeInclusive;
use std::time::Duration;
use uuid::Uuid;

/// Default attempt limit when neither the caller nor the message sets one.
pub const DEFAULT_ATTEMPT_LIMIT: u32 = 5;

/// Error codes in this band are expected business rejections.
pub const DEFAULT_BUSINESS_ERROR_CODES: RangeInclusive<i64> = 10_000..=19_999;

/// Remote queue/log service endpoints.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL of the produce service
    pub queue_api: String,

    /// Base URL of the lifecycle log service
    pub log_api: String,

    /// Base URL of the error report service
    pub log_error_api: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Caller identifier sent with every request
    pub callerid: String,
}

impl ApiConfig {
    /// Point all three services at the same base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base = base_url.into();
        Self {
            queue_api: base.clone(),
            log_api: base.clone(),
            log_error_api: base,
            timeout_secs: 5,
            callerid: "default".to_string(),
        }
    }

    pub fn with_log_api(mut self, url: impl Into<String>) -> Self {
        self.log_api = url.into();
        self
    }

    pub fn with_log_error_api(mut self, url: impl Into<String>) -> Self {
        self.log_error_api = url.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs.max(1);
        self
    }

    pub fn with_callerid(mut self, callerid: impl Into<String>) -> Self {
        self.callerid = callerid.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::new("http://localhost")
    }
}

/// Retry policy of the consumption engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Attempt limit used when the message and the caller set none
    pub default_attempt_limit: u32,

    /// Fatal handler error codes treated as expected business rejections
    pub business_error_codes: RangeInclusive<i64>,
}

impl EngineConfig {
    pub fn with_default_attempt_limit(mut self, limit: u32) -> Self {
        self.default_attempt_limit = limit;
        self
    }

    pub fn with_business_error_codes(mut self, codes: RangeInclusive<i64>) -> Self {
        self.business_error_codes = codes;
        self
    }

    /// Whether a fatal error code is an expected business rejection.
    pub fn is_business_rejection(&self, code: Option<i64>) -> bool {
        code.is_some_and(|c| self.business_error_codes.contains(&c))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_attempt_limit: DEFAULT_ATTEMPT_LIMIT,
            business_error_codes: DEFAULT_BUSINESS_ERROR_CODES,
        }
    }
}

/// Configuration for a queue worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer group name
    pub consumer_group: String,

    /// Unique consumer ID (auto-generated if not provided)
    pub consumer_id: String,

    /// Maximum deliveries fetched per poll
    pub batch_size: usize,

    /// Blocking read timeout in milliseconds (None = non-blocking)
    pub block_timeout_ms: Option<u64>,

    /// Pause after an empty poll in milliseconds
    pub poll_interval_ms: u64,

    /// Consecutive broker failures after which the worker gives up
    pub max_consecutive_errors: u32,

    /// TTL of retry records in seconds (0 = never expire)
    pub retry_ttl_secs: u64,

    /// Idle time after which another consumer's unsettled entries are claimed
    pub claim_idle_ms: u64,
}

impl WorkerConfig {
    /// Create a new WorkerConfig for a consumer group
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            consumer_id: format!("consumer-{}", Uuid::new_v4()),
            batch_size: 10,
            block_timeout_ms: Some(5000),
            poll_interval_ms: 100,
            max_consecutive_errors: 5,
            retry_ttl_secs: 7 * 24 * 3600,
            claim_idle_ms: 60_000,
        }
    }

    /// Set the consumer ID
    pub fn with_consumer_id(mut self, id: impl Into<String>) -> Self {
        self.consumer_id = id.into();
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the blocking timeout (None for non-blocking)
    pub fn with_blocking(mut self, timeout_ms: Option<u64>) -> Self {
        self.block_timeout_ms = timeout_ms;
        self
    }

    /// Set the pause after an empty poll
    pub fn with_poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Set how many broker failures in a row end the worker
    pub fn with_max_consecutive_errors(mut self, count: u32) -> Self {
        self.max_consecutive_errors = count.max(1);
        self
    }

    /// Set the retry record TTL
    pub fn with_retry_ttl_secs(mut self, ttl: u64) -> Self {
        self.retry_ttl_secs = ttl;
        self
    }

    /// Set the idle time before abandoned entries are claimed
    pub fn with_claim_idle_ms(mut self, idle: u64) -> Self {
        self.claim_idle_ms = idle.max(1);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new("queue_consumers")
    }
}

#[cfg(feature = "config")]
mod env {
    use super::*;
    use core_config::{ConfigError, FromEnv, env_or_default, env_parse_or};

    /// Environment variables:
    /// - `QUEUE_API_URL` (default `http://localhost`)
    /// - `QUEUE_LOG_API_URL` (default: `QUEUE_API_URL`)
    /// - `QUEUE_LOG_ERROR_API_URL` (default: `QUEUE_LOG_API_URL`)
    /// - `QUEUE_API_TIMEOUT_SECS` (default 5)
    /// - `QUEUE_CALLERID` (default `default`)
    impl FromEnv for ApiConfig {
        fn from_env() -> Result<Self, ConfigError> {
            let queue_api = env_or_default("QUEUE_API_URL", "http://localhost");
            let log_api = env_or_default("QUEUE_LOG_API_URL", &queue_api);
            let log_error_api = env_or_default("QUEUE_LOG_ERROR_API_URL", &log_api);

            Ok(Self {
                queue_api,
                log_api,
                log_error_api,
                timeout_secs: env_parse_or("QUEUE_API_TIMEOUT_SECS", 5)?,
                callerid: env_or_default("QUEUE_CALLERID", "default"),
            })
        }
    }

    /// Environment variables:
    /// - `CONSUMER_DEFAULT_ATTEMPT_LIMIT` (default 5)
    impl FromEnv for EngineConfig {
        fn from_env() -> Result<Self, ConfigError> {
            Ok(Self::default().with_default_attempt_limit(env_parse_or(
                "CONSUMER_DEFAULT_ATTEMPT_LIMIT",
                DEFAULT_ATTEMPT_LIMIT,
            )?))
        }
    }

    /// Environment variables:
    /// - `CONSUMER_GROUP` (default `queue_consumers`)
    /// - `CONSUMER_ID` (default: generated)
    /// - `CONSUMER_BATCH_SIZE` (default 10)
    /// - `CONSUMER_BLOCK_MS` (default 5000, 0 = non-blocking)
    /// - `CONSUMER_RETRY_TTL_SECS` (default 7 days, 0 = never expire)
    /// - `CONSUMER_CLAIM_IDLE_MS` (default 60000)
    impl FromEnv for WorkerConfig {
        fn from_env() -> Result<Self, ConfigError> {
            let mut config = WorkerConfig::new(env_or_default("CONSUMER_GROUP", "queue_consumers"));
            if let Ok(id) = std::env::var("CONSUMER_ID") {
                config = config.with_consumer_id(id);
            }

            let block_ms: u64 = env_parse_or("CONSUMER_BLOCK_MS", 5000)?;

            Ok(config
                .with_batch_size(env_parse_or("CONSUMER_BATCH_SIZE", 10)?)
                .with_blocking((block_ms > 0).then_some(block_ms))
                .with_retry_ttl_secs(env_parse_or("CONSUMER_RETRY_TTL_SECS", 7 * 24 * 3600)?)
                .with_claim_idle_ms(env_parse_or("CONSUMER_CLAIM_IDLE_MS", 60_000)?))
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("orders_workers")
            .with_consumer_id("worker-1")
            .with_batch_size(20)
            .with_blocking(Some(10_000))
            .with_max_consecutive_errors(0)
            .with_claim_idle_ms(0);

        assert_eq!(config.consumer_group, "orders_workers");
        assert_eq!(config.consumer_id, "worker-1");
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.block_timeout_ms, Some(10_000));
        assert_eq!(config.max_consecutive_errors, 1);
        assert_eq!(config.claim_idle_ms, 1);
    }

    #[test]
    fn test_generated_consumer_id() {
        let config = WorkerConfig::default();
        assert!(config.consumer_id.starts_with("consumer-"));
    }

    #[test]
    fn test_business_rejection_band() {
        let config = EngineConfig::default();
        assert!(config.is_business_rejection(Some(10_000)));
        assert!(config.is_business_rejection(Some(19_999)));
        assert!(!config.is_business_rejection(Some(500)));
        assert!(!config.is_business_rejection(None));
    }

    #[test]
    fn test_api_config_builder() {
        let config = ApiConfig::new("http://queue")
            .with_log_api("http://log")
            .with_timeout_secs(0);

        assert_eq!(config.queue_api, "http://queue");
        assert_eq!(config.log_api, "http://log");
        assert_eq!(config.log_error_api, "http://queue");
        assert_eq!(config.timeout(), Duration::from_secs(1));
    }
}
