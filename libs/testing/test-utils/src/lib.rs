//! Shared test utilities for queue consumer crates
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `unique_queue` / `unique_message_id`: collision-free names so tests can
//!   share one container
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! ```rust,ignore
//! use test_utils::{TestRedis, unique_queue};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let queue = unique_queue("orders");
//!     redis.seed_entry(&queue, r#"{"x-msg-id":"m-1"}"#, "{}", r#"{"oa_uid":1}"#).await;
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Queue name with a random suffix, e.g. `orders-3f2a...`.
pub fn unique_queue(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

/// Message id with a random suffix.
pub fn unique_message_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_differ() {
        let a = unique_queue("orders");
        let b = unique_queue("orders");

        assert!(a.starts_with("orders-"));
        assert_ne!(a, b);
        assert_ne!(unique_message_id("m"), unique_message_id("m"));
    }
}
