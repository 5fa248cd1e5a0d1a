//! Redis connection bootstrap.

use core_config::redis::RedisConfig;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};
use std::time::Duration;
use tracing::{info, warn};

const CONNECT_ATTEMPTS: u32 = 3;
const INITIAL_DELAY_MS: u64 = 100;

/// Open a connection manager and verify it with PING.
pub async fn connect(url: &str) -> RedisResult<ConnectionManager> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    Ok(manager)
}

/// Connect with exponential backoff, giving up after a few attempts.
pub async fn connect_with_retry(config: &RedisConfig) -> RedisResult<ConnectionManager> {
    let mut delay = Duration::from_millis(INITIAL_DELAY_MS);
    let mut attempt = 1;

    loop {
        match connect(&config.uri).await {
            Ok(manager) => {
                info!(attempt, "Connected to Redis");
                return Ok(manager);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Redis connection failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
