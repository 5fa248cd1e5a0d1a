//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that starts a Redis container and exposes
//! the raw commands tests need to seed streams and inspect retry records.

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Key prefix the retry store writes counters under.
const RETRY_KEY_PREFIX: &str = "retry:";

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    client: Client,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Start a Redis 8 Alpine container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client =
            Client::open(connection_string.clone()).expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            client,
            connection,
            connection_string,
        }
    }

    /// Cloned multiplexed connection for raw commands.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Connection manager, the handle the consumer crates take.
    pub async fn connection_manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.client.clone())
            .await
            .expect("Failed to create connection manager")
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Append a stream entry in the layout the stream broker reads:
    /// JSON `headers`, JSON `properties` and a raw `body`.
    pub async fn seed_entry(
        &self,
        queue: &str,
        headers_json: &str,
        properties_json: &str,
        body: &str,
    ) -> String {
        let mut conn = self.connection();
        conn.xadd(
            queue,
            "*",
            &[
                ("headers", headers_json),
                ("properties", properties_json),
                ("body", body),
            ],
        )
        .await
        .expect("Failed to seed stream entry")
    }

    /// Number of entries in a stream (0 when it does not exist).
    pub async fn stream_len(&self, queue: &str) -> usize {
        let mut conn = self.connection();
        conn.xlen(queue).await.expect("Failed to read stream length")
    }

    /// Write a retry counter directly.
    pub async fn set_retry(&self, message_id: &str, count: u32) {
        let mut conn = self.connection();
        conn.set::<_, _, ()>(format!("{}{}", RETRY_KEY_PREFIX, message_id), count)
            .await
            .expect("Failed to write retry counter");
    }

    /// Read a retry counter directly, `None` when absent.
    pub async fn retry(&self, message_id: &str) -> Option<u32> {
        let mut conn = self.connection();
        conn.get(format!("{}{}", RETRY_KEY_PREFIX, message_id))
            .await
            .expect("Failed to read retry counter")
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}
