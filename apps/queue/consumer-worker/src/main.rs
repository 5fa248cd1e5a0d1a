//! Queue Consumer Worker - Entry Point
//!
//! Consumes the configured queues with Redis-backed retry accounting.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    queue_consumer_worker::run().await
}
