//! Retry Consumer
//!
//! At-least-once queue consumption with retry accounting kept outside the
//! broker.
//!
//! ## Features
//!
//! - **Durable retry counts**: per-message counters in Redis survive redeliveries
//! - **Escalating delays**: failed messages are re-submitted with a tiered delay
//! - **Handler registry**: messages name their handler, resolved from a table filled at startup
//! - **Lifecycle reporting**: every transition is posted to the remote log service
//! - **Prometheus metrics** and K8s-ready health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use retry_consumer::{
//!     ApiClient, ApiConfig, ConsumptionEngine, HandlerRegistry, HttpProducerGateway,
//!     HttpReportingSink, QueueWorker, RedisRetryStore, RedisStreamBroker, WorkerConfig,
//! };
//!
//! let client = ApiClient::new(ApiConfig::new("http://queue.internal"))?;
//! let registry = HandlerRegistry::new().register("UserSync", "handle", Arc::new(UserSync::new()));
//!
//! let engine = Arc::new(ConsumptionEngine::new(
//!     Arc::new(RedisRetryStore::new(redis.clone())),
//!     registry,
//!     Arc::new(HttpProducerGateway::new(client.clone())),
//!     Arc::new(HttpReportingSink::new(client)),
//! ));
//!
//! let config = WorkerConfig::new("user_workers");
//! let broker = Arc::new(RedisStreamBroker::new(redis, &config));
//! QueueWorker::new(broker, engine, "users", config).run(shutdown_rx).await?;
//! ```

mod broker;
mod client;
mod config;
mod delay;
mod engine;
mod error;
mod health;
mod message;
pub mod metrics;
mod producer;
mod registry;
mod reporting;
mod retry_store;
#[cfg(test)]
mod test_support;
mod worker;

pub use broker::{Broker, Delivery, MemoryBroker, RedisStreamBroker};
pub use client::{ApiClient, Envelope};
pub use config::{
    ApiConfig, DEFAULT_ATTEMPT_LIMIT, DEFAULT_BUSINESS_ERROR_CODES, EngineConfig, WorkerConfig,
};
pub use delay::{DEFAULT_DELAY_TIERS_MS, DEFAULT_FALLBACK_DELAY_MS, DelayTable};
pub use engine::{ConsumeOptions, ConsumptionEngine, Outcome};
pub use error::{ConsumerError, ConsumerResult, ErrorKind, HandlerError};
pub use health::{HealthState, health_router};
pub use message::{
    ATTEMPT_LIMIT_PROPERTY, Body, DELAY_HEADER, HANDLER_CLASS_PROPERTY, HANDLER_METHOD_PROPERTY,
    MESSAGE_ID_HEADER, Message,
};
pub use metrics::{ConsumerMetrics, init_metrics};
pub use producer::{HttpProducerGateway, ProduceRequest, ProduceResponse, ProducerGateway};
pub use registry::{HandlerBinding, HandlerRegistry, MessageHandler, ResolvedHandler};
pub use reporting::{HttpReportingSink, LifecycleEvent, ReportingSink, Severity, Status};
pub use retry_store::{MemoryRetryStore, RedisRetryStore, RetryStore, retry_key};
pub use worker::{QueueWorker, run_workers};
