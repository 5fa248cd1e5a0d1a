//! Queue Consumer Worker
//!
//! Consumes one or more queues and runs each message through the retrying
//! consumption engine.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream per queue
//!   ↓ (Consumer Group: CONSUMER_GROUP)
//! QueueWorker (one per queue)
//!   ↓
//! ConsumptionEngine ── retry counts ──> Redis (retry:<id>)
//!   ├─> MessageHandler (Log::handle, UserSync::handle)
//!   ├─> queue service  /queue/reProduce   (delayed re-submission)
//!   └─> log service    /queue/log, /queue/error
//! ```

pub mod connection;
pub mod handlers;

use axum::Router;
use core_config::{Environment, FromEnv, env_list, env_parse_or, redis::RedisConfig};
use eyre::{Result, WrapErr, eyre};
use handlers::{LogHandler, UserSyncHandler};
use retry_consumer::{
    ApiClient, ApiConfig, ConsumeOptions, ConsumptionEngine, DelayTable, EngineConfig,
    HandlerBinding, HandlerRegistry, HealthState, HttpProducerGateway, HttpReportingSink,
    QueueWorker, RedisRetryStore, RedisStreamBroker, WorkerConfig, health_router, init_metrics,
    run_workers,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_HEALTH_PORT: u16 = 8082;

/// Everything the worker reads from the environment besides library configs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queues: Vec<String>,
    pub delays: DelayTable,
    pub options: ConsumeOptions,
    pub user_sync_url: Option<String>,
    pub health_port: u16,
}

impl WorkerSettings {
    /// Reads `CONSUMER_QUEUES`, `CONSUMER_DELAY_TIERS_MS`, `CONSUMER_HANDLER`,
    /// `CONSUMER_ATTEMPT_LIMIT`, `USER_SYNC_URL` and `HEALTH_PORT`.
    pub fn from_env() -> Result<Self> {
        let queues = env_list("CONSUMER_QUEUES");
        if queues.is_empty() {
            return Err(eyre!("CONSUMER_QUEUES must name at least one queue"));
        }

        let delays = match std::env::var("CONSUMER_DELAY_TIERS_MS") {
            Ok(tiers) if !tiers.trim().is_empty() => {
                DelayTable::parse(&tiers, None).wrap_err("Invalid CONSUMER_DELAY_TIERS_MS")?
            }
            _ => DelayTable::default(),
        };

        let mut options = ConsumeOptions::default();
        if let Ok(raw) = std::env::var("CONSUMER_HANDLER")
            && !raw.trim().is_empty()
        {
            let binding = HandlerBinding::parse(raw.trim())
                .ok_or_else(|| eyre!("CONSUMER_HANDLER must look like Class::method, got '{}'", raw))?;
            options = options.with_binding(binding);
        }
        let attempt_limit: u32 = env_parse_or("CONSUMER_ATTEMPT_LIMIT", 0)?;
        if attempt_limit > 0 {
            options = options.with_attempt_limit(attempt_limit);
        }

        Ok(Self {
            queues,
            delays,
            options,
            user_sync_url: std::env::var("USER_SYNC_URL").ok().filter(|u| !u.is_empty()),
            health_port: env_parse_or("HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
        })
    }
}

/// Handlers this worker can dispatch to.
pub fn build_registry(settings: &WorkerSettings, api: &ApiConfig) -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new().register("Log", "handle", Arc::new(LogHandler));

    if let Some(url) = &settings.user_sync_url {
        let handler = UserSyncHandler::new(url.clone(), api.timeout())
            .wrap_err("Failed to build user sync client")?;
        registry = registry.register("UserSync", "handle", Arc::new(handler));
    }

    if let Some(binding) = &settings.options.binding
        && !registry.bindings().any(|b| b == binding)
    {
        return Err(eyre!("CONSUMER_HANDLER {} is not a registered handler", binding));
    }

    Ok(registry)
}

/// Start the health HTTP server
///
/// Serves `/health`, `/healthz`, `/ready`, `/readyz` and `/metrics`.
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the consumer worker until SIGINT/SIGTERM or a fatal broker failure.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics().wrap_err("Failed to initialize metrics")?;

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, ?environment, "Starting queue consumer worker");

    let settings = WorkerSettings::from_env()?;
    let api_config = ApiConfig::from_env().wrap_err("Failed to load queue API configuration")?;
    let engine_config = EngineConfig::from_env().wrap_err("Failed to load engine configuration")?;
    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!(
        queues = ?settings.queues,
        consumer_group = %worker_config.consumer_group,
        consumer_id = %worker_config.consumer_id,
        batch_size = worker_config.batch_size,
        block_timeout_ms = ?worker_config.block_timeout_ms,
        delay_tiers_ms = ?settings.delays.tiers(),
        "Worker configuration loaded"
    );

    info!("Connecting to Redis...");
    let redis = connection::connect_with_retry(&redis_config)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let registry = build_registry(&settings, &api_config)?;
    info!(handlers = registry.len(), "Handler registry ready");

    let client = ApiClient::new(api_config).wrap_err("Failed to build queue API client")?;
    let store = RedisRetryStore::new(redis.clone()).with_ttl_secs(worker_config.retry_ttl_secs);
    let engine = Arc::new(
        ConsumptionEngine::new(
            Arc::new(store),
            registry,
            Arc::new(HttpProducerGateway::new(client.clone())),
            Arc::new(HttpReportingSink::new(client)),
        )
        .with_delays(settings.delays.clone())
        .with_config(engine_config),
    );

    let broker = Arc::new(RedisStreamBroker::new(redis.clone(), &worker_config));
    let workers = settings
        .queues
        .iter()
        .map(|queue| {
            QueueWorker::new(broker.clone(), engine.clone(), queue.clone(), worker_config.clone())
                .with_options(settings.options.clone())
        })
        .collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(redis, name, version, settings.queues.clone());
    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    run_workers(workers, shutdown_rx)
        .await
        .wrap_err("Queue consumption stopped")?;

    info!("Queue consumer worker stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating shutdown..."),
    }
}
