//! Prometheus metrics for queue consumers

use crate::error::ConsumerError;
use crate::reporting::Status;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), ConsumerError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            ConsumerError::Config(format!("failed to install Prometheus recorder: {}", e))
        })?;
        info!("Prometheus metrics initialized");
        Ok::<_, ConsumerError>(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Count a failed call to the log (`"log"`) or error (`"error"`) service.
pub fn report_failed(channel: &'static str) {
    counter!("queue_consumer_report_failures_total", "channel" => channel).increment(1);
}

/// Per-queue metrics helper
#[derive(Clone)]
pub struct ConsumerMetrics {
    queue: String,
}

impl ConsumerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    pub fn message_received(&self) {
        counter!("queue_consumer_messages_received_total", "queue" => self.queue.clone())
            .increment(1);
    }

    /// Record how a message was settled
    pub fn message_settled(&self, status: Status, acked: bool) {
        counter!(
            "queue_consumer_messages_settled_total",
            "queue" => self.queue.clone(),
            "status" => status.as_str(),
            "settle" => if acked { "ack" } else { "requeue" }
        )
        .increment(1);
    }

    pub fn retry_scheduled(&self, delay: Duration) {
        counter!("queue_consumer_retries_scheduled_total", "queue" => self.queue.clone())
            .increment(1);
        histogram!("queue_consumer_retry_delay_seconds", "queue" => self.queue.clone())
            .record(delay.as_secs_f64());
    }

    pub fn handler_finished(&self, handler: &'static str, duration: Duration) {
        histogram!(
            "queue_consumer_handler_duration_seconds",
            "queue" => self.queue.clone(),
            "handler" => handler
        )
        .record(duration.as_secs_f64());
    }

    pub fn broker_error(&self) {
        counter!("queue_consumer_broker_errors_total", "queue" => self.queue.clone()).increment(1);
    }
}
