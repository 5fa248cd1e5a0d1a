//! Lifecycle reporting
//!
//! Every transition of a message is reported to the remote log service.
//! Reporting is fire-and-forget: failures degrade to the error channel and
//! then to the local log, and never change how a message is settled.

use crate::client::ApiClient;
use crate::metrics;
use crate::registry::HandlerBinding;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use tracing::{debug, warn};

/// Path of the lifecycle log endpoint.
pub const LOG_PATH: &str = "/queue/log";

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The message carried no id; it cannot be logged against anything.
    IdError,
    Dequeued,
    Success,
    RetryFailed,
    TerminalFailure,
}

impl Status {
    /// Numeric status of the log API. `IdError` has none.
    pub fn code(&self) -> Option<u8> {
        match self {
            Status::IdError => None,
            Status::Dequeued => Some(3),
            Status::Success => Some(4),
            Status::RetryFailed => Some(5),
            Status::TerminalFailure => Some(6),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::IdError => "id-error",
            Status::Dequeued => "dequeued",
            Status::Success => "success",
            Status::RetryFailed => "retry-failed",
            Status::TerminalFailure => "terminal-failure",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            Status::Dequeued | Status::Success => Severity::Info,
            Status::RetryFailed => Severity::Warning,
            Status::IdError | Status::TerminalFailure => Severity::Error,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One reported lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub queue_name: String,
    pub message_id: Option<String>,
    pub body: Value,
    pub status: Status,
    pub retry_count: u32,
    /// Delay in ms: the produced delay, or the newly scheduled one on retry
    pub delay_ms: u64,
    pub attempt_limit: u32,
    pub binding: Option<HandlerBinding>,
    pub severity: Severity,
    /// Error text, if the transition was caused by one
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(
        queue_name: impl Into<String>,
        message_id: Option<String>,
        body: Value,
        status: Status,
        retry_count: u32,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            message_id,
            body,
            status,
            retry_count,
            delay_ms: 0,
            attempt_limit: 0,
            binding: None,
            severity: status.default_severity(),
            detail: None,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_attempt_limit(mut self, limit: u32) -> Self {
        self.attempt_limit = limit;
        self
    }

    pub fn with_binding(mut self, binding: Option<HandlerBinding>) -> Self {
        self.binding = binding;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn handler_class(&self) -> &str {
        self.binding.as_ref().map_or("", |b| b.handler_ref.as_str())
    }

    fn handler_method(&self) -> &str {
        self.binding.as_ref().map_or("", |b| b.method_ref.as_str())
    }

    /// The event as error-report parameters.
    pub fn to_params(&self) -> Value {
        json!({
            "queue_name": self.queue_name,
            "message": self.body,
            "delay": self.delay_ms,
            "max_retry_times": self.attempt_limit,
            "handler_class": self.handler_class(),
            "handler_method": self.handler_method(),
            "status": self.status.as_str(),
            "message_id": self.message_id,
            "retry_times": self.retry_count,
        })
    }
}

#[derive(Debug, Serialize)]
struct LogRecord<'a> {
    queue_name: &'a str,
    message: &'a Value,
    delay: u64,
    max_retry_times: u32,
    handler_class: &'a str,
    handler_method: &'a str,
    status: u8,
    message_id: &'a str,
    retry_times: u32,
}

/// Receives lifecycle events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportingSink: Send + Sync {
    /// Record a transition. Must not fail.
    async fn report(&self, event: &LifecycleEvent);
}

/// Sink posting to the remote log and error services.
#[derive(Clone)]
pub struct HttpReportingSink {
    client: ApiClient,
}

impl HttpReportingSink {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    fn detail_or_status(event: &LifecycleEvent) -> String {
        event
            .detail
            .clone()
            .unwrap_or_else(|| event.status.as_str().to_string())
    }
}

#[async_trait]
impl ReportingSink for HttpReportingSink {
    async fn report(&self, event: &LifecycleEvent) {
        let (Some(status), Some(message_id)) = (event.status.code(), event.message_id.as_deref())
        else {
            self.client
                .report_error(event.to_params(), &Self::detail_or_status(event), "id_error")
                .await;
            return;
        };

        let url = ApiClient::url(&self.client.config().log_api, LOG_PATH);
        let record = self.client.envelope(LogRecord {
            queue_name: &event.queue_name,
            message: &event.body,
            delay: event.delay_ms,
            max_retry_times: event.attempt_limit,
            handler_class: event.handler_class(),
            handler_method: event.handler_method(),
            status,
            message_id,
            retry_times: event.retry_count,
        });

        match self.client.post_json(&url, &record).await {
            Ok(_) => debug!(message_id = %message_id, status = %event.status, "Reported lifecycle event"),
            Err(e) => {
                metrics::report_failed("log");
                warn!(message_id = %message_id, status = %event.status, error = %e, "Lifecycle log failed");
                self.client
                    .report_error(event.to_params(), &e.to_string(), "consume_log")
                    .await;
            }
        }

        if event.severity == Severity::Error {
            self.client
                .report_error(event.to_params(), &Self::detail_or_status(event), "escalation")
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ERROR_PATH;
    use crate::config::ApiConfig;
    use crate::test_support::{FakeQueueApi, unreachable_url};

    fn sink(config: ApiConfig) -> HttpReportingSink {
        HttpReportingSink::new(ApiClient::new(config.with_callerid("billing")).unwrap())
    }

    fn event(status: Status) -> LifecycleEvent {
        LifecycleEvent::new("orders", Some("m-1".to_string()), json!({ "oa_uid": 7747 }), status, 2)
            .with_attempt_limit(5)
            .with_delay_ms(600_000)
            .with_binding(Some(HandlerBinding::new("UserSync", "handle")))
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::IdError.code(), None);
        assert_eq!(Status::Dequeued.code(), Some(3));
        assert_eq!(Status::Success.code(), Some(4));
        assert_eq!(Status::RetryFailed.code(), Some(5));
        assert_eq!(Status::TerminalFailure.code(), Some(6));
        assert_eq!(Status::RetryFailed.to_string(), "retry-failed");
    }

    #[tokio::test]
    async fn test_log_record_shape() {
        let api = FakeQueueApi::start().await;
        sink(ApiConfig::new(api.base_url())).report(&event(Status::Success)).await;

        let logs = api.calls_to(LOG_PATH);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["queue_name"], "orders");
        assert_eq!(logs[0]["message"]["oa_uid"], 7747);
        assert_eq!(logs[0]["status"], 4);
        assert_eq!(logs[0]["message_id"], "m-1");
        assert_eq!(logs[0]["retry_times"], 2);
        assert_eq!(logs[0]["delay"], 600_000);
        assert_eq!(logs[0]["max_retry_times"], 5);
        assert_eq!(logs[0]["handler_class"], "UserSync");
        assert_eq!(logs[0]["handler_method"], "handle");
        assert_eq!(logs[0]["callerid"], "billing");
        assert!(api.calls_to(ERROR_PATH).is_empty());
    }

    #[tokio::test]
    async fn test_id_error_goes_to_error_channel() {
        let api = FakeQueueApi::start().await;
        let event = LifecycleEvent::new("orders", None, json!("raw"), Status::IdError, 0)
            .with_detail("Message has no identifier");

        sink(ApiConfig::new(api.base_url())).report(&event).await;

        assert!(api.calls_to(LOG_PATH).is_empty());
        let errors = api.calls_to(ERROR_PATH);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error_msg"], "Message has no identifier");
        assert_eq!(errors[0]["params"]["status"], "id-error");
    }

    #[tokio::test]
    async fn test_error_severity_is_mirrored() {
        let api = FakeQueueApi::start().await;
        let event = event(Status::TerminalFailure).with_detail("attempt limit reached");

        sink(ApiConfig::new(api.base_url())).report(&event).await;

        assert_eq!(api.calls_to(LOG_PATH).len(), 1);
        let errors = api.calls_to(ERROR_PATH);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error_msg"], "attempt limit reached");
    }

    #[tokio::test]
    async fn test_log_failure_falls_back_to_error_channel() {
        let api = FakeQueueApi::start().await;
        api.fail(LOG_PATH);

        sink(ApiConfig::new(api.base_url())).report(&event(Status::Dequeued)).await;

        let errors = api.calls_to(ERROR_PATH);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["params"]["message_id"], "m-1");
    }

    #[tokio::test]
    async fn test_everything_down_does_not_fail() {
        let config = ApiConfig::new(unreachable_url().await).with_timeout_secs(1);
        sink(config)
            .report(&event(Status::TerminalFailure).with_detail("boom"))
            .await;
    }
}
