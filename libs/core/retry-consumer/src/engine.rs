//! Consumption engine
//!
//! Drives one delivery through
//! `RECEIVED → ID_EXTRACTED → BODY_PARSED → RETRY_CHECKED → {TERMINAL_FAILED | DISPATCHED}`
//! and settles it exactly once: acked, or rejected back onto the queue.
//!
//! | Situation                  | Settle  | Status             | Retry record         |
//! |----------------------------|---------|--------------------|----------------------|
//! | no message id              | ack     | `id-error`         | untouched            |
//! | body not a JSON object     | ack     | `terminal-failure` | untouched            |
//! | retry store unreachable    | requeue | `retry-failed`     | 1, best effort       |
//! | attempt limit reached      | ack     | `terminal-failure` | deleted              |
//! | handler succeeded          | ack     | `success`          | deleted if present   |
//! | no handler for the binding | requeue | `retry-failed`     | +1                   |
//! | handler failed recoverably | ack     | `retry-failed`     | +1, re-submitted     |
//! | handler failed fatally     | ack     | `terminal-failure` | deleted              |
//!
//! Broker failures are the only errors returned to the caller.

use crate::broker::{Broker, Delivery};
use crate::config::EngineConfig;
use crate::delay::DelayTable;
use crate::error::{ConsumerError, ErrorKind, HandlerError};
use crate::message::{Body, Message};
use crate::metrics::ConsumerMetrics;
use crate::producer::{ProduceRequest, ProducerGateway};
use crate::registry::{HandlerBinding, HandlerRegistry};
use crate::reporting::{LifecycleEvent, ReportingSink, Severity, Status};
use crate::retry_store::RetryStore;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Per-subscription options.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    /// Handler used for every message, ignoring message properties
    pub binding: Option<HandlerBinding>,
    /// Attempt limit used for every message, ignoring message properties
    pub attempt_limit: Option<u32>,
}

impl ConsumeOptions {
    pub fn with_binding(mut self, binding: HandlerBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_attempt_limit(mut self, limit: u32) -> Self {
        self.attempt_limit = Some(limit);
        self
    }
}

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    IdMissing,
    Malformed,
    Exhausted { retry_count: u32 },
    Succeeded { retry_count: u32 },
    Unresolved { retry_count: u32 },
    Rescheduled { retry_count: u32, delay_ms: u64 },
    Abandoned { retry_count: u32, code: Option<i64> },
    StoreUnavailable { retry_count: u32 },
    /// An unexpected failure (retry store write, re-submission) interrupted
    /// processing; the delivery went back onto the queue.
    Faulted { retry_count: u32 },
}

impl Outcome {
    /// The last lifecycle status reported for the message.
    pub fn status(&self) -> Status {
        match self {
            Outcome::IdMissing => Status::IdError,
            Outcome::Succeeded { .. } => Status::Success,
            Outcome::Malformed | Outcome::Exhausted { .. } | Outcome::Abandoned { .. } => {
                Status::TerminalFailure
            }
            Outcome::Unresolved { .. }
            | Outcome::Rescheduled { .. }
            | Outcome::StoreUnavailable { .. }
            | Outcome::Faulted { .. } => Status::RetryFailed,
        }
    }

    /// Retry count after processing.
    pub fn retry_count(&self) -> u32 {
        match self {
            Outcome::IdMissing => 0,
            Outcome::Malformed => 1,
            Outcome::Exhausted { retry_count }
            | Outcome::Succeeded { retry_count }
            | Outcome::Unresolved { retry_count }
            | Outcome::Rescheduled { retry_count, .. }
            | Outcome::Abandoned { retry_count, .. }
            | Outcome::StoreUnavailable { retry_count }
            | Outcome::Faulted { retry_count } => *retry_count,
        }
    }

    /// Whether the delivery was acknowledged (as opposed to requeued).
    pub fn acked(&self) -> bool {
        !matches!(
            self,
            Outcome::Unresolved { .. } | Outcome::StoreUnavailable { .. } | Outcome::Faulted { .. }
        )
    }
}

/// The per-message state machine.
pub struct ConsumptionEngine {
    store: Arc<dyn RetryStore>,
    registry: HandlerRegistry,
    delays: DelayTable,
    producer: Arc<dyn ProducerGateway>,
    reporter: Arc<dyn ReportingSink>,
    config: EngineConfig,
}

impl ConsumptionEngine {
    pub fn new(
        store: Arc<dyn RetryStore>,
        registry: HandlerRegistry,
        producer: Arc<dyn ProducerGateway>,
        reporter: Arc<dyn ReportingSink>,
    ) -> Self {
        Self {
            store,
            registry,
            delays: DelayTable::default(),
            producer,
            reporter,
            config: EngineConfig::default(),
        }
    }

    pub fn with_delays(mut self, delays: DelayTable) -> Self {
        self.delays = delays;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn delays(&self) -> &DelayTable {
        &self.delays
    }

    /// Process one delivery and settle it on the broker.
    ///
    /// Returns `Err` only when the broker itself failed to ack or reject;
    /// every other failure is settled and reported here.
    #[instrument(skip_all, fields(queue = %delivery.queue, tag = %delivery.tag))]
    pub async fn process(
        &self,
        broker: &dyn Broker,
        delivery: &Delivery,
        options: &ConsumeOptions,
    ) -> Result<Outcome, ConsumerError> {
        let metrics = ConsumerMetrics::new(&delivery.queue);
        metrics.message_received();

        let outcome = self.consume(broker, delivery, options, &metrics).await?;
        metrics.message_settled(outcome.status(), outcome.acked());
        Ok(outcome)
    }

    async fn consume(
        &self,
        broker: &dyn Broker,
        delivery: &Delivery,
        options: &ConsumeOptions,
        metrics: &ConsumerMetrics,
    ) -> Result<Outcome, ConsumerError> {
        let message = match Message::from_delivery(
            delivery,
            options.attempt_limit,
            self.config.default_attempt_limit,
        ) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Discarding message without id");
                broker.ack(delivery).await?;
                let body = serde_json::from_str(&delivery.body)
                    .unwrap_or_else(|_| Value::String(delivery.body.clone()));
                self.reporter
                    .report(
                        &LifecycleEvent::new(&delivery.queue, None, body, Status::IdError, 0)
                            .with_detail(e.to_string()),
                    )
                    .await;
                return Ok(Outcome::IdMissing);
            }
        };

        let binding = HandlerRegistry::binding_for(&message, options.binding.as_ref());

        let body = match message.parse_body() {
            Ok(body) => body,
            Err(e) => {
                error!(message_id = %message.id(), error = %e, "Discarding malformed message");
                broker.ack(delivery).await?;
                self.report(
                    event(&message, binding, Status::TerminalFailure, 1).with_detail(e.to_string()),
                )
                .await;
                return Ok(Outcome::Malformed);
            }
        };

        match self
            .settle(broker, delivery, &message, &body, binding.clone(), options, metrics)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_broker_error() => Err(e),
            Err(e) => self.recover(broker, delivery, &message, binding, e).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        broker: &dyn Broker,
        delivery: &Delivery,
        message: &Message,
        body: &Body,
        binding: Option<HandlerBinding>,
        options: &ConsumeOptions,
        metrics: &ConsumerMetrics,
    ) -> Result<Outcome, ConsumerError> {
        let retry_count = match self.store.get(message.id()).await {
            Ok(count) => count,
            Err(e) => {
                let assumed = 1;
                warn!(message_id = %message.id(), error = %e, "Retry store unreachable, requeueing");
                if let Err(e) = self.store.set(message.id(), assumed).await {
                    debug!(message_id = %message.id(), error = %e, "Could not persist assumed retry count");
                }
                broker.reject(delivery, true).await?;
                self.report(
                    event(message, binding, Status::RetryFailed, assumed)
                        .with_severity(Severity::Warning)
                        .with_detail(e.to_string()),
                )
                .await;
                return Ok(Outcome::StoreUnavailable {
                    retry_count: assumed,
                });
            }
        };

        if retry_count >= message.attempt_limit() {
            error!(
                message_id = %message.id(),
                retry_count,
                attempt_limit = message.attempt_limit(),
                "Attempt limit reached, dropping message"
            );
            broker.ack(delivery).await?;
            self.forget(message).await;
            self.report(
                event(message, binding, Status::TerminalFailure, retry_count).with_detail(format!(
                    "attempt limit {} reached",
                    message.attempt_limit()
                )),
            )
            .await;
            return Ok(Outcome::Exhausted { retry_count });
        }

        self.report(event(message, binding.clone(), Status::Dequeued, retry_count))
            .await;

        let Some(resolved) = self.registry.resolve(message, options.binding.as_ref()) else {
            let next = retry_count.saturating_add(1);
            let detail = match &binding {
                Some(binding) => format!("no handler registered for {}", binding),
                None => "message names no handler".to_string(),
            };
            warn!(message_id = %message.id(), retry_count = next, reason = %detail, "Handler unresolved, requeueing");
            self.store.set(message.id(), next).await?;
            broker.reject(delivery, true).await?;
            self.report(
                event(message, binding, Status::RetryFailed, next)
                    .with_severity(Severity::Warning)
                    .with_detail(detail),
            )
            .await;
            return Ok(Outcome::Unresolved { retry_count: next });
        };

        let handler_name = resolved.handler.name();
        let started = Instant::now();
        let result = AssertUnwindSafe(resolved.handler.handle(body))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::recoverable(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        metrics.handler_finished(handler_name, started.elapsed());

        let binding = Some(resolved.binding);
        match result {
            Ok(()) => {
                broker.ack(delivery).await?;
                if retry_count > 0 {
                    self.forget(message).await;
                }
                info!(message_id = %message.id(), handler = handler_name, retry_count, "Message handled");
                self.report(event(message, binding, Status::Success, retry_count))
                    .await;
                Ok(Outcome::Succeeded { retry_count })
            }
            Err(e) if e.kind() == ErrorKind::FatalHandler => {
                let severity = if self.config.is_business_rejection(e.code()) {
                    warn!(message_id = %message.id(), handler = handler_name, error = %e, "Message rejected by handler");
                    Severity::Warning
                } else {
                    error!(message_id = %message.id(), handler = handler_name, error = %e, "Handler failed fatally");
                    Severity::Error
                };
                broker.ack(delivery).await?;
                self.forget(message).await;
                self.report(
                    event(message, binding, Status::TerminalFailure, retry_count)
                        .with_severity(severity)
                        .with_detail(e.to_string()),
                )
                .await;
                Ok(Outcome::Abandoned {
                    retry_count,
                    code: e.code(),
                })
            }
            Err(e) => {
                self.reschedule(broker, delivery, message, body, binding, retry_count, e, metrics)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn reschedule(
        &self,
        broker: &dyn Broker,
        delivery: &Delivery,
        message: &Message,
        body: &Body,
        binding: Option<HandlerBinding>,
        retry_count: u32,
        cause: HandlerError,
        metrics: &ConsumerMetrics,
    ) -> Result<Outcome, ConsumerError> {
        let next = retry_count.saturating_add(1);
        self.store.set(message.id(), next).await?;

        let delay_ms = self.delays.delay_for(next);
        let mut request = ProduceRequest::new(message.queue(), Value::Object(body.clone()))
            .with_attempt_limit(message.attempt_limit())
            .with_delay_ms(delay_ms);
        if let Some(binding) = &binding {
            request = request.with_binding(binding);
        }

        let severity = if next == 1 {
            Severity::Error
        } else {
            Severity::Warning
        };

        if let Err(e) = self.producer.re_produce(message.id(), &request).await {
            error!(
                message_id = %message.id(),
                retry_count = next,
                error = %e,
                "Re-submission failed, requeueing message"
            );
            broker.reject(delivery, true).await?;
            self.report(
                event(message, binding, Status::RetryFailed, next)
                    .with_severity(severity)
                    .with_detail(format!("{}; re-submission failed: {}", cause, e)),
            )
            .await;
            return Ok(Outcome::Faulted { retry_count: next });
        }

        broker.ack(delivery).await?;
        metrics.retry_scheduled(self.delays.delay(next));

        warn!(
            message_id = %message.id(),
            retry_count = next,
            delay_ms,
            error = %cause,
            "Handler failed, message re-submitted"
        );
        self.report(
            event(message, binding, Status::RetryFailed, next)
                .with_delay_ms(delay_ms)
                .with_severity(severity)
                .with_detail(cause.to_string()),
        )
        .await;

        Ok(Outcome::Rescheduled {
            retry_count: next,
            delay_ms,
        })
    }

    /// Last line of defence: count the attempt if possible and requeue.
    async fn recover(
        &self,
        broker: &dyn Broker,
        delivery: &Delivery,
        message: &Message,
        binding: Option<HandlerBinding>,
        cause: ConsumerError,
    ) -> Result<Outcome, ConsumerError> {
        let retry_count = self
            .store
            .get(message.id())
            .await
            .map(|count| count.saturating_add(1))
            .unwrap_or(1);

        error!(
            message_id = %message.id(),
            retry_count,
            error = %cause,
            kind = ?cause.kind(),
            "Unexpected failure, requeueing message"
        );
        if let Err(e) = self.store.set(message.id(), retry_count).await {
            debug!(message_id = %message.id(), error = %e, "Could not persist retry count");
        }
        broker.reject(delivery, true).await?;
        self.report(
            event(message, binding, Status::RetryFailed, retry_count).with_detail(cause.to_string()),
        )
        .await;

        Ok(Outcome::Faulted { retry_count })
    }

    async fn forget(&self, message: &Message) {
        if let Err(e) = self.store.delete(message.id()).await {
            warn!(message_id = %message.id(), error = %e, "Could not delete retry record");
        }
    }

    async fn report(&self, event: LifecycleEvent) {
        self.reporter.report(&event).await;
    }
}

fn event(
    message: &Message,
    binding: Option<HandlerBinding>,
    status: Status,
    retry_count: u32,
) -> LifecycleEvent {
    LifecycleEvent::new(
        message.queue(),
        Some(message.id().to_string()),
        message.body_value(),
        status,
        retry_count,
    )
    .with_delay_ms(message.delay_ms())
    .with_attempt_limit(message.attempt_limit())
    .with_binding(binding)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
