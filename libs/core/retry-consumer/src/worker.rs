//! Queue worker loop.
//!
//! A `QueueWorker` owns one queue: it fetches batches from the broker and
//! hands each delivery to the shared [`ConsumptionEngine`] in order. On
//! startup and then every `claim_idle_ms` it also claims deliveries that
//! other consumers of the group left unsettled.
//! [`run_workers`] runs one worker per queue until shutdown.

use crate::broker::{Broker, Delivery};
use crate::config::WorkerConfig;
use crate::engine::{ConsumeOptions, ConsumptionEngine};
use crate::error::ConsumerError;
use crate::metrics::ConsumerMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// Worker consuming a single queue.
pub struct QueueWorker {
    broker: Arc<dyn Broker>,
    engine: Arc<ConsumptionEngine>,
    queue: String,
    options: ConsumeOptions,
    config: WorkerConfig,
    metrics: ConsumerMetrics,
}

impl QueueWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        engine: Arc<ConsumptionEngine>,
        queue: impl Into<String>,
        config: WorkerConfig,
    ) -> Self {
        let queue = queue.into();
        Self {
            broker,
            engine,
            metrics: ConsumerMetrics::new(&queue),
            queue,
            options: ConsumeOptions::default(),
            config,
        }
    }

    /// Apply a handler and/or attempt-limit override to every message.
    pub fn with_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Run the worker loop.
    ///
    /// Stops cleanly when `shutdown` flips to `true`. Returns an error when
    /// the broker failed `max_consecutive_errors` times in a row.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        info!(
            queue = %self.queue,
            group = %self.config.consumer_group,
            consumer_id = %self.config.consumer_id,
            batch_size = self.config.batch_size,
            handler = ?self.options.binding.as_ref().map(|b| b.to_string()),
            "Starting queue worker"
        );

        self.broker.declare(&self.queue).await?;

        // Pick up whatever crashed consumers left behind
        if let Err(e) = self.claim_once().await {
            warn!(queue = %self.queue, error = %e, "Failed to claim abandoned deliveries on startup");
        }

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let claim_interval = Duration::from_millis(self.config.claim_idle_ms);
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!(queue = %self.queue, "Received shutdown signal, stopping worker");
                break;
            }

            if last_claim.elapsed() >= claim_interval {
                if let Err(e) = self.claim_once().await {
                    warn!(queue = %self.queue, error = %e, "Failed to claim abandoned deliveries");
                }
                last_claim = Instant::now();
            }

            let pause = match self.poll_once().await {
                Ok(processed) => {
                    if consecutive_errors > 0 {
                        info!(queue = %self.queue, "Broker recovered after {} errors", consecutive_errors);
                        consecutive_errors = 0;
                    }
                    (processed == 0 && !poll_interval.is_zero()).then_some(poll_interval)
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.metrics.broker_error();

                    if consecutive_errors >= self.config.max_consecutive_errors {
                        error!(
                            queue = %self.queue,
                            error = %e,
                            consecutive_errors,
                            "Broker keeps failing, giving up"
                        );
                        return Err(e);
                    }

                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_BACKOFF_SECS);
                    warn!(
                        queue = %self.queue,
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Broker error, backing off"
                    );
                    Some(Duration::from_secs(backoff_secs))
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            info!(queue = %self.queue, "Shutdown channel closed, stopping worker");
                            break;
                        }
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(queue = %self.queue, "Queue worker stopped");
        Ok(())
    }

    /// Fetch one batch and process it sequentially.
    ///
    /// Returns the number of deliveries processed. A broker failure stops
    /// the batch; unsettled deliveries come back on a later fetch.
    pub async fn poll_once(&self) -> Result<usize, ConsumerError> {
        let deliveries = self
            .broker
            .fetch(&self.queue, self.config.batch_size)
            .await?;

        self.process_batch(&deliveries).await
    }

    /// Claim one batch of abandoned deliveries and process it.
    ///
    /// Returns the number of deliveries claimed.
    pub async fn claim_once(&self) -> Result<usize, ConsumerError> {
        let deliveries = self
            .broker
            .claim_abandoned(&self.queue, self.config.batch_size)
            .await?;

        if !deliveries.is_empty() {
            info!(queue = %self.queue, count = deliveries.len(), "Processing claimed deliveries");
        }
        self.process_batch(&deliveries).await
    }

    async fn process_batch(&self, deliveries: &[Delivery]) -> Result<usize, ConsumerError> {
        for delivery in deliveries {
            let outcome = self
                .engine
                .process(self.broker.as_ref(), delivery, &self.options)
                .await?;
            debug!(
                queue = %self.queue,
                tag = %delivery.tag,
                status = %outcome.status(),
                retry_count = outcome.retry_count(),
                acked = outcome.acked(),
                "Delivery settled"
            );
        }

        Ok(deliveries.len())
    }
}

/// Run every worker until `shutdown` fires.
///
/// When one worker gives up, the others are asked to stop after their
/// current message and its error is returned.
pub async fn run_workers(
    workers: Vec<QueueWorker>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConsumerError> {
    let (stop_tx, stop_rx) = watch::channel(*shutdown.borrow());
    let mut set = JoinSet::new();

    for worker in workers {
        let rx = stop_rx.clone();
        set.spawn(async move {
            let queue = worker.queue().to_string();
            (queue, worker.run(rx).await)
        });
    }

    let mut first_error = None;
    let mut watching = true;
    loop {
        tokio::select! {
            joined = set.join_next() => {
                let Some(joined) = joined else { break };
                match joined {
                    Ok((queue, Ok(()))) => debug!(queue = %queue, "Worker finished"),
                    Ok((queue, Err(e))) => {
                        error!(queue = %queue, error = %e, "Worker failed, stopping remaining workers");
                        let _ = stop_tx.send(true);
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        error!(error = %e, "Worker task panicked, stopping remaining workers");
                        let _ = stop_tx.send(true);
                        first_error.get_or_insert(ConsumerError::Broker(format!("worker task failed: {}", e)));
                    }
                }
            }
            changed = shutdown.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                } else if *shutdown.borrow() {
                    watching = false;
                    let _ = stop_tx.send(true);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
