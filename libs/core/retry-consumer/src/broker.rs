//! Broker access
//!
//! The engine only needs four broker operations: declare a queue, fetch
//! deliveries, acknowledge and reject. Workers additionally claim deliveries
//! that a crashed consumer left unsettled. [`RedisStreamBroker`] maps them
//! onto a Redis Stream with a consumer group; [`MemoryBroker`] keeps
//! everything in process for tests and local runs.

use crate::config::WorkerConfig;
use crate::error::ConsumerError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Stream entry field holding the JSON-encoded headers.
pub const HEADERS_FIELD: &str = "headers";

/// Stream entry field holding the JSON-encoded properties.
pub const PROPERTIES_FIELD: &str = "properties";

/// Stream entry field holding the raw body.
pub const BODY_FIELD: &str = "body";

/// One message handed out by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Queue the message was fetched from
    pub queue: String,
    /// Broker-specific delivery tag used for ack/reject
    pub tag: String,
    pub headers: HashMap<String, String>,
    pub properties: Map<String, Value>,
    pub body: String,
}

/// Queue broker operations used by the consumer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make sure the queue (and whatever consumer state it needs) exists.
    async fn declare(&self, queue: &str) -> Result<(), ConsumerError>;

    /// Fetch up to `max` deliveries. An empty vec means nothing is ready.
    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, ConsumerError>;

    /// Acknowledge a delivery so it is never handed out again.
    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError>;

    /// Reject a delivery, optionally putting it back on the queue.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), ConsumerError>;

    /// Take over up to `max` deliveries other consumers fetched but never
    /// settled within the configured idle time.
    async fn claim_abandoned(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, ConsumerError>;
}

/// Broker on Redis Streams consumer groups.
///
/// Entries carry three fields: `headers` and `properties` as JSON objects and
/// `body` as the raw string. Requeueing appends a copy of the entry and then
/// acknowledges the original. Entries idle in another consumer's pending list
/// for longer than `claim_idle_ms` are moved over with `XCLAIM`.
#[derive(Clone)]
pub struct RedisStreamBroker {
    redis: ConnectionManager,
    consumer_group: String,
    consumer_id: String,
    block_timeout_ms: Option<u64>,
    claim_idle_ms: u64,
}

impl RedisStreamBroker {
    pub fn new(redis: ConnectionManager, config: &WorkerConfig) -> Self {
        Self {
            redis,
            consumer_group: config.consumer_group.clone(),
            consumer_id: config.consumer_id.clone(),
            block_timeout_ms: config.block_timeout_ms,
            claim_idle_ms: config.claim_idle_ms,
        }
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Append an entry to a queue, returning the new entry id.
    pub async fn publish(
        &self,
        queue: &str,
        headers: &HashMap<String, String>,
        properties: &Map<String, Value>,
        body: &str,
    ) -> Result<String, ConsumerError> {
        let mut conn = self.redis.clone();
        let headers = serde_json::to_string(headers)?;
        let properties = serde_json::to_string(properties)?;

        let id: String = conn
            .xadd(
                queue,
                "*",
                &[
                    (HEADERS_FIELD, headers.as_str()),
                    (PROPERTIES_FIELD, properties.as_str()),
                    (BODY_FIELD, body),
                ],
            )
            .await
            .map_err(broker_error)?;

        debug!(queue = %queue, entry_id = %id, "Published entry");
        Ok(id)
    }

    /// Read entries, returning the usable deliveries and how many entries
    /// were dropped because they no longer exist in the stream.
    async fn read(
        &self,
        queue: &str,
        start: &str,
        options: StreamReadOptions,
    ) -> Result<(Vec<Delivery>, usize), ConsumerError> {
        let mut conn = self.redis.clone();
        let result: RedisResult<Option<StreamReadReply>> =
            conn.xread_options(&[queue], &[start], &options).await;

        match result {
            Ok(reply) => {
                let entries = reply
                    .unwrap_or_default()
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .collect();
                self.settle_entries(queue, entries).await
            }
            // Group not declared yet
            Err(e) if e.to_string().contains("NOGROUP") => Ok((vec![], 0)),
            Err(e) => Err(broker_error(e)),
        }
    }

    /// Convert entries into deliveries and acknowledge the ones that were
    /// trimmed while pending, so they leave the pending list for good.
    async fn settle_entries(
        &self,
        queue: &str,
        entries: Vec<StreamId>,
    ) -> Result<(Vec<Delivery>, usize), ConsumerError> {
        let (deliveries, stale) = split_entries(queue, entries);
        if !stale.is_empty() {
            let mut conn = self.redis.clone();
            let _: i64 = conn
                .xack(queue, &self.consumer_group, stale.as_slice())
                .await
                .map_err(broker_error)?;
            warn!(
                queue = %queue,
                count = stale.len(),
                entry_ids = ?stale,
                "Acknowledged pending entries that no longer exist"
            );
        }
        Ok((deliveries, stale.len()))
    }

    /// Ids of entries pending on other consumers for at least `claim_idle_ms`.
    async fn abandoned_ids(&self, queue: &str, max: usize) -> Result<Vec<String>, ConsumerError> {
        let mut conn = self.redis.clone();

        // XPENDING key group IDLE min-idle - + count
        let result: RedisResult<Vec<(String, String, i64, i64)>> = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.consumer_group)
            .arg("IDLE")
            .arg(self.claim_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(pending) => Ok(pending
                .into_iter()
                .filter(|(_, consumer, _, _)| consumer != &self.consumer_id)
                .map(|(id, _, _, _)| id)
                .collect()),
            Err(e) if e.to_string().contains("NOGROUP") => Ok(vec![]),
            Err(e) => Err(broker_error(e)),
        }
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn declare(&self, queue: &str) -> Result<(), ConsumerError> {
        let mut conn = self.redis.clone();

        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(queue = %queue, group = %self.consumer_group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(queue = %queue, group = %self.consumer_group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(broker_error(e)),
        }
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, ConsumerError> {
        // Entries delivered to this consumer but never settled come first
        loop {
            let (pending, dropped) = self
                .read(
                    queue,
                    "0",
                    StreamReadOptions::default()
                        .group(&self.consumer_group, &self.consumer_id)
                        .count(max),
                )
                .await?;

            if !pending.is_empty() {
                debug!(queue = %queue, count = pending.len(), "Re-reading pending entries");
                return Ok(pending);
            }
            // Dropped entries are acknowledged now, look behind them
            if dropped == 0 {
                break;
            }
        }

        let mut options = StreamReadOptions::default()
            .group(&self.consumer_group, &self.consumer_id)
            .count(max);
        if let Some(timeout) = self.block_timeout_ms {
            options = options.block(timeout as usize);
        }

        let (fresh, _) = self.read(queue, ">", options).await?;
        Ok(fresh)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .xack(&delivery.queue, &self.consumer_group, &[&delivery.tag])
            .await
            .map_err(broker_error)?;

        debug!(queue = %delivery.queue, entry_id = %delivery.tag, "Acknowledged entry");
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), ConsumerError> {
        if requeue {
            self.publish(
                &delivery.queue,
                &delivery.headers,
                &delivery.properties,
                &delivery.body,
            )
            .await?;
        }
        self.ack(delivery).await
    }

    async fn claim_abandoned(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, ConsumerError> {
        let ids = self.abandoned_ids(queue, max).await?;
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.redis.clone();
        let reply: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(queue)
            .arg(&self.consumer_group)
            .arg(&self.consumer_id)
            .arg(self.claim_idle_ms)
            .arg(&ids)
            .query_async(&mut conn)
            .await
            .map_err(broker_error)?;

        let (claimed, _) = self.settle_entries(queue, reply.ids).await?;
        if !claimed.is_empty() {
            info!(
                queue = %queue,
                consumer_id = %self.consumer_id,
                count = claimed.len(),
                "Claimed abandoned entries"
            );
        }
        Ok(claimed)
    }
}

fn broker_error(e: redis::RedisError) -> ConsumerError {
    ConsumerError::Broker(e.to_string())
}

/// Separate usable entries from ones trimmed out of the stream while pending.
///
/// Trimmed entries come back without fields; their ids are returned so the
/// caller can acknowledge them.
fn split_entries(queue: &str, entries: Vec<StreamId>) -> (Vec<Delivery>, Vec<String>) {
    let mut deliveries = Vec::with_capacity(entries.len());
    let mut stale = Vec::new();
    for entry in entries {
        match delivery_from_entry(queue, entry) {
            Ok(delivery) => deliveries.push(delivery),
            Err(id) => stale.push(id),
        }
    }
    (deliveries, stale)
}

/// Turn a stream entry into a delivery, or give back its id when the entry
/// has no fields left.
///
/// Unparseable headers or properties are treated as empty so the engine can
/// still settle the entry.
fn delivery_from_entry(queue: &str, entry: StreamId) -> Result<Delivery, String> {
    if entry.map.is_empty() {
        return Err(entry.id);
    }

    let headers = entry
        .get::<String>(HEADERS_FIELD)
        .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
        .map(|map| {
            map.into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k, s),
                    other => (k, other.to_string()),
                })
                .collect()
        })
        .unwrap_or_default();

    let properties = entry
        .get::<String>(PROPERTIES_FIELD)
        .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
        .unwrap_or_default();

    Ok(Delivery {
        queue: queue.to_string(),
        headers,
        properties,
        body: entry.get::<String>(BODY_FIELD).unwrap_or_default(),
        tag: entry.id,
    })
}

#[derive(Debug, Default)]
struct MemoryState {
    queues: HashMap<String, VecDeque<Delivery>>,
    acked: Vec<String>,
    rejected: Vec<(String, bool)>,
    abandoned: HashMap<String, VecDeque<Delivery>>,
    next_tag: u64,
    failing_fetches: u32,
}

/// In-process broker.
///
/// Keeps every settle decision so callers can inspect what happened to each
/// delivery tag.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message and return its delivery tag.
    pub fn publish(
        &self,
        queue: &str,
        headers: HashMap<String, String>,
        properties: Map<String, Value>,
        body: impl Into<String>,
    ) -> String {
        let mut state = self.lock();
        state.next_tag += 1;
        let tag = state.next_tag.to_string();

        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Delivery {
                queue: queue.to_string(),
                tag: tag.clone(),
                headers,
                properties,
                body: body.into(),
            });
        tag
    }

    /// Leave a delivery unsettled as if the consumer holding it had died.
    ///
    /// It is only handed out again through [`Broker::claim_abandoned`].
    pub fn abandon(&self, delivery: Delivery) {
        self.lock()
            .abandoned
            .entry(delivery.queue.clone())
            .or_default()
            .push_back(delivery);
    }

    /// Make the next `count` fetches fail as if the connection dropped.
    pub fn fail_next_fetches(&self, count: u32) {
        self.lock().failing_fetches = count;
    }

    /// Tags acknowledged so far, in order.
    pub fn acked(&self) -> Vec<String> {
        self.lock().acked.clone()
    }

    /// Tags rejected so far with their requeue flag, in order.
    pub fn rejected(&self) -> Vec<(String, bool)> {
        self.lock().rejected.clone()
    }

    /// Number of deliveries waiting on a queue.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str) -> Result<(), ConsumerError> {
        self.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, ConsumerError> {
        let mut state = self.lock();
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(ConsumerError::Broker("connection lost".to_string()));
        }

        let Some(pending) = state.queues.get_mut(queue) else {
            return Ok(vec![]);
        };
        let take = max.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        self.lock().acked.push(delivery.tag.clone());
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), ConsumerError> {
        {
            let mut state = self.lock();
            state.rejected.push((delivery.tag.clone(), requeue));
        }
        if requeue {
            self.publish(
                &delivery.queue,
                delivery.headers.clone(),
                delivery.properties.clone(),
                delivery.body.clone(),
            );
        }
        Ok(())
    }

    async fn claim_abandoned(
        &self,
        queue: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, ConsumerError> {
        let mut state = self.lock();
        let Some(abandoned) = state.abandoned.get_mut(queue) else {
            return Ok(vec![]);
        };
        let take = max.min(abandoned.len());
        Ok(abandoned.drain(..take).collect())
    }
}
