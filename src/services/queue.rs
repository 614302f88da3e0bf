use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::models::message::JobMessage;

const QUEUE_KEY: &str = "imagegen:jobs";
const PROCESSING_KEY: &str = "imagegen:processing";
/// Sorted set of in-flight payloads scored by their visibility deadline (ms).
const DEADLINES_KEY: &str = "imagegen:deadlines";

/// How long a received message stays invisible before it is handed out again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(900);

const RECEIVE_SCRIPT: &str = r#"
local payload = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if payload then
  redis.call('ZADD', KEYS[3], ARGV[1], payload)
end
return payload
"#;

const REQUEUE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
local moved = 0
for _, payload in ipairs(expired) do
  if redis.call('LREM', KEYS[2], 1, payload) > 0 then
    redis.call('RPUSH', KEYS[1], payload)
    moved = moved + 1
  end
  redis.call('ZREM', KEYS[3], payload)
end
return moved
"#;

/// One message handed to a consumer. The body stays raw so that malformed
/// payloads reach the worker instead of failing the receive.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: String,
    pub body: String,
    /// Transport-level handle used to acknowledge the delivery.
    pub receipt: String,
}

/// At-least-once delivery channel between submission and processing.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Publish a job message, returning the transport's message id.
    async fn publish(&self, message: &JobMessage) -> Result<String, QueueError>;

    /// Take up to `max` messages. Received messages stay in flight until acked.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Messages waiting to be received.
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Hand unacked messages whose visibility deadline has passed back to
    /// the pending side. Returns how many were moved.
    async fn requeue_expired(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Envelope stored in Redis around the serialized job message.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    message_id: String,
    body: String,
}

/// Redis-backed work queue. Pending messages live in a list; received
/// messages are moved atomically to a processing list, with a visibility
/// deadline, until acked. Messages of a worker that died before acking are
/// returned to the pending list by [`WorkQueue::requeue_expired`].
pub struct RedisWorkQueue {
    client: redis::Client,
    visibility_timeout: Duration,
}

impl RedisWorkQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn publish(&self, message: &JobMessage) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let envelope = Envelope {
            message_id: Uuid::new_v4().to_string(),
            body: serde_json::to_string(message).map_err(QueueError::Serialize)?,
        };
        let payload = serde_json::to_string(&envelope).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(envelope.message_id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let mut deliveries = Vec::with_capacity(max);
        let script = Script::new(RECEIVE_SCRIPT);
        let timeout_ms = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let deadline = Utc::now().timestamp_millis().saturating_add(timeout_ms);

        while deliveries.len() < max {
            let payload: Option<String> = script
                .key(QUEUE_KEY)
                .key(PROCESSING_KEY)
                .key(DEADLINES_KEY)
                .arg(deadline)
                .invoke_async(&mut conn)
                .await
                .map_err(QueueError::Redis)?;

            let Some(payload) = payload else { break };

            let delivery = match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) => Delivery {
                    message_id: envelope.message_id,
                    body: envelope.body,
                    receipt: payload,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Queue payload has no envelope, passing it through raw");
                    Delivery {
                        message_id: "unknown".to_string(),
                        body: payload.clone(),
                        receipt: payload,
                    }
                }
            };
            deliveries.push(delivery);
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &delivery.receipt)
            .ignore()
            .zrem(DEADLINES_KEY, &delivery.receipt)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let moved: usize = Script::new(REQUEUE_SCRIPT)
            .key(QUEUE_KEY)
            .key(PROCESSING_KEY)
            .key(DEADLINES_KEY)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}
