use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::image::ImageFormat;

/// Content type recorded on every published envelope.
pub const CONTENT_TYPE: &str = "application/json";

/// Work item handed from the producer to the consumer. Carries no status; the
/// request row is the single source of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub file_id: Uuid,
    pub filename: String,
    pub source_format: ImageFormat,
    pub target_format: ImageFormat,
    pub request_id: Uuid,
    pub ratio: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

/// What actually sits in Redis: the message plus its publish metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub delivery_id: Uuid,
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub body: QueueMessage,
}

impl Envelope {
    pub fn persistent(body: QueueMessage) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            content_type: CONTENT_TYPE.to_string(),
            delivery_mode: DeliveryMode::Persistent,
            body,
        }
    }
}

/// A received message awaiting ack or nack. `raw` is the exact payload held in
/// the worker's in-flight list and doubles as the delivery tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    pub delivery_id: Uuid,
    raw: String,
}

impl Delivery {
    pub fn new(message: QueueMessage, delivery_id: Uuid, raw: String) -> Self {
        Self {
            message,
            delivery_id,
            raw,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// At-least-once work queue with manual acknowledgement.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Take the next message, if any, and hold it as unacknowledged.
    async fn receive(&self) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Release a delivery. With `requeue` it goes back to the queue, otherwise
    /// to the dead-letter list.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Return deliveries left unacknowledged by a previous run of this worker.
    async fn recover(&self) -> Result<usize, QueueError>;
}

/// Redis-backed reliable queue: LPUSH to publish, RPOPLPUSH into a per-worker
/// in-flight list to receive, LREM from that list to settle.
pub struct RedisQueue {
    client: redis::Client,
    queue_key: String,
    processing_key: String,
    dead_letter_key: String,
}

impl RedisQueue {
    pub fn new(redis_url: &str, queue_name: &str, worker_id: &str) -> Result<Self, QueueError> {
        if queue_name.is_empty() {
            return Err(QueueError::Config("queue name must not be empty".to_string()));
        }
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            queue_key: queue_name.to_string(),
            processing_key: format!("{queue_name}:processing:{worker_id}"),
            dead_letter_key: format!("{queue_name}:dead"),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Messages waiting to be received.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(&self.queue_key).await?)
    }

    /// Messages parked after exhausting their attempts.
    pub async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(&self.dead_letter_key).await?)
    }

    /// Remove `raw` from the in-flight list and, if `destination` is set, push
    /// it there. The push only happens when this worker still held the entry;
    /// after a `recover` elsewhere the payload already lives in the queue.
    async fn settle(&self, raw: &str, destination: Option<&str>) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = match destination {
            Some(key) => {
                redis::Script::new(SETTLE_AND_MOVE)
                    .key(&self.processing_key)
                    .key(key)
                    .arg(raw)
                    .invoke_async(&mut conn)
                    .await?
            }
            None => conn.lrem(&self.processing_key, 1, raw).await?,
        };
        if removed == 0 {
            tracing::warn!(
                processing_key = %self.processing_key,
                "Delivery no longer held by this worker, left where it is"
            );
        }
        Ok(())
    }
}

/// LREM from KEYS[1]; RPUSH onto KEYS[2] only if something was removed.
const SETTLE_AND_MOVE: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed > 0 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
end
return removed
"#;

#[async_trait]
impl QueueTransport for RedisQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&Envelope::persistent(message.clone()))?;
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(&self.queue_key, payload).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.rpoplpush(&self.queue_key, &self.processing_key).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => Ok(Some(Delivery::new(envelope.body, envelope.delivery_id, raw))),
            Err(e) => {
                // Undecodable payloads can never succeed; park them instead of looping.
                self.settle(&raw, Some(self.dead_letter_key.as_str())).await?;
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery.raw(), None).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        // Requeued entries go to the consuming end so they are redelivered next.
        let destination = if requeue {
            self.queue_key.as_str()
        } else {
            self.dead_letter_key.as_str()
        };
        self.settle(delivery.raw(), Some(destination)).await
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let mut recovered = 0;
        while conn
            .rpoplpush::<_, _, Option<String>>(&self.processing_key, &self.queue_key)
            .await?
            .is_some()
        {
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> QueueMessage {
        QueueMessage {
            file_id: Uuid::new_v4(),
            filename: "photo.jpg".to_string(),
            source_format: ImageFormat::Jpeg,
            target_format: ImageFormat::Png,
            request_id: Uuid::new_v4(),
            ratio: 90,
        }
    }

    #[test]
    fn test_message_wire_field_names() {
        let value = serde_json::to_value(sample_message()).unwrap();
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["file_id", "filename", "ratio", "request_id", "source_format", "target_format"]
        );
        assert_eq!(value["target_format"], "png");
    }

    #[test]
    fn test_envelope_is_persistent_json() {
        let envelope = Envelope::persistent(sample_message());
        assert_eq!(envelope.content_type, "application/json");
        assert_eq!(envelope.delivery_mode, DeliveryMode::Persistent);

        let other = Envelope::persistent(sample_message());
        assert_ne!(envelope.delivery_id, other.delivery_id);
    }

    #[test]
    fn test_redis_queue_keys() {
        let queue = RedisQueue::new("redis://127.0.0.1", "conversions", "w1").unwrap();
        assert_eq!(queue.processing_key, "conversions:processing:w1");
        assert_eq!(queue.dead_letter_key, "conversions:dead");
        assert!(RedisQueue::new("redis://127.0.0.1", "", "w1").is_err());
    }
}
