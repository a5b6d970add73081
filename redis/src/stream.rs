//! The durable order stream consumed by the materialization pipeline.
//!
//! Admitted orders are appended to a stream by the admission script; a
//! consumer group with a stable identity reads them in small batches with
//! a bounded block timeout. Delivery is at-least-once: an entry stays in
//! the group's pending list from delivery until it is acknowledged, and
//! [`OrderQueue::read_pending`] replays that range from the start after a
//! crash or a processing fault.
//!
//! Messages travel as flat field maps (`id`, `user_id`, `voucher_id`),
//! written server-side by the admission script without any serialization
//! library. Decoding failures are surfaced per entry so the consumer can
//! acknowledge and discard poison messages instead of replaying them
//! forever.

use crate::keys::{ORDER_CONSUMER, ORDER_GROUP, ORDER_STREAM_KEY};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use voucherflow_core::{AdmissionMessage, OrderId, UserId, VoucherId};

/// Default number of entries fetched per read.
const DEFAULT_BATCH_SIZE: usize = 16;

/// Default block timeout for reads of new entries.
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised by stream operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The stream store could not be reached.
    #[error("order stream unavailable: {0}")]
    Unavailable(String),
}

/// One delivered stream entry.
///
/// `payload` is `Err` when the entry's field map does not decode into an
/// [`AdmissionMessage`]; the consumer logs and acknowledges such entries,
/// since replaying a malformed message can never succeed.
#[derive(Debug)]
pub struct QueuedOrder {
    /// The stream entry ID used for acknowledgement.
    pub entry_id: String,

    /// The decoded message, or why decoding failed.
    pub payload: Result<AdmissionMessage, String>,
}

/// Consumer-group handle on the order stream.
///
/// The group name must stay stable across restarts so the pending range
/// survives a crash; the consumer name identifies this worker within the
/// group.
#[derive(Clone)]
pub struct OrderQueue {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
    batch_size: usize,
    block_timeout: Duration,
}

impl OrderQueue {
    /// Create a queue handle with the default stream, group and consumer
    /// identity.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            stream_key: ORDER_STREAM_KEY.to_string(),
            group: ORDER_GROUP.to_string(),
            consumer: ORDER_CONSUMER.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }

    /// Override the stream key.
    #[must_use]
    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self
    }

    /// Override the consumer-group identity.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer = consumer.into();
        self
    }

    /// Override the per-read batch size.
    ///
    /// # Panics
    ///
    /// Panics if `batch_size` is 0.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch_size must be greater than 0");
        self.batch_size = batch_size;
        self
    }

    /// Override the block timeout for new-entry reads.
    #[must_use]
    pub const fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Create the consumer group if it does not exist yet (creating the
    /// stream as well if needed). Idempotent: an already-existing group is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unavailable`] if the store cannot be reached.
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let created: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;

        match created {
            Ok(_) => {
                tracing::info!(
                    stream = %self.stream_key,
                    group = %self.group,
                    "consumer group created"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(
                    stream = %self.stream_key,
                    group = %self.group,
                    "consumer group already exists"
                );
                Ok(())
            }
            Err(e) => Err(QueueError::Unavailable(e.to_string())),
        }
    }

    /// Read the next batch of new entries, blocking up to the configured
    /// timeout. An empty result is a normal idle poll, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unavailable`] if the store cannot be reached.
    pub async fn read_new(&self) -> Result<Vec<QueuedOrder>, QueueError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.batch_size)
            .block(self.block_timeout.as_millis() as usize);

        self.read(&options, ">").await
    }

    /// Re-read this consumer's own delivered-but-unacknowledged entries
    /// from the start of its pending range. An empty result means the
    /// pending list is drained.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unavailable`] if the store cannot be reached.
    pub async fn read_pending(&self) -> Result<Vec<QueuedOrder>, QueueError> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.batch_size);

        self.read(&options, "0").await
    }

    /// Acknowledge one entry, removing it from the pending range.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unavailable`] if the store cannot be reached.
    pub async fn ack(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        let acked: i64 = conn
            .xack(&self.stream_key, &self.group, &[entry_id])
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        if acked == 0 {
            tracing::warn!(entry_id, "acknowledged an entry that was not pending");
        }

        Ok(())
    }

    async fn read(
        &self,
        options: &StreamReadOptions,
        offset: &str,
    ) -> Result<Vec<QueuedOrder>, QueueError> {
        let mut conn = self.conn.clone();

        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream_key], &[offset], options)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let mut entries = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                entries.push(QueuedOrder {
                    payload: decode_fields(&entry.map),
                    entry_id: entry.id,
                });
            }
        }

        Ok(entries)
    }
}

fn decode_fields(map: &HashMap<String, Value>) -> Result<AdmissionMessage, String> {
    Ok(AdmissionMessage {
        id: OrderId(field_u64(map, "id")?),
        user_id: UserId(field_u64(map, "user_id")?),
        voucher_id: VoucherId(field_u64(map, "voucher_id")?),
    })
}

fn field_u64(map: &HashMap<String, Value>, name: &str) -> Result<u64, String> {
    let value = map
        .get(name)
        .ok_or_else(|| format!("missing field `{name}`"))?;

    let raw: String = redis::from_redis_value(value)
        .map_err(|e| format!("field `{name}` is not a string: {e}"))?;

    raw.parse()
        .map_err(|e| format!("field `{name}` is not a u64: {e}"))
}
