//! Queue adapter: lightweight delivery of job references per tool slug.
//!
//! A queue message carries only the job id plus delivery bookkeeping; the job
//! record store stays authoritative. Deliveries are at-least-once:
//!
//! - `fetch` hands out ready deliveries and marks them active
//! - `touch` restarts an active delivery's expiry clock when its job starts
//! - `ack` removes a delivery for good
//! - `fail` replaces a delivery with a new one (new message id) after backoff,
//!   until the queue's retry limit
//! - active deliveries older than their expiry are dropped and reported once
//!   through `take_expired`
//!
//! ## Components
//!
//! - `JobQueue`: async adapter trait
//! - `InMemoryJobQueue`: tests/dev (with enqueue failure injection)
//! - `RedisStreamsJobQueue`: Redis Streams consumer groups (feature `redis`)

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobforge_core::{JobId, RetryPolicy, ToolSlug};

pub use in_memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;

/// Default queue-side expiry of an active delivery.
pub const DEFAULT_EXPIRE_IN: Duration = Duration::from_secs(15 * 60);

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown delivery {message_id} for tool {tool_slug}")]
    UnknownDelivery {
        tool_slug: String,
        message_id: String,
    },

    #[error("enqueue rejected: {0}")]
    Rejected(String),
}

/// Per-message enqueue options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: i32,
    /// Do not deliver before this instant.
    pub start_after: Option<DateTime<Utc>>,
    /// Expiry of the delivery once active; queue default when `None`.
    pub expire_in: Option<Duration>,
}

/// Queue-wide options.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Redeliveries allowed through `fail` before the queue gives up.
    pub retry_limit: u32,
    /// Delay between redeliveries, indexed by the delivery's retry count.
    pub backoff: RetryPolicy,
    pub default_expire_in: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        let backoff = RetryPolicy::default();
        Self {
            retry_limit: backoff.max_attempts,
            backoff,
            default_expire_in: DEFAULT_EXPIRE_IN,
        }
    }
}

impl QueueOptions {
    /// Delay before redelivery number `retry_count`, or `None` once the retry
    /// limit is used up.
    pub fn redelivery_delay(&self, retry_count: u32) -> Option<Duration> {
        (retry_count <= self.retry_limit).then(|| self.backoff.delay_for_retry(retry_count))
    }
}

/// A delivery handed out by `fetch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub tool_slug: ToolSlug,
    pub job_id: JobId,
    /// Number of failed deliveries before this one.
    pub retry_count: u32,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of `fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redelivery {
    Scheduled { message_id: String, delay: Duration },
    /// Retry limit reached; the job no longer has a delivery.
    Exhausted,
}

/// Active delivery dropped by queue-side expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredDelivery {
    pub tool_slug: ToolSlug,
    pub job_id: JobId,
    pub message_id: String,
}

/// Job queue adapter.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        tool_slug: &ToolSlug,
        job_id: JobId,
        options: EnqueueOptions,
    ) -> QueueResult<String>;

    /// Up to `batch_size` ready deliveries, now marked active.
    async fn fetch(
        &self,
        tool_slug: &ToolSlug,
        batch_size: usize,
    ) -> QueueResult<Vec<QueueMessage>>;

    /// Restart the expiry clock of an active delivery. Returns `false` when the
    /// delivery is gone (acked, failed or already expired).
    async fn touch(&self, tool_slug: &ToolSlug, message_id: &str) -> QueueResult<bool>;

    async fn ack(&self, tool_slug: &ToolSlug, message_id: &str, result: &JsonValue)
    -> QueueResult<()>;

    async fn fail(&self, tool_slug: &ToolSlug, message_id: &str, reason: &str)
    -> QueueResult<Redelivery>;

    /// Expire overdue active deliveries and drain everything expired since the
    /// last call.
    async fn take_expired(&self) -> QueueResult<Vec<ExpiredDelivery>>;

    /// Whether any delivery (queued, delayed or active) exists for `job_id`.
    async fn has_live_delivery(&self, tool_slug: &ToolSlug, job_id: JobId) -> QueueResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redelivery_delay_stops_at_limit() {
        let options = QueueOptions {
            retry_limit: 2,
            backoff: RetryPolicy::exponential(
                3,
                Duration::from_secs(10),
                Duration::from_secs(3600),
            ),
            default_expire_in: DEFAULT_EXPIRE_IN,
        };

        assert_eq!(options.redelivery_delay(1), Some(Duration::from_secs(10)));
        assert_eq!(options.redelivery_delay(2), Some(Duration::from_secs(20)));
        assert_eq!(options.redelivery_delay(3), None);
    }
}
