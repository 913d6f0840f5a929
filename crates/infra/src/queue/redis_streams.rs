//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream**: `{prefix}:{slug}:stream`, one per tool slug; entries carry
//!   `message_id` and `job_id`
//! - **Consumer group**: `{slug}.workers`; each queue instance reads as its
//!   own consumer (`worker-{WorkerId}`)
//! - **Delayed set**: `{prefix}:{slug}:delayed`, a sorted set of message ids
//!   scored by visibility time; due entries are appended to the stream on fetch
//! - **Deliveries**: `{prefix}:deliveries`, hash of message id -> delivery
//!   record (JSON); a delivery exists exactly while its hash field does
//! - **Live index**: `{prefix}:{slug}:live`, hash of job id -> message id
//! - **Expired list**: `{prefix}:expired`, drained by `take_expired`
//!
//! Active deliveries are found through `XPENDING`; an entry idle for longer
//! than its delivery's `expire_in` is acknowledged, deleted and pushed to the
//! expired list. `touch` re-claims the entry for this consumer with
//! `XCLAIM ... JUSTID`, which resets its idle time.
//!
//! Streams deliver in append order, so `priority` is stored on the delivery
//! record but does not reorder delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use jobforge_core::{JobId, ToolSlug, WorkerId};

use super::{
    EnqueueOptions, ExpiredDelivery, JobQueue, QueueError, QueueMessage, QueueOptions,
    QueueResult, Redelivery,
};

/// Default key prefix
const DEFAULT_PREFIX: &str = "jobforge";

/// Upper bound on pending entries inspected per expiry pass
const PENDING_SCAN_LIMIT: usize = 100;

/// Delivery bookkeeping stored in the deliveries hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DeliveryRecord {
    message_id: String,
    tool_slug: ToolSlug,
    job_id: JobId,
    retry_count: u32,
    priority: i32,
    expire_in_secs: u64,
    enqueued_at: DateTime<Utc>,
    /// Stream entry id once appended; `None` while delayed
    stream_id: Option<String>,
}

impl DeliveryRecord {
    fn to_message(&self) -> QueueMessage {
        QueueMessage {
            id: self.message_id.clone(),
            tool_slug: self.tool_slug.clone(),
            job_id: self.job_id,
            retry_count: self.retry_count,
            priority: self.priority,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Redis key layout for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn stream(&self, slug: &ToolSlug) -> String {
        format!("{}:{}:stream", self.prefix, slug)
    }

    fn delayed(&self, slug: &ToolSlug) -> String {
        format!("{}:{}:delayed", self.prefix, slug)
    }

    fn live(&self, slug: &ToolSlug) -> String {
        format!("{}:{}:live", self.prefix, slug)
    }

    fn group(slug: &ToolSlug) -> String {
        format!("{slug}.workers")
    }

    fn deliveries(&self) -> String {
        format!("{}:deliveries", self.prefix)
    }

    fn slugs(&self) -> String {
        format!("{}:slugs", self.prefix)
    }

    fn expired(&self) -> String {
        format!("{}:expired", self.prefix)
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    keys: Keys,
    consumer: String,
    options: QueueOptions,
}

impl RedisStreamsJobQueue {
    /// Create a queue client.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Key prefix (default: "jobforge")
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
        options: QueueOptions,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            keys: Keys {
                prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            },
            consumer: format!("worker-{}", WorkerId::new()),
            options,
        })
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Ensure the slug's consumer group exists (idempotent).
    async fn ensure_group(&self, conn: &mut MultiplexedConnection, slug: &ToolSlug) {
        // BUSYGROUP when it already exists; ignored.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.keys.stream(slug))
            .arg(Keys::group(slug))
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        message_id: &str,
    ) -> QueueResult<Option<DeliveryRecord>> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.deliveries())
            .arg(message_id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("HGET failed: {e}")))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| QueueError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn save(
        &self,
        conn: &mut MultiplexedConnection,
        record: &DeliveryRecord,
    ) -> QueueResult<()> {
        let json =
            serde_json::to_string(record).map_err(|e| QueueError::Serialization(e.to_string()))?;

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.keys.deliveries())
            .arg(&record.message_id)
            .arg(json)
            .ignore()
            .cmd("HSET")
            .arg(self.keys.live(&record.tool_slug))
            .arg(record.job_id.to_string())
            .arg(&record.message_id)
            .ignore()
            .cmd("SADD")
            .arg(self.keys.slugs())
            .arg(record.tool_slug.as_str())
            .ignore()
            .query_async::<_, ()>(conn)
            .await
            .map_err(|e| QueueError::Command(format!("save delivery failed: {e}")))
    }

    /// Remove a delivery: stream entry, record, and live index entry when it
    /// still points at this delivery.
    async fn remove(
        &self,
        conn: &mut MultiplexedConnection,
        record: &DeliveryRecord,
    ) -> QueueResult<()> {
        let slug = &record.tool_slug;
        let mut pipe = redis::pipe();
        pipe.atomic();

        if let Some(stream_id) = &record.stream_id {
            pipe.cmd("XACK")
                .arg(self.keys.stream(slug))
                .arg(Keys::group(slug))
                .arg(stream_id)
                .ignore()
                .cmd("XDEL")
                .arg(self.keys.stream(slug))
                .arg(stream_id)
                .ignore();
        }
        pipe.cmd("ZREM")
            .arg(self.keys.delayed(slug))
            .arg(&record.message_id)
            .ignore()
            .cmd("HDEL")
            .arg(self.keys.deliveries())
            .arg(&record.message_id)
            .ignore();

        pipe.query_async::<_, ()>(conn)
            .await
            .map_err(|e| QueueError::Command(format!("remove delivery failed: {e}")))?;

        let live: Option<String> = redis::cmd("HGET")
            .arg(self.keys.live(slug))
            .arg(record.job_id.to_string())
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("HGET failed: {e}")))?;
        if live.as_deref() == Some(record.message_id.as_str()) {
            let _: u64 = redis::cmd("HDEL")
                .arg(self.keys.live(slug))
                .arg(record.job_id.to_string())
                .query_async(conn)
                .await
                .map_err(|e| QueueError::Command(format!("HDEL failed: {e}")))?;
        }
        Ok(())
    }

    /// Append a delivery to its stream and record the stream id.
    async fn append(
        &self,
        conn: &mut MultiplexedConnection,
        mut record: DeliveryRecord,
    ) -> QueueResult<DeliveryRecord> {
        let stream_id: String = redis::cmd("XADD")
            .arg(self.keys.stream(&record.tool_slug))
            .arg("*")
            .arg("message_id")
            .arg(&record.message_id)
            .arg("job_id")
            .arg(record.job_id.to_string())
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;

        record.stream_id = Some(stream_id);
        self.save(conn, &record).await?;
        Ok(record)
    }

    /// Store a new delivery, delayed until `visible_at` when in the future.
    async fn schedule(
        &self,
        conn: &mut MultiplexedConnection,
        record: DeliveryRecord,
        visible_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        if visible_at <= Utc::now() {
            self.append(conn, record).await?;
            return Ok(());
        }

        self.save(conn, &record).await?;
        let _: u64 = redis::cmd("ZADD")
            .arg(self.keys.delayed(&record.tool_slug))
            .arg(visible_at.timestamp_millis())
            .arg(&record.message_id)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("ZADD failed: {e}")))?;
        Ok(())
    }

    /// Move due delayed deliveries onto the stream.
    async fn promote_due(
        &self,
        conn: &mut MultiplexedConnection,
        slug: &ToolSlug,
    ) -> QueueResult<()> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.delayed(slug))
            .arg("-inf")
            .arg(Utc::now().timestamp_millis())
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("ZRANGEBYSCORE failed: {e}")))?;

        for message_id in due {
            // Only the instance that wins the ZREM appends.
            let removed: u64 = redis::cmd("ZREM")
                .arg(self.keys.delayed(slug))
                .arg(&message_id)
                .query_async(conn)
                .await
                .map_err(|e| QueueError::Command(format!("ZREM failed: {e}")))?;
            if removed == 0 {
                continue;
            }
            match self.load(conn, &message_id).await? {
                Some(record) => {
                    self.append(conn, record).await?;
                }
                None => debug!(message_id = %message_id, "Delayed delivery already removed"),
            }
        }
        Ok(())
    }

    /// Expire pending entries idle for longer than their delivery's expiry.
    async fn expire_overdue(
        &self,
        conn: &mut MultiplexedConnection,
        slug: &ToolSlug,
    ) -> QueueResult<()> {
        self.ensure_group(conn, slug).await;

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(self.keys.stream(slug))
            .arg(Keys::group(slug))
            .arg("-")
            .arg("+")
            .arg(PENDING_SCAN_LIMIT)
            .query_async(conn)
            .await
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;

        for (stream_id, _consumer, idle_ms, _deliveries) in pending {
            let entry: redis::Value = redis::cmd("XRANGE")
                .arg(self.keys.stream(slug))
                .arg(&stream_id)
                .arg(&stream_id)
                .query_async(conn)
                .await
                .map_err(|e| QueueError::Command(format!("XRANGE failed: {e}")))?;

            let Some(entry) = parse_stream_reply_entries(entry)?.into_iter().next() else {
                continue;
            };
            let Some(record) = self.load(conn, &entry.message_id).await? else {
                continue;
            };
            if idle_ms < record.expire_in_secs.saturating_mul(1000) {
                continue;
            }

            self.remove(conn, &record).await?;
            let expired = ExpiredDelivery {
                tool_slug: record.tool_slug.clone(),
                job_id: record.job_id,
                message_id: record.message_id.clone(),
            };
            let json = serde_json::to_string(&expired)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            let _: u64 = redis::cmd("RPUSH")
                .arg(self.keys.expired())
                .arg(json)
                .query_async(conn)
                .await
                .map_err(|e| QueueError::Command(format!("RPUSH failed: {e}")))?;

            warn!(
                tool_slug = %record.tool_slug,
                job_id = %record.job_id,
                message_id = %record.message_id,
                idle_ms,
                "Active delivery expired"
            );
        }
        Ok(())
    }

    async fn load_known(
        &self,
        conn: &mut MultiplexedConnection,
        slug: &ToolSlug,
        message_id: &str,
    ) -> QueueResult<DeliveryRecord> {
        self.load(conn, message_id)
            .await?
            .ok_or_else(|| QueueError::UnknownDelivery {
                tool_slug: slug.to_string(),
                message_id: message_id.to_string(),
            })
    }
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    #[instrument(skip(self, options), fields(tool_slug = %tool_slug, job_id = %job_id), err)]
    async fn enqueue(
        &self,
        tool_slug: &ToolSlug,
        job_id: JobId,
        options: EnqueueOptions,
    ) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        self.ensure_group(&mut conn, tool_slug).await;

        let record = DeliveryRecord {
            message_id: Uuid::now_v7().to_string(),
            tool_slug: tool_slug.clone(),
            job_id,
            retry_count: 0,
            priority: options.priority,
            expire_in_secs: options
                .expire_in
                .unwrap_or(self.options.default_expire_in)
                .as_secs(),
            enqueued_at: Utc::now(),
            stream_id: None,
        };
        let message_id = record.message_id.clone();
        self.schedule(&mut conn, record, options.start_after.unwrap_or_else(Utc::now))
            .await?;
        Ok(message_id)
    }

    #[instrument(skip(self), fields(tool_slug = %tool_slug, message_count), err)]
    async fn fetch(
        &self,
        tool_slug: &ToolSlug,
        batch_size: usize,
    ) -> QueueResult<Vec<QueueMessage>> {
        let mut conn = self.conn().await?;
        self.ensure_group(&mut conn, tool_slug).await;
        self.promote_due(&mut conn, tool_slug).await?;
        self.expire_overdue(&mut conn, tool_slug).await?;

        // XREADGROUP with ">" reads entries never delivered to this group.
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(Keys::group(tool_slug))
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(batch_size)
            .arg("STREAMS")
            .arg(self.keys.stream(tool_slug))
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        let mut messages = Vec::new();
        for entry in parse_read_group_reply(reply)? {
            match self.load(&mut conn, &entry.message_id).await? {
                Some(record) => messages.push(record.to_message()),
                None => {
                    // Acked or expired while queued; drop the orphan entry.
                    let _: u64 = redis::cmd("XACK")
                        .arg(self.keys.stream(tool_slug))
                        .arg(Keys::group(tool_slug))
                        .arg(&entry.stream_id)
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
                }
            }
        }

        tracing::Span::current().record("message_count", messages.len());
        Ok(messages)
    }

    #[instrument(skip(self), fields(tool_slug = %tool_slug, message_id = %message_id), err)]
    async fn touch(&self, tool_slug: &ToolSlug, message_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let Some(stream_id) = self
            .load(&mut conn, message_id)
            .await?
            .and_then(|record| record.stream_id)
        else {
            return Ok(false);
        };

        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(self.keys.stream(tool_slug))
            .arg(Keys::group(tool_slug))
            .arg(&self.consumer)
            .arg(0)
            .arg(&stream_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;
        Ok(!claimed.is_empty())
    }

    #[instrument(skip(self, result), fields(tool_slug = %tool_slug, message_id = %message_id), err)]
    async fn ack(
        &self,
        tool_slug: &ToolSlug,
        message_id: &str,
        result: &JsonValue,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let record = self.load_known(&mut conn, tool_slug, message_id).await?;
        self.remove(&mut conn, &record).await?;
        debug!(job_id = %record.job_id, result = %result, "Delivery acknowledged");
        Ok(())
    }

    #[instrument(skip(self), fields(tool_slug = %tool_slug, message_id = %message_id), err)]
    async fn fail(
        &self,
        tool_slug: &ToolSlug,
        message_id: &str,
        reason: &str,
    ) -> QueueResult<Redelivery> {
        let mut conn = self.conn().await?;
        let record = self.load_known(&mut conn, tool_slug, message_id).await?;
        self.remove(&mut conn, &record).await?;

        let retry_count = record.retry_count + 1;
        let Some(delay) = self.options.redelivery_delay(retry_count) else {
            warn!(job_id = %record.job_id, retry_count, "Queue retry limit reached");
            return Ok(Redelivery::Exhausted);
        };

        let next = DeliveryRecord {
            message_id: Uuid::now_v7().to_string(),
            retry_count,
            enqueued_at: Utc::now(),
            stream_id: None,
            ..record
        };
        let next_id = next.message_id.clone();
        let visible_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.schedule(&mut conn, next, visible_at).await?;

        debug!(
            next_message_id = %next_id,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Delivery rescheduled"
        );
        Ok(Redelivery::Scheduled {
            message_id: next_id,
            delay,
        })
    }

    #[instrument(skip(self), err)]
    async fn take_expired(&self) -> QueueResult<Vec<ExpiredDelivery>> {
        let mut conn = self.conn().await?;

        let slugs: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.slugs())
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("SMEMBERS failed: {e}")))?;
        for slug in slugs {
            match ToolSlug::new(slug) {
                Ok(slug) => self.expire_overdue(&mut conn, &slug).await?,
                Err(e) => warn!(error = %e, "Skipping invalid slug in queue registry"),
            }
        }

        let (raw,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(self.keys.expired())
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(self.keys.expired())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("drain expired failed: {e}")))?;

        raw.iter()
            .map(|json| {
                serde_json::from_str(json).map_err(|e| QueueError::Serialization(e.to_string()))
            })
            .collect()
    }

    #[instrument(skip(self), fields(tool_slug = %tool_slug, job_id = %job_id), err)]
    async fn has_live_delivery(&self, tool_slug: &ToolSlug, job_id: JobId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let exists: bool = redis::cmd("HEXISTS")
            .arg(self.keys.live(tool_slug))
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(format!("HEXISTS failed: {e}")))?;
        Ok(exists)
    }
}

/// Stream entry fields this queue writes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    stream_id: String,
    message_id: String,
}

/// Parse an `XREADGROUP` reply: `[[stream_key, [entry, ...]], ...]`, or nil
/// when nothing is ready.
fn parse_read_group_reply(reply: redis::Value) -> QueueResult<Vec<StreamEntry>> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(streams) => streams,
        _ => return Err(QueueError::Serialization("Invalid XREADGROUP reply".to_string())),
    };

    let mut entries = Vec::new();
    for stream in streams {
        let redis::Value::Bulk(mut parts) = stream else {
            return Err(QueueError::Serialization("Invalid stream reply".to_string()));
        };
        if parts.len() < 2 {
            return Err(QueueError::Serialization("Stream reply too short".to_string()));
        }
        entries.extend(parse_stream_reply_entries(parts.swap_remove(1))?);
    }
    Ok(entries)
}

/// Parse a list of entries: `[[id, [field, value, ...]], ...]`.
fn parse_stream_reply_entries(reply: redis::Value) -> QueueResult<Vec<StreamEntry>> {
    let items = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(items) => items,
        _ => return Err(QueueError::Serialization("Invalid entry list".to_string())),
    };
    items.into_iter().map(parse_stream_entry).collect()
}

fn parse_stream_entry(entry: redis::Value) -> QueueResult<StreamEntry> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(QueueError::Serialization("Invalid entry format".to_string()));
    };
    let [redis::Value::Data(id), redis::Value::Bulk(raw_fields)] = parts.as_slice() else {
        return Err(QueueError::Serialization("Invalid entry layout".to_string()));
    };

    let mut fields = HashMap::new();
    for chunk in raw_fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            fields.insert(
                String::from_utf8_lossy(key).to_string(),
                String::from_utf8_lossy(value).to_string(),
            );
        }
    }

    let message_id = fields
        .remove("message_id")
        .ok_or_else(|| QueueError::Serialization("Missing message_id field".to_string()))?;

    Ok(StreamEntry {
        stream_id: String::from_utf8_lossy(id).to_string(),
        message_id,
    })
}
