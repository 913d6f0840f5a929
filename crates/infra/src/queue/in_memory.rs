use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use jobforge_core::{JobId, ToolSlug};

use super::{
    EnqueueOptions, ExpiredDelivery, JobQueue, QueueError, QueueMessage, QueueOptions,
    QueueResult, Redelivery,
};

/// Acknowledged results kept for `ack_result`; older entries are dropped.
const ACK_HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Queued { visible_at: DateTime<Utc> },
    Active { since: DateTime<Utc> },
}

#[derive(Debug, Clone)]
struct Delivery {
    message: QueueMessage,
    seq: u64,
    expire_in: Duration,
    state: DeliveryState,
}

#[derive(Debug, Default)]
struct State {
    /// tool slug -> message id -> delivery
    deliveries: HashMap<ToolSlug, HashMap<String, Delivery>>,
    expired: Vec<ExpiredDelivery>,
    /// Most recent acknowledged results, oldest first
    acked: VecDeque<(String, JsonValue)>,
    seq: u64,
}

/// In-memory queue for tests/dev.
///
/// Ready deliveries are handed out by priority (highest first), then in
/// enqueue order.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    options: QueueOptions,
    state: Mutex<State>,
    reject_enqueue: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: QueueOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent `enqueue` fail until switched off again.
    pub fn set_reject_enqueue(&self, reject: bool) {
        self.reject_enqueue.store(reject, Ordering::SeqCst);
    }

    /// Result recorded by `ack` for `message_id`, while it is among the last
    /// few hundred acknowledgements.
    pub fn ack_result(&self, message_id: &str) -> Option<JsonValue> {
        self.lock()
            .ok()?
            .acked
            .iter()
            .rev()
            .find(|(id, _)| id == message_id)
            .map(|(_, result)| result.clone())
    }

    /// Number of deliveries (queued or active) for `tool_slug`.
    pub fn depth(&self, tool_slug: &ToolSlug) -> usize {
        self.lock()
            .map(|s| s.deliveries.get(tool_slug).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| QueueError::Connection("queue state lock poisoned".to_string()))
    }

    fn push(
        &self,
        state: &mut State,
        tool_slug: &ToolSlug,
        job_id: JobId,
        retry_count: u32,
        priority: i32,
        visible_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> String {
        state.seq += 1;
        let id = Uuid::now_v7().to_string();
        let delivery = Delivery {
            message: QueueMessage {
                id: id.clone(),
                tool_slug: tool_slug.clone(),
                job_id,
                retry_count,
                priority,
                enqueued_at: Utc::now(),
            },
            seq: state.seq,
            expire_in,
            state: DeliveryState::Queued { visible_at },
        };
        state
            .deliveries
            .entry(tool_slug.clone())
            .or_default()
            .insert(id.clone(), delivery);
        id
    }
}

/// Drop active deliveries older than their expiry, recording them once.
fn expire_overdue(state: &mut State, now: DateTime<Utc>) {
    let State {
        deliveries, expired, ..
    } = state;

    for (slug, queue) in deliveries.iter_mut() {
        queue.retain(|id, delivery| {
            let DeliveryState::Active { since } = delivery.state else {
                return true;
            };
            let overdue = chrono::Duration::from_std(delivery.expire_in)
                .ok()
                .and_then(|d| since.checked_add_signed(d))
                .is_some_and(|deadline| deadline <= now);
            if overdue {
                expired.push(ExpiredDelivery {
                    tool_slug: slug.clone(),
                    job_id: delivery.message.job_id,
                    message_id: id.clone(),
                });
            }
            !overdue
        });
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        tool_slug: &ToolSlug,
        job_id: JobId,
        options: EnqueueOptions,
    ) -> QueueResult<String> {
        if self.reject_enqueue.load(Ordering::SeqCst) {
            return Err(QueueError::Rejected(format!(
                "enqueue disabled for tool {tool_slug}"
            )));
        }

        let visible_at = options.start_after.unwrap_or_else(Utc::now);
        let expire_in = options.expire_in.unwrap_or(self.options.default_expire_in);
        let mut state = self.lock()?;
        Ok(self.push(
            &mut state,
            tool_slug,
            job_id,
            0,
            options.priority,
            visible_at,
            expire_in,
        ))
    }

    async fn fetch(
        &self,
        tool_slug: &ToolSlug,
        batch_size: usize,
    ) -> QueueResult<Vec<QueueMessage>> {
        let now = Utc::now();
        let mut state = self.lock()?;
        expire_overdue(&mut state, now);

        let Some(queue) = state.deliveries.get_mut(tool_slug) else {
            return Ok(Vec::new());
        };

        let mut ready: Vec<&mut Delivery> = queue
            .values_mut()
            .filter(|d| {
                matches!(d.state, DeliveryState::Queued { visible_at } if visible_at <= now)
            })
            .collect();
        ready.sort_by(|a, b| {
            b.message
                .priority
                .cmp(&a.message.priority)
                .then(a.seq.cmp(&b.seq))
        });

        Ok(ready
            .into_iter()
            .take(batch_size)
            .map(|delivery| {
                delivery.state = DeliveryState::Active { since: now };
                delivery.message.clone()
            })
            .collect())
    }

    async fn touch(&self, tool_slug: &ToolSlug, message_id: &str) -> QueueResult<bool> {
        let now = Utc::now();
        let mut state = self.lock()?;
        expire_overdue(&mut state, now);

        let Some(delivery) = state
            .deliveries
            .get_mut(tool_slug)
            .and_then(|queue| queue.get_mut(message_id))
        else {
            return Ok(false);
        };
        match delivery.state {
            DeliveryState::Active { .. } => {
                delivery.state = DeliveryState::Active { since: now };
                Ok(true)
            }
            DeliveryState::Queued { .. } => Ok(false),
        }
    }

    async fn ack(
        &self,
        tool_slug: &ToolSlug,
        message_id: &str,
        result: &JsonValue,
    ) -> QueueResult<()> {
        let mut state = self.lock()?;
        let removed = state
            .deliveries
            .get_mut(tool_slug)
            .and_then(|queue| queue.remove(message_id));
        if removed.is_none() {
            return Err(QueueError::UnknownDelivery {
                tool_slug: tool_slug.to_string(),
                message_id: message_id.to_string(),
            });
        }
        if state.acked.len() == ACK_HISTORY_LIMIT {
            state.acked.pop_front();
        }
        state.acked.push_back((message_id.to_string(), result.clone()));
        Ok(())
    }

    async fn fail(
        &self,
        tool_slug: &ToolSlug,
        message_id: &str,
        _reason: &str,
    ) -> QueueResult<Redelivery> {
        let mut state = self.lock()?;
        let delivery = state
            .deliveries
            .get_mut(tool_slug)
            .and_then(|queue| queue.remove(message_id))
            .ok_or_else(|| QueueError::UnknownDelivery {
                tool_slug: tool_slug.to_string(),
                message_id: message_id.to_string(),
            })?;

        let retry_count = delivery.message.retry_count + 1;
        let Some(delay) = self.options.redelivery_delay(retry_count) else {
            return Ok(Redelivery::Exhausted);
        };

        let visible_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let message_id = self.push(
            &mut state,
            tool_slug,
            delivery.message.job_id,
            retry_count,
            delivery.message.priority,
            visible_at,
            delivery.expire_in,
        );
        Ok(Redelivery::Scheduled { message_id, delay })
    }

    async fn take_expired(&self) -> QueueResult<Vec<ExpiredDelivery>> {
        let mut state = self.lock()?;
        expire_overdue(&mut state, Utc::now());
        Ok(std::mem::take(&mut state.expired))
    }

    async fn has_live_delivery(&self, tool_slug: &ToolSlug, job_id: JobId) -> QueueResult<bool> {
        let state = self.lock()?;
        Ok(state
            .deliveries
            .get(tool_slug)
            .is_some_and(|queue| queue.values().any(|d| d.message.job_id == job_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::RetryPolicy;
    use serde_json::json;

    fn slug() -> ToolSlug {
        ToolSlug::new("text-summary").unwrap()
    }

    fn set_active_since(queue: &InMemoryJobQueue, message_id: &str, since: DateTime<Utc>) {
        let mut state = queue.lock().unwrap();
        let delivery = state
            .deliveries
            .get_mut(&slug())
            .and_then(|q| q.get_mut(message_id))
            .unwrap();
        delivery.state = DeliveryState::Active { since };
    }

    #[tokio::test]
    async fn fetch_orders_by_priority_then_fifo() {
        let queue = InMemoryJobQueue::new();
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        queue.enqueue(&slug(), a, EnqueueOptions::default()).await.unwrap();
        queue.enqueue(&slug(), b, EnqueueOptions::default()).await.unwrap();
        queue
            .enqueue(&slug(), c, EnqueueOptions { priority: 5, ..Default::default() })
            .await
            .unwrap();

        let batch = queue.fetch(&slug(), 2).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.job_id).collect::<Vec<_>>(), vec![c, a]);

        // Active deliveries are not handed out twice.
        let rest = queue.fetch(&slug(), 10).await.unwrap();
        assert_eq!(rest.iter().map(|m| m.job_id).collect::<Vec<_>>(), vec![b]);
    }

    #[tokio::test]
    async fn delayed_delivery_is_not_ready() {
        let queue = InMemoryJobQueue::new();
        let job_id = JobId::new();
        let options = EnqueueOptions {
            start_after: Some(Utc::now() + chrono::Duration::minutes(5)),
            ..Default::default()
        };
        queue.enqueue(&slug(), job_id, options).await.unwrap();

        assert!(queue.fetch(&slug(), 5).await.unwrap().is_empty());
        assert!(queue.has_live_delivery(&slug(), job_id).await.unwrap());
    }

    #[tokio::test]
    async fn fail_redelivers_under_new_id_until_limit() {
        let queue = InMemoryJobQueue::with_options(QueueOptions {
            retry_limit: 1,
            backoff: RetryPolicy::fixed(3, Duration::ZERO),
            ..Default::default()
        });
        let job_id = JobId::new();
        let first = queue.enqueue(&slug(), job_id, EnqueueOptions::default()).await.unwrap();
        queue.fetch(&slug(), 1).await.unwrap();

        let Redelivery::Scheduled { message_id, delay } =
            queue.fail(&slug(), &first, "boom").await.unwrap()
        else {
            panic!("expected a redelivery");
        };
        assert_ne!(message_id, first);
        assert_eq!(delay, Duration::ZERO);

        let batch = queue.fetch(&slug(), 1).await.unwrap();
        assert_eq!(batch[0].id, message_id);
        assert_eq!(batch[0].retry_count, 1);

        assert_eq!(
            queue.fail(&slug(), &message_id, "boom").await.unwrap(),
            Redelivery::Exhausted
        );
        assert!(!queue.has_live_delivery(&slug(), job_id).await.unwrap());
    }

    #[tokio::test]
    async fn ack_removes_delivery_and_keeps_result() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(&slug(), JobId::new(), EnqueueOptions::default()).await.unwrap();
        queue.fetch(&slug(), 1).await.unwrap();

        queue.ack(&slug(), &id, &json!({"success": true})).await.unwrap();
        assert_eq!(queue.depth(&slug()), 0);
        assert_eq!(queue.ack_result(&id), Some(json!({"success": true})));

        assert!(matches!(
            queue.ack(&slug(), &id, &json!({})).await,
            Err(QueueError::UnknownDelivery { .. })
        ));
    }

    #[tokio::test]
    async fn overdue_active_delivery_is_reported_once() {
        let queue = InMemoryJobQueue::new();
        let job_id = JobId::new();
        let options = EnqueueOptions {
            expire_in: Some(Duration::ZERO),
            ..Default::default()
        };
        let id = queue.enqueue(&slug(), job_id, options).await.unwrap();
        queue.fetch(&slug(), 1).await.unwrap();

        let expired = queue.take_expired().await.unwrap();
        assert_eq!(
            expired,
            vec![ExpiredDelivery { tool_slug: slug(), job_id, message_id: id }]
        );
        assert!(queue.take_expired().await.unwrap().is_empty());
        assert!(!queue.has_live_delivery(&slug(), job_id).await.unwrap());
    }

    #[tokio::test]
    async fn touch_restarts_expiry_clock() {
        let queue = InMemoryJobQueue::new();
        let job_id = JobId::new();
        let options = EnqueueOptions {
            expire_in: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let id = queue.enqueue(&slug(), job_id, options).await.unwrap();
        queue.fetch(&slug(), 1).await.unwrap();

        // Waited 50s in the fetched batch before its turn came.
        let fetched_at = Utc::now() - chrono::Duration::seconds(50);
        set_active_since(&queue, &id, fetched_at);
        assert!(queue.touch(&slug(), &id).await.unwrap());

        let mut state = queue.lock().unwrap();
        expire_overdue(&mut state, fetched_at + chrono::Duration::seconds(70));
        assert!(state.expired.is_empty());

        expire_overdue(&mut state, Utc::now() + chrono::Duration::seconds(61));
        assert_eq!(state.expired.len(), 1);
    }

    #[tokio::test]
    async fn touch_reports_missing_or_queued_delivery() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(&slug(), JobId::new(), EnqueueOptions::default()).await.unwrap();

        assert!(!queue.touch(&slug(), &id).await.unwrap());
        queue.fetch(&slug(), 1).await.unwrap();
        queue.ack(&slug(), &id, &json!(null)).await.unwrap();
        assert!(!queue.touch(&slug(), &id).await.unwrap());
    }

    #[tokio::test]
    async fn ack_history_is_bounded() {
        let queue = InMemoryJobQueue::new();
        let mut ids = Vec::new();
        for n in 0..=ACK_HISTORY_LIMIT {
            let id = queue
                .enqueue(&slug(), JobId::new(), EnqueueOptions::default())
                .await
                .unwrap();
            queue.fetch(&slug(), 1).await.unwrap();
            queue.ack(&slug(), &id, &json!({"n": n})).await.unwrap();
            ids.push(id);
        }

        assert_eq!(queue.lock().unwrap().acked.len(), ACK_HISTORY_LIMIT);
        assert_eq!(queue.ack_result(&ids[0]), None);
        assert_eq!(
            queue.ack_result(&ids[ACK_HISTORY_LIMIT]),
            Some(json!({"n": ACK_HISTORY_LIMIT}))
        );
    }

    #[tokio::test]
    async fn rejected_enqueue() {
        let queue = InMemoryJobQueue::new();
        queue.set_reject_enqueue(true);
        assert!(matches!(
            queue.enqueue(&slug(), JobId::new(), EnqueueOptions::default()).await,
            Err(QueueError::Rejected(_))
        ));

        queue.set_reject_enqueue(false);
        assert!(queue.enqueue(&slug(), JobId::new(), EnqueueOptions::default()).await.is_ok());
    }
}
