//! Per-tool worker poller.
//!
//! Each cycle fetches a batch from the tool's queue and processes it
//! sequentially:
//!
//! 1. restart the delivery's expiry clock, then claim the job (duplicates
//!    are acknowledged as no-ops)
//! 2. resolve the processor (unknown tool fails the job permanently)
//! 3. run it under the timeout guard
//! 4. write the result through the claim's epoch guard
//! 5. acknowledge, or fail the delivery so the queue retries it
//!
//! Nothing a processor does escapes the loop; failures end up on the record.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobforge_core::{JobStatus, RetryDecision, RetryPolicy, ToolSlug};

use crate::queue::{JobQueue, QueueError, QueueMessage, Redelivery};
use crate::store::{ClaimGrant, JobRecordStore, JobUpdate, StoreError, UpdateGuard};

use super::claim::{ClaimProtocol, ClaimResult};
use super::registry::ProcessorRegistry;
use super::timeout::TimeoutGuard;

/// Tries per guarded record write before the store counts as unavailable.
const STORE_WRITE_ATTEMPTS: u32 = 3;

/// Result of a guarded record write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Write {
    Applied,
    /// The claim no longer matches the record.
    ClaimLost,
    /// The store kept failing.
    Unavailable,
}

/// Result of handling one delivery; also the payload passed to `ack`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn succeeded(output: JsonValue) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Duplicate delivery of a job that is no longer `Pending`.
    pub fn skipped() -> Self {
        Self {
            success: true,
            output: None,
            error: None,
        }
    }

    fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Poller runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub batch_size: usize,
    /// Sleep after a poll that returned nothing
    pub poll_interval: Duration,
    pub timeout: TimeoutGuard,
    pub retry: RetryPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            poll_interval: Duration::from_secs(2),
            timeout: TimeoutGuard::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Handle to a running poller.
#[derive(Debug)]
pub struct PollerHandle {
    tool_slug: ToolSlug,
    shutdown: CancellationToken,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<PollerStats>>,
}

impl PollerHandle {
    pub fn tool_slug(&self) -> &ToolSlug {
        &self.tool_slug
    }

    /// Stop polling and wait for the in-flight batch to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(tool_slug = %self.tool_slug, error = %e, "Poller task failed");
            }
        }
    }

    pub fn stats(&self) -> PollerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Poller for one tool slug.
#[derive(Clone)]
pub struct ToolPoller {
    tool_slug: ToolSlug,
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn JobQueue>,
    claims: ClaimProtocol,
    registry: Arc<ProcessorRegistry>,
    config: PollerConfig,
    stats: Arc<Mutex<PollerStats>>,
}

impl ToolPoller {
    pub fn new(
        tool_slug: ToolSlug,
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<ProcessorRegistry>,
        config: PollerConfig,
    ) -> Self {
        Self {
            tool_slug,
            claims: ClaimProtocol::new(store.clone()),
            store,
            queue,
            registry,
            config,
            stats: Arc::new(Mutex::new(PollerStats::default())),
        }
    }

    pub fn tool_slug(&self) -> &ToolSlug {
        &self.tool_slug
    }

    pub fn stats(&self) -> PollerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spawn the polling loop; it runs until `shutdown` fires or the handle
    /// is shut down.
    pub fn spawn(self, shutdown: CancellationToken) -> PollerHandle {
        let tool_slug = self.tool_slug.clone();
        let stats = self.stats.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });

        PollerHandle {
            tool_slug,
            shutdown,
            join: Some(join),
            stats,
        }
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(tool_slug = %self.tool_slug, batch_size = self.config.batch_size, "Poller started");

        while !shutdown.is_cancelled() {
            let fetched = match self.poll_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(tool_slug = %self.tool_slug, error = %e, "Queue fetch failed");
                    0
                }
            };

            if fetched == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(tool_slug = %self.tool_slug, "Poller stopped");
    }

    /// Fetch one batch and process it. Returns the number of deliveries
    /// handled.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let batch = self
            .queue
            .fetch(&self.tool_slug, self.config.batch_size)
            .await?;
        for message in &batch {
            self.process_message(message).await;
        }
        Ok(batch.len())
    }

    /// Handle one delivery end to end.
    pub async fn process_message(&self, message: &QueueMessage) -> JobOutcome {
        self.record(|s| s.processed += 1);

        // Earlier jobs in the batch used up part of the delivery's expiry.
        match self.queue.touch(&self.tool_slug, &message.id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    job_id = %message.job_id,
                    message_id = %message.id,
                    "Delivery gone before processing; skipping"
                );
                self.record(|s| s.skipped += 1);
                return JobOutcome::skipped();
            }
            Err(e) => {
                warn!(
                    job_id = %message.job_id,
                    message_id = %message.id,
                    error = %e,
                    "Failed to refresh delivery"
                );
            }
        }

        let claim = match self.claims.claim(message.job_id, &message.id).await {
            Ok(claim) => claim,
            Err(e) => {
                // Delivery stays active; queue expiry and the sweep take over.
                error!(
                    job_id = %message.job_id,
                    message_id = %message.id,
                    error = %e,
                    "Claim failed"
                );
                return JobOutcome::failed(format!("claim failed: {e}"));
            }
        };

        match claim {
            ClaimResult::NotFound => {
                warn!(
                    job_id = %message.job_id,
                    message_id = %message.id,
                    "Delivery for unknown job"
                );
                let outcome = JobOutcome::failed(format!("Job not found: {}", message.job_id));
                self.ack(message, &outcome).await;
                self.record(|s| s.failed += 1);
                outcome
            }
            ClaimResult::AlreadyHandled(status) => {
                debug!(
                    job_id = %message.job_id,
                    status = %status,
                    "Duplicate delivery; acknowledging"
                );
                let outcome = JobOutcome::skipped();
                self.ack(message, &outcome).await;
                self.record(|s| s.skipped += 1);
                outcome
            }
            ClaimResult::Claimed { grant, job } => {
                debug!(
                    job_id = %job.id,
                    tool_slug = %job.tool_slug,
                    attempts = grant.attempts,
                    max_attempts = grant.max_attempts,
                    "Job claimed"
                );

                let Some(processor) = self.registry.get(&job.tool_slug) else {
                    let error = format!("No processor registered for tool: {}", job.tool_slug);
                    warn!(job_id = %job.id, "{}", error);
                    self.write(&grant, JobUpdate::failed(&error)).await;
                    let outcome = JobOutcome::failed(error);
                    self.ack(message, &outcome).await;
                    self.record(|s| s.failed += 1);
                    return outcome;
                };

                match self.config.timeout.run(processor, job).await {
                    Ok(output) => self.complete(message, &grant, output).await,
                    Err(failure) => {
                        self.handle_failure(message, &grant, failure.to_string())
                            .await
                    }
                }
            }
        }
    }

    async fn complete(
        &self,
        message: &QueueMessage,
        grant: &ClaimGrant,
        output: JsonValue,
    ) -> JobOutcome {
        // A failed write is logged; the ack stands.
        self.write(grant, JobUpdate::completed(output.clone())).await;
        let outcome = JobOutcome::succeeded(output);
        self.ack(message, &outcome).await;
        self.record(|s| s.succeeded += 1);
        info!(job_id = %grant.job_id, attempts = grant.attempts, "Job completed");
        outcome
    }

    async fn handle_failure(
        &self,
        message: &QueueMessage,
        grant: &ClaimGrant,
        error: String,
    ) -> JobOutcome {
        let outcome = JobOutcome::failed(error.clone());

        match self.config.retry.decide(grant.attempts, grant.max_attempts) {
            RetryDecision::Fail => {
                self.write(grant, JobUpdate::failed(&error)).await;
                self.ack(message, &outcome).await;
                self.record(|s| s.failed += 1);
                warn!(
                    job_id = %grant.job_id,
                    attempts = grant.attempts,
                    error = %error,
                    "Job failed permanently"
                );
            }
            RetryDecision::Requeue { delay } => {
                match self.write(grant, JobUpdate::retry(&error)).await {
                    Write::Applied => self.reschedule(message, grant, &error, delay).await,
                    Write::ClaimLost => self.ack(message, &outcome).await,
                    Write::Unavailable => self.release(message, grant, &error).await,
                }
            }
        }
        outcome
    }

    async fn reschedule(
        &self,
        message: &QueueMessage,
        grant: &ClaimGrant,
        error: &str,
        delay: Duration,
    ) {
        match self.queue.fail(&self.tool_slug, &message.id, error).await {
            Ok(Redelivery::Scheduled { message_id, delay }) => {
                self.record(|s| s.retried += 1);
                info!(
                    job_id = %grant.job_id,
                    attempts = grant.attempts,
                    next_message_id = %message_id,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job scheduled for retry"
                );
            }
            Ok(Redelivery::Exhausted) => {
                let pending = UpdateGuard {
                    status: JobStatus::Pending,
                    attempts: grant.attempts,
                    queue_message_id: Some(grant.message_id.clone()),
                };
                let reason = format!("{error} (queue retry limit reached)");
                if let Err(e) = self
                    .store
                    .update_if(grant.job_id, &pending, JobUpdate::failed(reason))
                    .await
                {
                    error!(
                        job_id = %grant.job_id,
                        error = %e,
                        "Failed to record exhausted retries"
                    );
                }
                self.record(|s| s.failed += 1);
            }
            Err(e) => {
                // The record is Pending; orphan repair re-enqueues it.
                error!(
                    job_id = %grant.job_id,
                    message_id = %message.id,
                    planned_delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to reschedule delivery"
                );
                self.record(|s| s.retried += 1);
            }
        }
    }

    /// Hand the delivery back to the queue without touching the record. The
    /// record is still `Processing`; the stuck sweep settles it if the store
    /// stays down.
    async fn release(&self, message: &QueueMessage, grant: &ClaimGrant, error: &str) {
        match self.queue.fail(&self.tool_slug, &message.id, error).await {
            Ok(_) => self.record(|s| s.retried += 1),
            Err(e) => error!(
                job_id = %grant.job_id,
                message_id = %message.id,
                error = %e,
                "Failed to release delivery"
            ),
        }
    }

    /// Epoch-guarded write, retried briefly on store errors.
    async fn write(&self, grant: &ClaimGrant, update: JobUpdate) -> Write {
        let guard = grant.guard();
        let mut last_error: Option<StoreError> = None;

        for attempt in 1..=STORE_WRITE_ATTEMPTS {
            match self.store.update_if(grant.job_id, &guard, update.clone()).await {
                Ok(true) => return Write::Applied,
                Ok(false) => {
                    warn!(
                        job_id = %grant.job_id,
                        attempts = grant.attempts,
                        "Claim lost before result was written; discarding"
                    );
                    return Write::ClaimLost;
                }
                Err(e) => {
                    debug!(job_id = %grant.job_id, attempt, error = %e, "Record write failed");
                    last_error = Some(e);
                    if attempt < STORE_WRITE_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    }
                }
            }
        }

        if let Some(e) = last_error {
            error!(job_id = %grant.job_id, error = %e, "Failed to persist job result");
        }
        Write::Unavailable
    }

    async fn ack(&self, message: &QueueMessage, outcome: &JobOutcome) {
        if let Err(e) = self
            .queue
            .ack(&self.tool_slug, &message.id, &outcome.to_value())
            .await
        {
            warn!(job_id = %message.job_id, message_id = %message.id, error = %e, "Ack failed");
        }
    }

    fn record(&self, f: impl FnOnce(&mut PollerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
