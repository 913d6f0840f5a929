use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use jobforge_core::{DomainError, Job, JobId, ToolInput, ToolSlug};

use crate::queue::{EnqueueOptions, JobQueue};
use crate::store::{JobRecordStore, StoreError};

/// Per-job submission options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Higher runs first where the queue supports it.
    pub priority: i32,
    pub start_after: Option<DateTime<Utc>>,
    /// Queue-side expiry of the active delivery.
    pub expire_in: Option<Duration>,
    /// Attempt budget; the configured retry limit when `None`.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid job input: {0}")]
    InvalidInput(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creates job records and enqueues them.
#[derive(Clone)]
pub struct JobSubmitter {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn JobQueue>,
    default_max_attempts: u32,
    retention: Duration,
}

impl JobSubmitter {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn JobQueue>,
        default_max_attempts: u32,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            default_max_attempts,
            retention,
        }
    }

    /// Validate `input`, persist a `Pending` record, then enqueue it.
    ///
    /// The record is the commit point: when enqueueing fails the job id is
    /// still returned and the record waits for orphan repair.
    #[instrument(skip(self, input, options), fields(tool_slug = %tool_slug, job_id), err)]
    pub async fn submit(
        &self,
        tool_slug: &str,
        input: JsonValue,
        options: SubmitOptions,
    ) -> Result<JobId, SubmitError> {
        let slug = ToolSlug::new(tool_slug)?;
        let input = ToolInput::from_parts(&slug, input)?;

        let mut job = Job::new(slug.clone(), input)
            .with_max_attempts(options.max_attempts.unwrap_or(self.default_max_attempts))
            .with_priority(options.priority);
        if let Some(at) = options.start_after {
            job = job.process_after(at);
        }
        if let Some(deadline) = self.deadline(options.start_after) {
            job = job.expires_at(deadline);
        }
        tracing::Span::current().record("job_id", tracing::field::display(job.id));

        self.store.insert(&job).await?;

        let enqueue = EnqueueOptions {
            priority: options.priority,
            start_after: options.start_after,
            expire_in: options.expire_in,
        };
        match self.queue.enqueue(&slug, job.id, enqueue).await {
            Ok(message_id) => {
                info!(job_id = %job.id, message_id = %message_id, "Job submitted");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Enqueue failed; job left pending for repair");
            }
        }
        Ok(job.id)
    }

    fn deadline(&self, start_after: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let from = start_after.map_or_else(Utc::now, |at| at.max(Utc::now()));
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|d| from.checked_add_signed(d))
    }
}
