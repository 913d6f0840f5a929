//! Job record store: the durable, authoritative copy of every job.
//!
//! ## Components
//!
//! - `JobRecordStore`: async adapter trait used by the orchestrator
//! - `InMemoryJobRecordStore`: tests/dev
//! - `PostgresJobRecordStore`: durable storage (sqlx)
//!
//! All status writes refuse to leave a terminal state. Writes made after a
//! claim go through [`JobRecordStore::update_if`] with the [`UpdateGuard`]
//! the claim produced, so a worker that lost its claim cannot overwrite the
//! record.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use jobforge_core::{DomainError, Job, JobId, JobStatus};

pub use in_memory::InMemoryJobRecordStore;
pub use postgres::PostgresJobRecordStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        StoreError::InvalidRecord(value.to_string())
    }
}

/// Result of a successful claim, returned atomically with the transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimGrant {
    pub job_id: JobId,
    pub message_id: String,
    /// `attempts` after the claim's increment
    pub attempts: u32,
    pub max_attempts: u32,
}

impl ClaimGrant {
    /// Guard matching exactly this claim (the claim epoch).
    pub fn guard(&self) -> UpdateGuard {
        UpdateGuard {
            status: JobStatus::Processing,
            attempts: self.attempts,
            queue_message_id: Some(self.message_id.clone()),
        }
    }
}

/// Expected record state for a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateGuard {
    pub status: JobStatus,
    pub attempts: u32,
    pub queue_message_id: Option<String>,
}

impl UpdateGuard {
    /// Guard matching the state of a previously read record.
    pub fn observed(job: &Job) -> Self {
        Self {
            status: job.status,
            attempts: job.attempts,
            queue_message_id: job.queue_message_id.clone(),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        job.status == self.status
            && job.attempts == self.attempts
            && job.queue_message_id == self.queue_message_id
    }
}

/// Partial field update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    /// Clear a previously recorded error (takes precedence over `error`).
    pub clear_error: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn completed(output: JsonValue) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            output: Some(output),
            clear_error: true,
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Back to `Pending` for another attempt; `attempts` is left as claimed.
    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn expired(reason: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Expired),
            error: Some(reason.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Apply to an in-memory record. Returns `false` when the record is
    /// terminal or the status change is not a state machine edge.
    pub fn apply_to(&self, job: &mut Job) -> bool {
        if job.status.is_terminal() {
            return false;
        }
        if let Some(next) = self.status {
            if next != job.status && !job.status.can_transition_to(next) {
                return false;
            }
            job.status = next;
        }
        if let Some(output) = &self.output {
            job.output = Some(output.clone());
        }
        if self.clear_error {
            job.error = None;
        } else if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        job.updated_at = Utc::now();
        true
    }
}

/// Durable job record store.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Persist a new `Pending` job.
    async fn insert(&self, job: &Job) -> StoreResult<()>;

    /// Atomically move `job_id` from `Pending` to `Processing`, increment
    /// `attempts`, stamp `started_at` and `queue_message_id`.
    ///
    /// Returns `None` when the record is missing or not `Pending`; callers
    /// re-read to tell the two apart.
    async fn claim(&self, job_id: JobId, message_id: &str) -> StoreResult<Option<ClaimGrant>>;

    async fn find_by_id(&self, job_id: JobId) -> StoreResult<Option<Job>>;

    /// Unconditional update (still refuses to leave a terminal state).
    ///
    /// Returns `false` when the record is terminal.
    async fn update(&self, job_id: JobId, update: JobUpdate) -> StoreResult<bool>;

    /// Update only while the record still matches `guard`.
    async fn update_if(&self, job_id: JobId, guard: &UpdateGuard, update: JobUpdate)
    -> StoreResult<bool>;

    /// `Processing` jobs whose `started_at` is older than `threshold`.
    async fn find_stuck_processing(&self, threshold: Duration) -> StoreResult<Vec<Job>>;

    /// `Pending` jobs not touched for at least `age`, oldest first.
    async fn find_pending_older_than(&self, age: Duration, limit: usize) -> StoreResult<Vec<Job>>;

    /// Non-terminal jobs whose `expires_at` is before `now`.
    async fn find_past_deadline(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>>;
}

pub(crate) fn cutoff(threshold: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(threshold)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{ToolInput, ToolSlug};
    use serde_json::json;

    fn job() -> Job {
        Job::new(ToolSlug::new("unknown-tool").unwrap(), ToolInput::Opaque(json!({})))
    }

    #[test]
    fn apply_refuses_terminal_records() {
        let mut job = job();
        job.status = JobStatus::Completed;
        assert!(!JobUpdate::failed("late").apply_to(&mut job));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn apply_refuses_non_edges() {
        let mut job = job();
        assert!(!JobUpdate::completed(json!({})).apply_to(&mut job));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn completion_clears_previous_error() {
        let mut job = job();
        job.status = JobStatus::Processing;
        job.error = Some("first attempt failed".to_string());

        assert!(JobUpdate::completed(json!({"ok": true})).apply_to(&mut job));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert_eq!(job.output, Some(json!({"ok": true})));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn claim_guard_requires_same_epoch() {
        let mut job = job();
        job.status = JobStatus::Processing;
        job.attempts = 2;
        job.queue_message_id = Some("m-2".to_string());

        let grant = ClaimGrant {
            job_id: job.id,
            message_id: "m-2".to_string(),
            attempts: 2,
            max_attempts: 3,
        };
        assert!(grant.guard().matches(&job));

        job.attempts = 3;
        job.queue_message_id = Some("m-3".to_string());
        assert!(!grant.guard().matches(&job));
    }
}
