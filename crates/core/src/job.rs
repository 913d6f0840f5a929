//! Job record and status state machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::JobId;
use crate::payload::{ToolInput, ToolSlug};

/// Default attempt budget for a new job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker to claim it
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Handler finished successfully
    Completed,
    /// Retry budget exhausted, or a permanent failure
    Failed,
    /// Cancelled by an external collaborator
    Cancelled,
    /// Passed its retention deadline before finishing
    Expired,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Expired,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Expired
        )
    }

    /// Allowed edges:
    ///
    /// - `Pending -> Processing | Cancelled | Expired | Failed`
    /// - `Processing -> Completed | Pending | Failed | Cancelled | Expired`
    /// - terminal states have no outgoing edges
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(next, Processing | Cancelled | Expired | Failed),
            Processing => matches!(next, Completed | Pending | Failed | Cancelled | Expired),
            Completed | Failed | Cancelled | Expired => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Expired => "expired",
        }
    }

    /// Check `self -> next` against the state machine.
    pub fn transition(&self, next: JobStatus) -> Result<JobStatus, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::invalid_transition(self.as_str(), next.as_str()))
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownStatus(s.to_string()))
    }
}

/// A unit of asynchronous work tracked by a persistent record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub tool_slug: ToolSlug,
    pub status: JobStatus,
    pub input: ToolInput,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    /// Incremented only by a successful claim
    pub attempts: u32,
    /// Fixed at creation
    pub max_attempts: u32,
    pub priority: i32,
    /// Earliest time the job is eligible to run
    pub process_after: Option<DateTime<Utc>>,
    /// Hard deadline after which maintenance expires the record
    pub expires_at: Option<DateTime<Utc>>,
    /// Queue delivery that holds (or last held) the claim
    pub queue_message_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new `Pending` job.
    pub fn new(tool_slug: ToolSlug, input: ToolInput) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tool_slug,
            status: JobStatus::Pending,
            input,
            output: None,
            error: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            process_after: None,
            expires_at: None,
            queue_message_id: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay eligibility until `at`.
    pub fn process_after(mut self, at: DateTime<Utc>) -> Self {
        self.process_after = Some(at);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.process_after.is_none_or(|at| now >= at)
    }

    /// Whether the attempt budget has been spent.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        let slug = ToolSlug::new("unknown-tool").unwrap();
        Job::new(slug, ToolInput::Opaque(json!({})))
    }

    #[test]
    fn new_job_defaults() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.queue_message_id.is_none());
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in JobStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn lifecycle_edges() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));

        let err = Completed.transition(Pending).unwrap_err();
        assert_eq!(err, DomainError::invalid_transition("completed", "pending"));
    }

    #[test]
    fn status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "running".parse::<JobStatus>(),
            Err(DomainError::UnknownStatus(_))
        ));
    }

    #[test]
    fn delayed_job_is_not_ready() {
        let now = Utc::now();
        let job = job().process_after(now + chrono::Duration::minutes(5));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(job().with_max_attempts(0).max_attempts, 1);
    }
}
