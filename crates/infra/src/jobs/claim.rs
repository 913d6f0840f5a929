//! Claim protocol: turn a queue delivery into exclusive ownership of a job.

use std::sync::Arc;

use jobforge_core::{Job, JobId, JobStatus};

use crate::store::{ClaimGrant, JobRecordStore, StoreError, StoreResult};

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// This caller now owns the job until it writes a result.
    Claimed { grant: ClaimGrant, job: Job },
    /// The record exists but is not `Pending` (claimed elsewhere, finished or
    /// cancelled). The delivery is a duplicate and is acknowledged as a no-op.
    AlreadyHandled(JobStatus),
    NotFound,
}

/// Atomic `Pending -> Processing` transition on top of a record store.
#[derive(Clone)]
pub struct ClaimProtocol {
    store: Arc<dyn JobRecordStore>,
}

impl ClaimProtocol {
    pub fn new(store: Arc<dyn JobRecordStore>) -> Self {
        Self { store }
    }

    /// Claim `job_id` for delivery `message_id`.
    ///
    /// Losing the race is not an error: the record is re-read to tell a
    /// missing job from one that is already handled.
    pub async fn claim(&self, job_id: JobId, message_id: &str) -> StoreResult<ClaimResult> {
        match self.store.claim(job_id, message_id).await? {
            Some(grant) => {
                let job = self
                    .store
                    .find_by_id(job_id)
                    .await?
                    .ok_or(StoreError::NotFound(job_id))?;
                Ok(ClaimResult::Claimed { grant, job })
            }
            None => Ok(match self.store.find_by_id(job_id).await? {
                Some(job) => ClaimResult::AlreadyHandled(job.status),
                None => ClaimResult::NotFound,
            }),
        }
    }
}
