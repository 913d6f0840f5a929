use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{Job, JobId, JobStatus};

use super::{ClaimGrant, JobRecordStore, JobUpdate, StoreError, StoreResult, UpdateGuard, cutoff};

/// In-memory job store for tests/dev.
///
/// A single `RwLock` over the map makes every claim a check-and-set under the
/// write lock, which gives the same at-most-one guarantee as the conditional
/// `UPDATE` in Postgres.
#[derive(Debug, Default)]
pub struct InMemoryJobRecordStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace a record verbatim (test fixtures, e.g. back-dated
    /// `started_at`).
    pub fn put(&self, job: Job) -> StoreResult<()> {
        self.write()?.insert(job.id, job);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .read()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .write()
            .map_err(|_| StoreError::Storage("job map lock poisoned".to_string()))
    }

    fn select<F>(&self, limit: usize, pred: F) -> StoreResult<Vec<Job>>
    where
        F: Fn(&Job) -> bool,
    {
        let jobs = self.read()?;
        let mut result: Vec<Job> = jobs.values().filter(|j| pred(j)).cloned().collect();
        result.sort_by_key(|j| j.created_at);
        result.truncate(limit);
        Ok(result)
    }
}

#[async_trait]
impl JobRecordStore for InMemoryJobRecordStore {
    async fn insert(&self, job: &Job) -> StoreResult<()> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim(&self, job_id: JobId, message_id: &str) -> StoreResult<Option<ClaimGrant>> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Pending {
            return Ok(None);
        }

        let now = Utc::now();
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.queue_message_id = Some(message_id.to_string());
        job.updated_at = now;

        Ok(Some(ClaimGrant {
            job_id,
            message_id: message_id.to_string(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
        }))
    }

    async fn find_by_id(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn update(&self, job_id: JobId, update: JobUpdate) -> StoreResult<bool> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        Ok(update.apply_to(job))
    }

    async fn update_if(
        &self,
        job_id: JobId,
        guard: &UpdateGuard,
        update: JobUpdate,
    ) -> StoreResult<bool> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if !guard.matches(job) {
            return Ok(false);
        }
        Ok(update.apply_to(job))
    }

    async fn find_stuck_processing(&self, threshold: Duration) -> StoreResult<Vec<Job>> {
        let before = cutoff(threshold);
        self.select(usize::MAX, |j| {
            j.status == JobStatus::Processing && j.started_at.is_some_and(|at| at < before)
        })
    }

    async fn find_pending_older_than(&self, age: Duration, limit: usize) -> StoreResult<Vec<Job>> {
        let before = cutoff(age);
        self.select(limit, |j| j.status == JobStatus::Pending && j.updated_at <= before)
    }

    async fn find_past_deadline(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Job>> {
        self.select(limit, |j| {
            !j.status.is_terminal() && j.expires_at.is_some_and(|at| at < now)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{ToolInput, ToolSlug};
    use serde_json::json;

    fn job() -> Job {
        Job::new(ToolSlug::new("unknown-tool").unwrap(), ToolInput::Opaque(json!({})))
    }

    #[tokio::test]
    async fn insert_and_claim() {
        let store = InMemoryJobRecordStore::new();
        let job = job();
        store.insert(&job).await.unwrap();

        let grant = store.claim(job.id, "m-1").await.unwrap().unwrap();
        assert_eq!(grant.attempts, 1);
        assert_eq!(grant.max_attempts, 3);

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(stored.queue_message_id.as_deref(), Some("m-1"));
        assert!(stored.started_at.is_some());

        // Still processing: second claim is refused without touching attempts.
        assert!(store.claim(job.id, "m-2").await.unwrap().is_none());
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.queue_message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryJobRecordStore::new();
        let job = job();
        store.insert(&job).await.unwrap();
        assert!(matches!(
            store.insert(&job).await,
            Err(StoreError::AlreadyExists(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn claim_of_missing_job_is_none() {
        let store = InMemoryJobRecordStore::new();
        assert!(store.claim(JobId::new(), "m-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_if_rejects_stale_epoch() {
        let store = InMemoryJobRecordStore::new();
        let job = job();
        store.insert(&job).await.unwrap();

        let first = store.claim(job.id, "m-1").await.unwrap().unwrap();
        assert!(store
            .update_if(job.id, &first.guard(), JobUpdate::retry("boom"))
            .await
            .unwrap());

        let second = store.claim(job.id, "m-2").await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        // The first claim's holder writes late: refused.
        assert!(!store
            .update_if(job.id, &first.guard(), JobUpdate::completed(json!({})))
            .await
            .unwrap());
        assert!(store
            .update_if(job.id, &second.guard(), JobUpdate::completed(json!({})))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn update_of_missing_job_is_not_found() {
        let store = InMemoryJobRecordStore::new();
        let id = JobId::new();
        assert!(matches!(
            store.update(id, JobUpdate::cancelled()).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn stuck_and_deadline_queries() {
        let store = InMemoryJobRecordStore::new();

        let mut stuck = job();
        stuck.status = JobStatus::Processing;
        stuck.attempts = 1;
        stuck.started_at = Some(Utc::now() - chrono::Duration::minutes(35));
        store.put(stuck.clone()).unwrap();

        let mut fresh = job();
        fresh.status = JobStatus::Processing;
        fresh.attempts = 1;
        fresh.started_at = Some(Utc::now() - chrono::Duration::minutes(5));
        store.put(fresh).unwrap();

        let overdue = job().expires_at(Utc::now() - chrono::Duration::hours(1));
        store.put(overdue.clone()).unwrap();

        let found = store
            .find_stuck_processing(Duration::from_secs(30 * 60))
            .await
            .unwrap();
        assert_eq!(found.iter().map(|j| j.id).collect::<Vec<_>>(), vec![stuck.id]);

        let past = store.find_past_deadline(Utc::now(), 10).await.unwrap();
        assert_eq!(past.iter().map(|j| j.id).collect::<Vec<_>>(), vec![overdue.id]);
    }
}
