//! Reconciliation sweep: repairs divergence between the queue and the record
//! store. The record store is authoritative.
//!
//! One pass runs four independent steps, each logging and skipping its own
//! failures:
//!
//! 1. `Processing` records older than the stuck threshold -> `Failed`
//! 2. deliveries the queue expired -> `Failed` (when the record still waits
//!    on that delivery)
//! 3. non-terminal records past `expires_at` -> `Expired`
//! 4. `Pending` records with no live delivery -> re-enqueued
//!
//! Every write is guarded by the state the sweep observed, so a record that
//! moved on in the meantime is left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use jobforge_core::{Job, JobStatus};

use crate::queue::{EnqueueOptions, ExpiredDelivery, JobQueue};
use crate::store::{JobRecordStore, JobUpdate, UpdateGuard};

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub stuck_marked_failed: usize,
    pub expired_synced: usize,
    pub records_expired: usize,
    pub orphans_requeued: usize,
    pub orphans_unrepaired: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub stuck_threshold: Duration,
    /// Minimum age of a `Pending` record before it counts as orphaned
    pub orphan_grace: Duration,
    /// Upper bound on records examined per step
    pub scan_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stuck_threshold: Duration::from_secs(30 * 60),
            orphan_grace: Duration::from_secs(300),
            scan_limit: 500,
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationSweep {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn JobQueue>,
    config: SweepConfig,
}

impl ReconciliationSweep {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn JobQueue>,
        config: SweepConfig,
    ) -> Self {
        Self { store, queue, config }
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            stuck_marked_failed: self.fail_stuck().await,
            expired_synced: self.sync_queue_expiry().await,
            records_expired: self.expire_records().await,
            ..Default::default()
        };
        let (orphans_requeued, orphans_unrepaired) = self.repair_orphans().await;
        let report = MaintenanceReport {
            orphans_requeued,
            orphans_unrepaired,
            ..report
        };

        if !report.is_empty() {
            info!(
                stuck_marked_failed = report.stuck_marked_failed,
                expired_synced = report.expired_synced,
                records_expired = report.records_expired,
                orphans_requeued = report.orphans_requeued,
                orphans_unrepaired = report.orphans_unrepaired,
                "Maintenance pass repaired jobs"
            );
        }
        report
    }

    async fn fail_stuck(&self) -> usize {
        let stuck = match self.store.find_stuck_processing(self.config.stuck_threshold).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Stuck job scan failed");
                return 0;
            }
        };

        let reason = format!(
            "Job stuck in processing for over {} minutes",
            self.config.stuck_threshold.as_secs() / 60
        );
        let mut count = 0;
        for job in stuck {
            if self.write_observed(&job, JobUpdate::failed(&reason)).await {
                warn!(
                    job_id = %job.id,
                    tool_slug = %job.tool_slug,
                    started_at = ?job.started_at,
                    "Stuck job marked failed"
                );
                count += 1;
            }
        }
        count
    }

    async fn sync_queue_expiry(&self) -> usize {
        let expired = match self.queue.take_expired().await {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "Queue expiry scan failed");
                return 0;
            }
        };

        let mut count = 0;
        for delivery in expired {
            let job = match self.store.find_by_id(delivery.job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        job_id = %delivery.job_id,
                        error = %e,
                        "Failed to load job for expired delivery"
                    );
                    continue;
                }
            };
            if !self.waits_on(&job, &delivery).await {
                continue;
            }

            let update = JobUpdate::failed("Queue delivery expired before the job finished");
            if self.write_observed(&job, update).await {
                warn!(
                    job_id = %job.id,
                    message_id = %delivery.message_id,
                    "Expired delivery synced to record"
                );
                count += 1;
            }
        }
        count
    }

    /// Whether `job` still depends on the expired delivery.
    async fn waits_on(&self, job: &Job, delivery: &ExpiredDelivery) -> bool {
        match job.status {
            JobStatus::Processing => {
                job.queue_message_id.as_deref() == Some(delivery.message_id.as_str())
            }
            JobStatus::Pending => !self
                .queue
                .has_live_delivery(&job.tool_slug, job.id)
                .await
                .unwrap_or(true),
            _ => false,
        }
    }

    async fn expire_records(&self) -> usize {
        let overdue = match self
            .store
            .find_past_deadline(Utc::now(), self.config.scan_limit)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Deadline scan failed");
                return 0;
            }
        };

        let mut count = 0;
        for job in overdue {
            if self
                .write_observed(&job, JobUpdate::expired("Job expired before completion"))
                .await
            {
                count += 1;
            }
        }
        count
    }

    async fn repair_orphans(&self) -> (usize, usize) {
        let candidates = match self
            .store
            .find_pending_older_than(self.config.orphan_grace, self.config.scan_limit)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Orphan scan failed");
                return (0, 0);
            }
        };

        let (mut requeued, mut unrepaired) = (0, 0);
        for job in candidates {
            match self.queue.has_live_delivery(&job.tool_slug, job.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Delivery lookup failed");
                    unrepaired += 1;
                    continue;
                }
            }

            let options = EnqueueOptions {
                priority: job.priority,
                start_after: job.process_after,
                expire_in: None,
            };
            match self.queue.enqueue(&job.tool_slug, job.id, options).await {
                Ok(message_id) => {
                    info!(job_id = %job.id, message_id = %message_id, "Orphaned job re-enqueued");
                    requeued += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Orphaned job could not be re-enqueued");
                    unrepaired += 1;
                }
            }
        }
        (requeued, unrepaired)
    }

    async fn write_observed(&self, job: &Job, update: JobUpdate) -> bool {
        match self
            .store
            .update_if(job.id, &UpdateGuard::observed(job), update)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Maintenance update failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryJobRecordStore;
    use jobforge_core::{ToolInput, ToolSlug};
    use serde_json::json;

    fn setup(
        config: SweepConfig,
    ) -> (
        Arc<InMemoryJobRecordStore>,
        Arc<InMemoryJobQueue>,
        ReconciliationSweep,
    ) {
        let store = InMemoryJobRecordStore::arc();
        let queue = InMemoryJobQueue::arc();
        let sweep = ReconciliationSweep::new(store.clone(), queue.clone(), config);
        (store, queue, sweep)
    }

    fn job() -> Job {
        Job::new(ToolSlug::new("text-summary").unwrap(), ToolInput::Opaque(json!({})))
    }

    #[tokio::test]
    async fn expired_delivery_fails_processing_record() {
        let (store, queue, sweep) = setup(SweepConfig::default());
        let job = job();
        store.insert(&job).await.unwrap();
        let options = EnqueueOptions {
            expire_in: Some(Duration::ZERO),
            ..Default::default()
        };
        let message_id = queue.enqueue(&job.tool_slug, job.id, options).await.unwrap();
        queue.fetch(&job.tool_slug, 1).await.unwrap();
        store.claim(job.id, &message_id).await.unwrap();

        let report = sweep.run_maintenance().await;

        assert_eq!(report.expired_synced, 1);
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn expired_delivery_fails_never_claimed_record() {
        let (store, queue, sweep) = setup(SweepConfig::default());
        let job = job();
        store.insert(&job).await.unwrap();
        let options = EnqueueOptions {
            expire_in: Some(Duration::ZERO),
            ..Default::default()
        };
        queue.enqueue(&job.tool_slug, job.id, options).await.unwrap();
        queue.fetch(&job.tool_slug, 1).await.unwrap();

        let report = sweep.run_maintenance().await;

        assert_eq!(report.expired_synced, 1);
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 0);
        assert_eq!(
            stored.error.as_deref(),
            Some("Queue delivery expired before the job finished")
        );
    }

    #[tokio::test]
    async fn expired_delivery_ignored_while_pending_record_has_another() {
        let (store, queue, sweep) = setup(SweepConfig::default());
        let job = job();
        store.insert(&job).await.unwrap();
        let options = EnqueueOptions {
            expire_in: Some(Duration::ZERO),
            ..Default::default()
        };
        queue.enqueue(&job.tool_slug, job.id, options).await.unwrap();
        queue.fetch(&job.tool_slug, 1).await.unwrap();
        queue
            .enqueue(&job.tool_slug, job.id, EnqueueOptions::default())
            .await
            .unwrap();

        let report = sweep.run_maintenance().await;

        assert_eq!(report.expired_synced, 0);
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn record_past_deadline_expires() {
        let (store, _, sweep) = setup(SweepConfig::default());
        let job = job().expires_at(Utc::now() - chrono::Duration::minutes(1));
        store.put(job.clone()).unwrap();

        let report = sweep.run_maintenance().await;

        assert_eq!(report.records_expired, 1);
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Expired);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn pending_job_with_delivery_is_not_an_orphan() {
        let (store, queue, sweep) = setup(SweepConfig {
            orphan_grace: Duration::ZERO,
            ..Default::default()
        });
        let job = job();
        store.insert(&job).await.unwrap();
        queue
            .enqueue(&job.tool_slug, job.id, EnqueueOptions::default())
            .await
            .unwrap();

        let report = sweep.run_maintenance().await;
        assert_eq!(report.orphans_requeued, 0);
        assert_eq!(queue.depth(&job.tool_slug), 1);
    }

    #[tokio::test]
    async fn clean_pass_reports_nothing() {
        let (_, _, sweep) = setup(SweepConfig::default());
        assert!(sweep.run_maintenance().await.is_empty());
    }
}
