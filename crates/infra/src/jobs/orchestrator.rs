//! Orchestrator lifecycle: one poller per registered tool plus a periodic
//! maintenance task, started and stopped explicitly.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use jobforge_core::{JobId, ToolSlug};

use crate::config::OrchestratorConfig;
use crate::queue::JobQueue;
use crate::store::{JobRecordStore, JobUpdate, StoreError};

use super::poller::{PollerConfig, PollerHandle, PollerStats, ToolPoller};
use super::reconcile::{MaintenanceReport, ReconciliationSweep, SweepConfig};
use super::registry::ProcessorRegistry;
use super::submit::JobSubmitter;
use super::timeout::TimeoutGuard;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("orchestrator already running")]
    AlreadyRunning,

    #[error("no processors registered")]
    NoProcessors,

    #[error("maintenance interval must be greater than zero")]
    ZeroMaintenanceInterval,
}

struct Running {
    shutdown: CancellationToken,
    pollers: Vec<PollerHandle>,
    maintenance: JoinHandle<()>,
}

/// Wires store, queue and registry together.
///
/// Everything is injected; nothing is global. `start` may be called again
/// after `stop`.
pub struct JobOrchestrator {
    store: Arc<dyn JobRecordStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<ProcessorRegistry>,
    config: OrchestratorConfig,
    sweep: ReconciliationSweep,
    running: Mutex<Option<Running>>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        queue: Arc<dyn JobQueue>,
        registry: ProcessorRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        let sweep = ReconciliationSweep::new(
            store.clone(),
            queue.clone(),
            SweepConfig {
                stuck_threshold: config.stuck_threshold,
                orphan_grace: config.orphan_grace,
                ..Default::default()
            },
        );
        Self {
            store,
            queue,
            registry: Arc::new(registry),
            config,
            sweep,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Submission entry point sharing this orchestrator's adapters.
    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter::new(
            self.store.clone(),
            self.queue.clone(),
            self.config.retry.max_attempts,
            self.config.retention,
        )
    }

    /// Build the poller for `tool_slug` without starting it.
    pub fn poller(&self, tool_slug: ToolSlug) -> ToolPoller {
        ToolPoller::new(
            tool_slug,
            self.store.clone(),
            self.queue.clone(),
            self.registry.clone(),
            PollerConfig {
                batch_size: self.config.batch_size,
                poll_interval: self.config.poll_interval,
                timeout: TimeoutGuard::new(self.config.job_timeout),
                retry: self.config.retry.clone(),
            },
        )
    }

    /// Start one poller per registered tool and the maintenance ticker.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(OrchestratorError::AlreadyRunning);
        }
        if self.registry.is_empty() {
            return Err(OrchestratorError::NoProcessors);
        }
        if self.config.maintenance_interval.is_zero() {
            return Err(OrchestratorError::ZeroMaintenanceInterval);
        }

        let shutdown = CancellationToken::new();
        let pollers = self
            .registry
            .slugs()
            .into_iter()
            .map(|slug| self.poller(slug).spawn(shutdown.child_token()))
            .collect::<Vec<_>>();

        let sweep = self.sweep.clone();
        let interval = self.config.maintenance_interval;
        let token = shutdown.child_token();
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep.run_maintenance().await;
                    }
                }
            }
        });

        info!(
            tools = ?self.registry.slugs().iter().map(ToString::to_string).collect::<Vec<_>>(),
            batch_size = self.config.batch_size,
            "Job orchestrator started"
        );
        *running = Some(Running {
            shutdown,
            pollers,
            maintenance,
        });
        Ok(())
    }

    /// Stop pollers (each finishes its in-flight batch) and the maintenance
    /// ticker. No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.shutdown.cancel();
        for poller in running.pollers {
            poller.shutdown().await;
        }
        if let Err(e) = running.maintenance.await {
            error!(error = %e, "Maintenance task failed");
        }
        info!("Job orchestrator stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Per-tool statistics of the running pollers.
    pub async fn poller_stats(&self) -> Vec<(ToolSlug, PollerStats)> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| {
                r.pollers
                    .iter()
                    .map(|p| (p.tool_slug().clone(), p.stats()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Run one reconciliation pass now.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.sweep.run_maintenance().await
    }

    /// Cancel a `Pending` or `Processing` job. Returns `false` when the job
    /// already reached a terminal state.
    ///
    /// A running processor is not interrupted; its result is discarded
    /// because the claim no longer matches.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, StoreError> {
        let cancelled = self.store.update(job_id, JobUpdate::cancelled()).await?;
        if cancelled {
            info!(job_id = %job_id, "Job cancelled");
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryJobRecordStore;
    use jobforge_core::JobStatus;
    use jobforge_tools::builtin_catalog;
    use serde_json::json;
    use std::time::Duration;

    fn orchestrator(registry: ProcessorRegistry) -> (Arc<InMemoryJobRecordStore>, JobOrchestrator) {
        let store = InMemoryJobRecordStore::arc();
        let config = OrchestratorConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let orchestrator =
            JobOrchestrator::new(store.clone(), InMemoryJobQueue::arc(), registry, config);
        (store, orchestrator)
    }

    #[tokio::test]
    async fn start_requires_processors_and_is_exclusive() {
        let (_, empty) = orchestrator(ProcessorRegistry::new());
        assert!(matches!(empty.start().await, Err(OrchestratorError::NoProcessors)));

        let (_, orch) = orchestrator(ProcessorRegistry::from_entries(builtin_catalog()).unwrap());
        orch.start().await.unwrap();
        assert!(matches!(orch.start().await, Err(OrchestratorError::AlreadyRunning)));
        assert_eq!(orch.poller_stats().await.len(), 2);

        orch.stop().await;
        assert!(!orch.is_running().await);
        orch.stop().await;
    }

    #[tokio::test]
    async fn start_rejects_zero_maintenance_interval() {
        let registry = ProcessorRegistry::from_entries(builtin_catalog()).unwrap();
        let config = OrchestratorConfig {
            maintenance_interval: Duration::ZERO,
            ..Default::default()
        };
        let orch = JobOrchestrator::new(
            InMemoryJobRecordStore::arc(),
            InMemoryJobQueue::arc(),
            registry,
            config,
        );

        assert!(matches!(
            orch.start().await,
            Err(OrchestratorError::ZeroMaintenanceInterval)
        ));
        assert!(!orch.is_running().await);
    }

    #[tokio::test]
    async fn processes_submitted_job_end_to_end() {
        let registry = ProcessorRegistry::from_entries(builtin_catalog()).unwrap();
        let (store, orch) = orchestrator(registry);
        orch.start().await.unwrap();

        let id = orch
            .submitter()
            .submit(
                "text-summary",
                json!({
                    "text": "Queues retry. Workers claim jobs. Queues retry jobs.",
                    "max_sentences": 1
                }),
                Default::default(),
            )
            .await
            .unwrap();

        let mut status = JobStatus::Pending;
        for _ in 0..200 {
            status = store.find_by_id(id).await.unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orch.stop().await;

        assert_eq!(status, JobStatus::Completed);
        let job = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.output.unwrap()["sentence_count"], json!(3));
    }

    #[tokio::test]
    async fn cancel_is_respected() {
        let registry = ProcessorRegistry::from_entries(builtin_catalog()).unwrap();
        let (store, orch) = orchestrator(registry);
        let id = orch
            .submitter()
            .submit("text-summary", json!({"text": "Hello."}), Default::default())
            .await
            .unwrap();

        assert!(orch.cancel(id).await.unwrap());
        assert!(!orch.cancel(id).await.unwrap());

        let poller = orch.poller(ToolSlug::new("text-summary").unwrap());
        poller.poll_once().await.unwrap();

        let job = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempts, 0);
        assert_eq!(poller.stats().skipped, 1);
    }
}
