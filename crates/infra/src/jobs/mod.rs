//! Job orchestration on top of the record store and queue adapters.
//!
//! ## Components
//!
//! - **ClaimProtocol**: atomic `Pending -> Processing` ownership
//! - **ProcessorRegistry**: tool slug -> processor, built at startup
//! - **TimeoutGuard**: deadline and panic containment around a processor
//! - **ToolPoller**: per-tool fetch/claim/run/record/ack loop
//! - **ReconciliationSweep**: stuck, expired and orphaned job repair
//! - **JobSubmitter**: record-first submission
//! - **JobOrchestrator**: explicit `start()` / `stop()` lifecycle

pub mod claim;
pub mod orchestrator;
pub mod poller;
pub mod reconcile;
pub mod registry;
pub mod submit;
pub mod timeout;

pub use claim::{ClaimProtocol, ClaimResult};
pub use orchestrator::{JobOrchestrator, OrchestratorError};
pub use poller::{JobOutcome, PollerConfig, PollerHandle, PollerStats, ToolPoller};
pub use reconcile::{MaintenanceReport, ReconciliationSweep, SweepConfig};
pub use registry::ProcessorRegistry;
pub use submit::{JobSubmitter, SubmitError, SubmitOptions};
pub use timeout::{DEFAULT_JOB_TIMEOUT, HandlerFailure, TimeoutGuard};
