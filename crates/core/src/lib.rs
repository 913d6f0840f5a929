//! `jobforge-core`: job orchestration domain primitives.
//!
//! This crate contains **pure domain** types (no IO, no async): job records,
//! the status state machine, tool payload schemas and the retry policy.

pub mod error;
pub mod id;
pub mod job;
pub mod payload;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus};
pub use payload::{
    ContractAnalysisInput, TextSummaryInput, ToolInput, ToolSlug, TranscriptionInput,
};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
