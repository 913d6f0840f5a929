//! Infrastructure layer: record stores, queue adapters, configuration and the
//! job orchestration built on them.

pub mod config;
pub mod jobs;
pub mod queue;
pub mod store;


pub use config::{ConfigError, OrchestratorConfig};
pub use jobs::{JobOrchestrator, JobSubmitter, ProcessorRegistry, SubmitOptions};
