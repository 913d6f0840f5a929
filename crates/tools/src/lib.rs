//! `jobforge-tools`
//!
//! **Responsibility:** the processor contract every AI tool implements, plus
//! the built-in reference tools.
//!
//! This crate is intentionally storage and runtime agnostic:
//! - It must not touch the job record store or the queue.
//! - Processors receive an owned job snapshot and a cancellation token.
//! - Results are plain JSON outputs; the orchestrator decides what to persist.

pub mod catalog;
pub mod contract_analysis;
pub mod processor;
pub mod text_summary;

pub use catalog::{ProcessorFactory, builtin_catalog};
pub use contract_analysis::{ContractAnalysisProcessor, ContractReport, FlaggedClause};
pub use processor::{FnProcessor, ProcessContext, Processor, ProcessorError, processor_fn};
pub use text_summary::{Summary, TextSummaryProcessor};
