use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use jobforge_core::Job;

/// Everything a processor receives for one attempt.
///
/// The job is an owned snapshot taken at claim time. `cancel` fires when the
/// timeout guard gives up on the attempt or the worker shuts down; processors
/// that run long loops should check it between steps.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub job: Job,
    pub cancel: CancellationToken,
}

impl ProcessContext {
    pub fn new(job: Job, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }

    /// Return `Err(Cancelled)` once cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), ProcessorError> {
        if self.cancel.is_cancelled() {
            Err(ProcessorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    #[error("processing cancelled")]
    Cancelled,
}

impl ProcessorError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Tool-specific handler for jobs of one slug.
///
/// `Ok(output)` completes the job with `output`; any `Err` counts as a failed
/// attempt and goes through the retry policy.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, ctx: ProcessContext) -> Result<JsonValue, ProcessorError>;
}

/// Adapter turning an async closure into a [`Processor`].
pub struct FnProcessor<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Build a processor from `f`.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F, Fut>
where
    F: Fn(ProcessContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, ProcessorError>> + Send + 'static,
{
    FnProcessor {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F, Fut>
where
    F: Fn(ProcessContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, ProcessorError>> + Send + 'static,
{
    async fn process(&self, ctx: ProcessContext) -> Result<JsonValue, ProcessorError> {
        (self.f)(ctx).await
    }
}
