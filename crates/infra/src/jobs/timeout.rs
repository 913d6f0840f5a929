//! Deadline around a single processor invocation.
//!
//! The processor runs on its own task. When the deadline passes, the attempt
//! fails with [`HandlerFailure::Timeout`] and the processor's cancellation
//! token fires; the task is left to wind down on its own and whatever it
//! returns later is dropped. A panic inside the processor surfaces as
//! [`HandlerFailure::Panicked`].

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use jobforge_core::Job;
use jobforge_tools::{ProcessContext, Processor};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(600);

/// Why an attempt produced no output. All variants are retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerFailure {
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Error(String),

    #[error("processor panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    timeout: Duration,
}

impl Default for TimeoutGuard {
    fn default() -> Self {
        Self::new(DEFAULT_JOB_TIMEOUT)
    }
}

impl TimeoutGuard {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run(
        &self,
        processor: Arc<dyn Processor>,
        job: Job,
    ) -> Result<JsonValue, HandlerFailure> {
        let cancel = CancellationToken::new();
        let ctx = ProcessContext::new(job, cancel.clone());
        let mut task = tokio::spawn(async move { processor.process(ctx).await });

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(err))) => Err(HandlerFailure::Error(err.to_string())),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(HandlerFailure::Panicked(panic_message(join_err.into_panic())))
            }
            Ok(Err(join_err)) => Err(HandlerFailure::Error(join_err.to_string())),
            Err(_) => {
                cancel.cancel();
                Err(HandlerFailure::Timeout(self.timeout))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{ToolInput, ToolSlug};
    use jobforge_tools::{ProcessorError, processor_fn};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn job() -> Job {
        Job::new(ToolSlug::new("echo").unwrap(), ToolInput::Opaque(json!({})))
    }

    #[tokio::test]
    async fn passes_output_through() {
        let p = Arc::new(processor_fn(|_ctx: ProcessContext| async { Ok(json!({"ok": true})) }));
        let out = TimeoutGuard::default().run(p, job()).await.unwrap();
        assert_eq!(out, json!({"ok": true}));
    }

    #[tokio::test]
    async fn processor_error_is_reported_verbatim() {
        let p = Arc::new(processor_fn(|_ctx: ProcessContext| async {
            Err(ProcessorError::failed("model unavailable"))
        }));
        let err = TimeoutGuard::default().run(p, job()).await.unwrap_err();
        assert_eq!(err, HandlerFailure::Error("model unavailable".to_string()));
    }

    #[tokio::test]
    async fn deadline_fails_attempt_and_cancels_processor() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let flag = saw_cancel.clone();
        let p = Arc::new(processor_fn(move |ctx: ProcessContext| {
            let flag = flag.clone();
            async move {
                ctx.cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Err(ProcessorError::Cancelled)
            }
        }));

        let guard = TimeoutGuard::new(Duration::from_millis(20));
        let err = guard.run(p, job()).await.unwrap_err();
        assert_eq!(err, HandlerFailure::Timeout(Duration::from_millis(20)));
        assert_eq!(err.to_string(), "Job timed out after 20ms");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let p = Arc::new(processor_fn(|_ctx: ProcessContext| async {
            if true {
                panic!("bad tensor shape");
            }
            Ok(json!(null))
        }));
        let err = TimeoutGuard::default().run(p, job()).await.unwrap_err();
        assert_eq!(err, HandlerFailure::Panicked("bad tensor shape".to_string()));
    }
}
