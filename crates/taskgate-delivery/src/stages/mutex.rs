use crate::context::TaskContext;
use crate::pipeline::{Next, Stage, TaskFault, TaskOutcome};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use taskgate_core::{MutexError, ResultCode, TaskMutex};

/// Serializes deliveries of the same URL. The lease is dropped on every path out of the inner
/// stages, including unwinding, which frees the lock.
pub struct MutexSingleFlightStage {
    mutex: Arc<dyn TaskMutex>,
    timeout: Duration,
}

impl std::fmt::Debug for MutexSingleFlightStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexSingleFlightStage")
            .field("mutex", &"<TaskMutex>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MutexSingleFlightStage {
    pub fn new(mutex: Arc<dyn TaskMutex>, timeout: Duration) -> Self {
        Self { mutex, timeout }
    }
}

/// Lock name for one external task URL (query string included).
pub fn lock_name(full_url: &str) -> String {
    format!("task-{}", hex::encode(Sha256::digest(full_url.as_bytes())))
}

#[async_trait]
impl Stage for MutexSingleFlightStage {
    async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome {
        let name = lock_name(ctx.full_url());
        let lease = match self.mutex.acquire(&name, self.timeout).await {
            Ok(lease) => lease,
            Err(err @ MutexError::TimedOut { .. }) => {
                return Ok(ResultCode::mutex_timeout(&err).with_context("lock", &name));
            }
            Err(MutexError::Backend(err)) => {
                return Err(TaskFault::Unexpected(err.context("acquire task mutex")));
            }
        };

        let outcome = next.run(ctx).await;

        if let Err(err) = lease.release().await {
            tracing::warn!(
                event = "delivery.mutex.release_failed",
                lock = %name,
                error = %err,
                "failed to release task mutex"
            );
        }
        outcome
    }
}
