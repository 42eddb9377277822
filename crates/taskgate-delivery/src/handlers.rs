use crate::context::TaskContext;
use crate::pipeline::{TaskHandler, TaskOutcome};
use async_trait::async_trait;
use taskgate_core::ResultCode;

/// Adapts a synchronous closure into a [`TaskHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&TaskContext) -> TaskOutcome + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&TaskContext) -> TaskOutcome + Send + Sync,
{
    async fn handle(&self, ctx: &TaskContext) -> TaskOutcome {
        (self.f)(ctx)
    }
}

/// Acknowledges every delivery after logging what arrived. Wired for all configured task types by
/// the standalone server.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPayloadHandler;

#[async_trait]
impl TaskHandler for LogPayloadHandler {
    async fn handle(&self, ctx: &TaskContext) -> TaskOutcome {
        let payload = match ctx.json_body() {
            Some(json) => json.to_string(),
            None => String::from_utf8_lossy(ctx.body()).into_owned(),
        };
        tracing::info!(
            event = "delivery.handler.payload",
            task_type = %ctx.task_type(),
            caller = ctx.caller_email().unwrap_or(""),
            bytes = ctx.body().len(),
            payload = %payload,
            "received task"
        );
        Ok(ResultCode::success())
    }
}
