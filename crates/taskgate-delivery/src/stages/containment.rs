use crate::context::TaskContext;
use crate::pipeline::{Next, Stage, TaskOutcome};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe};
use taskgate_core::ResultCode;

/// Turns faults and panics from the inner stages into result codes so the endpoint always answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionContainmentStage;

#[async_trait]
impl Stage for ExceptionContainmentStage {
    async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome {
        match AssertUnwindSafe(next.run(ctx)).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(fault)) => Ok(fault.into_result_code()),
            Err(payload) => Ok(ResultCode::uncaught_exception(
                "panic",
                anyhow::anyhow!(panic_message(payload.as_ref())),
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
