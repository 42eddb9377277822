use crate::context::TaskContext;
use crate::pipeline::{Next, Stage, TaskOutcome};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use taskgate_core::{ResultCode, StatusMapper};
use tokio::time::Instant;
use tracing::Level;

/// Records every terminal result with its timing at the severity the status table assigns.
#[derive(Debug, Clone)]
pub struct LoggingStage {
    mapper: Arc<StatusMapper>,
}

impl LoggingStage {
    pub fn new(mapper: Arc<StatusMapper>) -> Self {
        Self { mapper }
    }
}

#[async_trait]
impl Stage for LoggingStage {
    async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome {
        let started = Instant::now();
        let outcome = next.run(ctx).await;
        match &outcome {
            Ok(result) => log_result(&self.mapper, ctx, result, started.elapsed()),
            Err(fault) => tracing::error!(
                event = "delivery.task.fault",
                task_type = %ctx.task_type(),
                time_ms = started.elapsed().as_millis() as u64,
                error = %fault,
                "Task: unhandled fault"
            ),
        }
        outcome
    }
}

macro_rules! task_event {
    ($level:expr, $ctx:expr, $result:expr, $elapsed:expr, $severity:expr) => {
        tracing::event!(
            $level,
            event = "delivery.task.result",
            task_type = %$ctx.task_type(),
            task_name = $ctx.task_name().unwrap_or(""),
            queue_name = $ctx.queue_name().unwrap_or(""),
            retries = $ctx.retry_count(),
            caller = $ctx.caller_email().unwrap_or(""),
            time_ms = $elapsed.as_millis() as u64,
            code = %$result.code(),
            severity = %$severity,
            context = %serde_json::Value::Object($result.context().clone().into_iter().collect()),
            error = %$result.error().map(|err| format!("{err:#}")).unwrap_or_default(),
            "Task: [{}] {}",
            $result.code(),
            $result.message()
        )
    };
}

/// Emit the one log line a delivery produces. Also used by the controller for results that never
/// entered the pipeline.
pub fn log_result(
    mapper: &StatusMapper,
    ctx: &TaskContext,
    result: &ResultCode,
    elapsed: Duration,
) {
    let severity = match mapper.severity(result) {
        Ok(severity) => severity,
        Err(err) => {
            tracing::error!(
                event = "delivery.task.unmapped_code",
                task_type = %ctx.task_type(),
                code = %result.code(),
                error = %err,
                "Task: [{}] {}",
                result.code(),
                result.message()
            );
            return;
        }
    };

    let level = severity.tracing_level();
    if level == Level::ERROR {
        task_event!(Level::ERROR, ctx, result, elapsed, severity);
    } else if level == Level::WARN {
        task_event!(Level::WARN, ctx, result, elapsed, severity);
    } else if level == Level::INFO {
        task_event!(Level::INFO, ctx, result, elapsed, severity);
    } else {
        task_event!(Level::DEBUG, ctx, result, elapsed, severity);
    }
}
