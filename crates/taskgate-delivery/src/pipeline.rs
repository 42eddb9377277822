//! Ordered delivery stages around a terminal task handler.
//!
//! A [`Pipeline`] is immutable and shared across requests. Every [`Pipeline::process`] call walks
//! the stages with a fresh [`Next`] cursor; a stage either answers with a [`ResultCode`] itself or
//! hands the context on with [`Next::run`], which consumes the cursor.

use crate::context::TaskContext;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use taskgate_core::ResultCode;

/// Failure returned by a task handler.
#[derive(Debug)]
pub enum TaskFault {
    /// The task can never succeed (bad payload, missing parameter); retrying will not help.
    CannotBeValid(String),
    Unexpected(anyhow::Error),
}

impl TaskFault {
    pub fn cannot_be_valid(message: impl Into<String>) -> Self {
        Self::CannotBeValid(message.into())
    }

    pub fn into_result_code(self) -> ResultCode {
        match self {
            Self::CannotBeValid(message) => ResultCode::cannot_be_valid(message),
            Self::Unexpected(err) => ResultCode::uncaught_exception("error", err),
        }
    }
}

impl fmt::Display for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CannotBeValid(message) => write!(f, "cannot be valid: {message}"),
            Self::Unexpected(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for TaskFault {}

impl From<anyhow::Error> for TaskFault {
    fn from(value: anyhow::Error) -> Self {
        Self::Unexpected(value)
    }
}

pub type TaskOutcome = Result<ResultCode, TaskFault>;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> TaskOutcome;
}

#[async_trait]
pub trait Stage: Send + Sync {
    async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome;
}

/// The rest of the pipeline from one stage's point of view.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    handler: &'a dyn TaskHandler,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut TaskContext) -> TaskOutcome {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    handler: self.handler,
                };
                stage.handle(ctx, next).await
            }
            None => self.handler.handle(ctx).await,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    stages: Arc<[Arc<dyn Stage>]>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub async fn process(&self, ctx: &mut TaskContext, handler: &dyn TaskHandler) -> TaskOutcome {
        Next {
            stages: &self.stages,
            handler,
        }
        .run(ctx)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        http::{HeaderMap, Method},
    };
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recording {
        name: &'static str,
        trace: Trace,
        short_circuit: bool,
    }

    #[async_trait]
    impl Stage for Recording {
        async fn handle(&self, ctx: &mut TaskContext, next: Next<'_>) -> TaskOutcome {
            self.trace.lock().unwrap().push(format!("{}:before", self.name));
            if self.short_circuit {
                return Ok(ResultCode::custom("stopped", self.name));
            }
            let result = next.run(ctx).await;
            self.trace.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    struct Handler(Trace);

    #[async_trait]
    impl TaskHandler for Handler {
        async fn handle(&self, _ctx: &TaskContext) -> TaskOutcome {
            self.0.lock().unwrap().push("handler".to_string());
            Ok(ResultCode::success_with("handled"))
        }
    }

    fn ctx() -> TaskContext {
        TaskContext::new(
            Method::POST,
            "https://app.example.com/_do_task/x",
            HeaderMap::new(),
            Bytes::new(),
            "x",
        )
    }

    fn stage(name: &'static str, trace: &Trace, short_circuit: bool) -> Arc<dyn Stage> {
        Arc::new(Recording {
            name,
            trace: trace.clone(),
            short_circuit,
        })
    }

    #[tokio::test]
    async fn empty_pipeline_runs_handler_directly() {
        let trace = Trace::default();
        let result = Pipeline::default()
            .process(&mut ctx(), &Handler(trace.clone()))
            .await
            .unwrap();
        assert_eq!(result.message(), "handled");
        assert_eq!(*trace.lock().unwrap(), vec!["handler"]);
    }

    #[tokio::test]
    async fn stages_wrap_handler_in_order() {
        let trace = Trace::default();
        let pipeline = Pipeline::new(vec![
            stage("a", &trace, false),
            stage("b", &trace, false),
        ]);
        pipeline
            .process(&mut ctx(), &Handler(trace.clone()))
            .await
            .unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["a:before", "b:before", "handler", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_later_stages_and_handler() {
        let trace = Trace::default();
        let pipeline = Pipeline::new(vec![
            stage("a", &trace, false),
            stage("b", &trace, true),
            stage("c", &trace, false),
        ]);
        let result = pipeline
            .process(&mut ctx(), &Handler(trace.clone()))
            .await
            .unwrap();
        assert_eq!(result.code(), "stopped");
        assert_eq!(*trace.lock().unwrap(), vec!["a:before", "b:before", "a:after"]);
    }

    #[tokio::test]
    async fn repeated_process_calls_start_from_the_first_stage() {
        let trace = Trace::default();
        let pipeline = Pipeline::new(vec![stage("a", &trace, false)]);
        let handler = Handler(trace.clone());
        pipeline.process(&mut ctx(), &handler).await.unwrap();
        pipeline.process(&mut ctx(), &handler).await.unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["a:before", "handler", "a:after", "a:before", "handler", "a:after"]
        );
    }

    #[test]
    fn faults_map_to_result_codes() {
        let code = TaskFault::cannot_be_valid("bad payload").into_result_code();
        assert_eq!(code.code(), "cannotBeValid");
        assert_eq!(code.message(), "bad payload");

        let code = TaskFault::from(anyhow::anyhow!("boom")).into_result_code();
        assert_eq!(code.code(), "uncaughtException");
        assert_eq!(code.message(), "[error] boom");
    }
}
