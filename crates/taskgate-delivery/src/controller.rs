//! Binds an inbound delivery to its task type, runs the pipeline and maps the outcome to a status.

use crate::context::TaskContext;
use crate::pipeline::{Pipeline, TaskHandler};
use crate::stages::logging::log_result;
use regex::Regex;
use std::{collections::HashMap, sync::Arc};
use taskgate_core::{Error, ResultCode, StatusMapper};
use tokio::time::Instant;

pub const TASK_TYPE_GROUP: &str = "task_type";

/// Looks up the application handler for a task type.
pub trait HandlerRegistry: Send + Sync {
    fn handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>>;
}

#[derive(Clone, Default)]
pub struct MapHandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for MapHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut task_types: Vec<_> = self.handlers.keys().collect();
        task_types.sort();
        f.debug_struct("MapHandlerRegistry")
            .field("task_types", &task_types)
            .finish()
    }
}

impl MapHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.insert(task_type, handler);
        self
    }

    pub fn insert(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }
}

impl HandlerRegistry for MapHandlerRegistry {
    fn handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }
}

/// What the HTTP layer sends back to the queue.
#[derive(Debug, Clone)]
pub struct TaskResponse {
    pub http_status: u16,
    pub label: String,
    pub result: ResultCode,
}

pub struct Controller {
    pattern: Regex,
    pipeline: Pipeline,
    handlers: Arc<dyn HandlerRegistry>,
    mapper: Arc<StatusMapper>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("pattern", &self.pattern.as_str())
            .field("pipeline", &self.pipeline)
            .field("handlers", &"<HandlerRegistry>")
            .finish()
    }
}

impl Controller {
    /// `pattern` must contain a `task_type` named group.
    pub fn new(
        pattern: &str,
        pipeline: Pipeline,
        handlers: Arc<dyn HandlerRegistry>,
        mapper: Arc<StatusMapper>,
    ) -> taskgate_core::Result<Self> {
        let pattern = Regex::new(pattern).map_err(|err| {
            Error::configuration(format!("invalid task URL pattern `{pattern}`: {err}"))
        })?;
        if !pattern
            .capture_names()
            .any(|name| name == Some(TASK_TYPE_GROUP))
        {
            return Err(Error::configuration(format!(
                "task URL pattern `{}` has no `{TASK_TYPE_GROUP}` named group",
                pattern.as_str()
            )));
        }
        Ok(Self {
            pattern,
            pipeline,
            handlers,
            mapper,
        })
    }

    pub fn mapper(&self) -> &StatusMapper {
        &self.mapper
    }

    /// Task type addressed by a request path.
    pub fn route(&self, path: &str) -> taskgate_core::Result<String> {
        self.pattern
            .captures(path)
            .and_then(|caps| caps.name(TASK_TYPE_GROUP))
            .map(|task_type| task_type.as_str().to_string())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "URL path `{path}` does not match task URL pattern `{}`",
                    self.pattern.as_str()
                ))
            })
    }

    /// Run one delivery. Only wiring faults (an unmapped result code) surface as `Err`.
    pub async fn handle(&self, mut ctx: TaskContext) -> taskgate_core::Result<TaskResponse> {
        let result = match self.handlers.handler(ctx.task_type()) {
            Some(handler) => match self.pipeline.process(&mut ctx, handler.as_ref()).await {
                Ok(result) => result,
                Err(fault) => fault.into_result_code(),
            },
            None => {
                let started = Instant::now();
                let result = ResultCode::handler_not_found(ctx.task_type());
                log_result(&self.mapper, &ctx, &result, started.elapsed());
                result
            }
        };

        let mapped = self.mapper.resolve(&result)?;
        Ok(TaskResponse {
            http_status: mapped.http_status,
            label: mapped.label,
            result,
        })
    }
}
