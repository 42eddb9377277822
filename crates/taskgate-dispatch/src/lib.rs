//! Client side of taskgate: resolve a task type and options into a dispatch request and submit it
//! to the queue service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use taskgate_core::{
    DispatchOptions, Error, Result, TaskQueueClient, TaskTypeRegistry,
};

pub mod cloud_tasks;
pub mod encoding;
pub mod request;
pub mod testing;

pub use request::{build_request, DispatchRequestBuilder};

/// Outcome of a successful create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchHandle {
    /// Full task name, either queue-assigned or derived from the dedup id.
    pub name: String,
    /// The queue already held a task with this name and the caller opted out of duplicate errors.
    pub deduplicated: bool,
}

/// Application-facing entry point for creating tasks.
#[async_trait]
pub trait CreateTask: Send + Sync {
    async fn create(&self, task_type: &str, options: DispatchOptions) -> Result<DispatchHandle>;
}

pub struct TaskCreator {
    builder: DispatchRequestBuilder,
    client: Arc<dyn TaskQueueClient>,
}

impl std::fmt::Debug for TaskCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCreator")
            .field("builder", &self.builder)
            .field("client", &"<TaskQueueClient>")
            .finish()
    }
}

impl TaskCreator {
    pub fn new(registry: Arc<TaskTypeRegistry>, client: Arc<dyn TaskQueueClient>) -> Self {
        Self {
            builder: DispatchRequestBuilder::new(registry),
            client,
        }
    }

    pub async fn create_at(
        &self,
        task_type: &str,
        options: DispatchOptions,
        now: DateTime<Utc>,
    ) -> Result<DispatchHandle> {
        let config = self.builder.registry().get(task_type)?;
        let request = request::build_request(config, &options, now)?;

        let err = match self.client.create_task(&request, &config.create_retry).await {
            Ok(created) => {
                tracing::debug!(
                    event = "dispatch.task.created",
                    task_type = %request.task_type,
                    task_name = %created.name,
                    "created task"
                );
                return Ok(DispatchHandle {
                    name: created.name,
                    deduplicated: false,
                });
            }
            Err(err) => err,
        };

        if err.is_already_exists() && !options.throw_on_duplicate() {
            if let Some(name) = request.name {
                tracing::debug!(
                    event = "dispatch.task.duplicate_ignored",
                    task_type = %request.task_type,
                    task_name = %name,
                    "task already exists"
                );
                return Ok(DispatchHandle {
                    name,
                    deduplicated: true,
                });
            }
        }

        tracing::error!(
            event = "dispatch.task.create_failed",
            url = %request.url,
            task_type = %request.task_type,
            queue_path = %request.queue_path,
            rpc_code = %err.code,
            error = %err,
            "failed to create task"
        );
        let message = format!("Failed to create task: {err}");
        Err(Error::task_creation_failed(message, err.into_inner()))
    }
}

#[async_trait]
impl CreateTask for TaskCreator {
    async fn create(&self, task_type: &str, options: DispatchOptions) -> Result<DispatchHandle> {
        self.create_at(task_type, options, Utc::now()).await
    }
}
