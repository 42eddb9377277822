//! In-process doubles for code that creates tasks.

use crate::{CreateTask, DispatchHandle};
use async_trait::async_trait;
use std::sync::Mutex;
use taskgate_core::{
    CreatedTask, DispatchOptions, DispatchRequest, Error, QueueError, Result, RetryPolicy,
    RpcCode, TaskQueueClient,
};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Records every submitted request; answers with the request's name or a generated one.
#[derive(Debug, Default)]
pub struct RecordingQueueClient {
    requests: Mutex<Vec<(DispatchRequest, RetryPolicy)>>,
    failures: Mutex<Vec<(RpcCode, String)>>,
}

impl RecordingQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next create call with `code`. Primed failures are used in order.
    pub fn fail_next(&self, code: RpcCode, message: impl Into<String>) {
        lock(&self.failures).push((code, message.into()));
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        lock(&self.requests)
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }

    pub fn retry_policies(&self) -> Vec<RetryPolicy> {
        lock(&self.requests)
            .iter()
            .map(|(_, retry)| retry.clone())
            .collect()
    }
}

#[async_trait]
impl TaskQueueClient for RecordingQueueClient {
    async fn create_task(
        &self,
        request: &DispatchRequest,
        retry: &RetryPolicy,
    ) -> std::result::Result<CreatedTask, QueueError> {
        lock(&self.requests).push((request.clone(), retry.clone()));

        let failure = {
            let mut failures = lock(&self.failures);
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        if let Some((code, message)) = failure {
            return Err(QueueError::msg(code, message));
        }

        let name = request.name.clone().unwrap_or_else(|| {
            format!("{}/tasks/{}", request.queue_path, Uuid::new_v4().simple())
        });
        Ok(CreatedTask { name })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub task_type: String,
    pub options: DispatchOptions,
}

/// Stand-in for [`crate::TaskCreator`] in application tests.
#[derive(Debug, Default)]
pub struct RecordingTaskCreator {
    calls: Mutex<Vec<RecordedCall>>,
    fail_with: Option<String>,
}

impl RecordingTaskCreator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call records, then fails as a task creation failure with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: Mutex::default(),
            fail_with: Some(message.into()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn ensure_nothing_queued(&self) -> anyhow::Result<()> {
        let calls = lock(&self.calls);
        anyhow::ensure!(calls.is_empty(), "expected no tasks, got {:?}", *calls);
        Ok(())
    }

    pub fn ensure_queued_exactly(&self, expected: &[RecordedCall]) -> anyhow::Result<()> {
        let calls = lock(&self.calls);
        anyhow::ensure!(
            calls.as_slice() == expected,
            "expected {expected:?}, got {:?}",
            *calls
        );
        Ok(())
    }
}

#[async_trait]
impl CreateTask for RecordingTaskCreator {
    async fn create(&self, task_type: &str, options: DispatchOptions) -> Result<DispatchHandle> {
        lock(&self.calls).push(RecordedCall {
            task_type: task_type.to_string(),
            options,
        });

        if let Some(message) = &self.fail_with {
            return Err(Error::task_creation_failed(
                "Failed to create task",
                anyhow::anyhow!(message.clone()),
            ));
        }

        Ok(DispatchHandle {
            name: Uuid::new_v4().simple().to_string(),
            deduplicated: false,
        })
    }
}
