//! In-process worker pool backed by tokio tasks

use super::{DispatchError, ScopingContext, TaskExecutor, TaskRequest, TaskResponse};
use crate::consumer::{EngineMessage, Publisher};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Work performed for one task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, scope: &ScopingContext, request: &TaskRequest) -> TaskResponse;
}

struct PendingTask {
    node_execution_id: Uuid,
    handle: JoinHandle<()>,
}

/// Runs tasks on the local runtime and reports results through the resume consumer
pub struct LocalTaskExecutor {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    publisher: Publisher,
    pending: Arc<Mutex<HashMap<String, PendingTask>>>,
}

impl LocalTaskExecutor {
    pub fn new(publisher: Publisher) -> Self {
        Self {
            handlers: HashMap::new(),
            publisher,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a handler for a task type
    pub fn register(mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    /// Number of tasks queued or running
    pub async fn pending_tasks(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn handler(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>, DispatchError> {
        self.handlers
            .get(task_type)
            .cloned()
            .ok_or_else(|| DispatchError::NoWorker(task_type.to_string()))
    }

    fn report(&self, node_execution_id: Uuid, task_id: &str, response: TaskResponse) {
        let message = EngineMessage::Resume {
            node_execution_id,
            callback_id: task_id.to_string(),
            response,
        };
        if let Err(e) = self.publisher.publish(message) {
            warn!("Dropping result of task {}: {}", task_id, e);
        }
    }
}

#[async_trait]
impl TaskExecutor for LocalTaskExecutor {
    async fn queue_task(
        &self,
        scope: &ScopingContext,
        request: TaskRequest,
        hold_for: Option<Duration>,
    ) -> Result<String, DispatchError> {
        let handler = self.handler(&request.task_type)?;
        let task_id = Uuid::new_v4().to_string();
        let node_execution_id = request.node_execution_id;

        debug!("Queueing task {} ({}) for node execution {}", task_id, request.task_type, node_execution_id);

        // Held across spawn and insert so a fast task cannot unregister before it is registered
        let mut pending = self.pending.lock().await;

        let handle = {
            let task_id = task_id.clone();
            let scope = scope.clone();
            let publisher = self.publisher.clone();
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                if let Some(delay) = hold_for {
                    tokio::time::sleep(delay).await;
                }
                let response = handler.run(&scope, &request).await;
                if pending.lock().await.remove(&task_id).is_none() {
                    return;
                }
                let message = EngineMessage::Resume {
                    node_execution_id,
                    callback_id: task_id.clone(),
                    response,
                };
                if let Err(e) = publisher.publish(message) {
                    warn!("Dropping result of task {}: {}", task_id, e);
                }
            })
        };

        pending.insert(
            task_id.clone(),
            PendingTask {
                node_execution_id,
                handle,
            },
        );

        Ok(task_id)
    }

    async fn execute_task(
        &self,
        scope: &ScopingContext,
        request: TaskRequest,
    ) -> Result<TaskResponse, DispatchError> {
        let handler = self.handler(&request.task_type)?;
        Ok(handler.run(scope, &request).await)
    }

    async fn expire_task(&self, _scope: &ScopingContext, task_id: &str) -> Result<(), DispatchError> {
        let task = self
            .pending
            .lock()
            .await
            .remove(task_id)
            .ok_or_else(|| DispatchError::UnknownTask(task_id.to_string()))?;

        task.handle.abort();
        info!("Expired task {}", task_id);
        self.report(task.node_execution_id, task_id, TaskResponse::expired());
        Ok(())
    }

    async fn abort_task(&self, _scope: &ScopingContext, task_id: &str) -> Result<bool, DispatchError> {
        let Some(task) = self.pending.lock().await.remove(task_id) else {
            return Ok(false);
        };

        task.handle.abort();
        info!("Aborted task {}", task_id);
        self.report(task.node_execution_id, task_id, TaskResponse::aborted());
        Ok(true)
    }
}

/// Handler that echoes its parameters back as result data
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn run(&self, _scope: &ScopingContext, request: &TaskRequest) -> TaskResponse {
        TaskResponse::success(request.parameters.clone())
    }
}

/// Handler that sleeps for `parameters.duration_ms` before succeeding
pub struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn run(&self, _scope: &ScopingContext, request: &TaskRequest) -> TaskResponse {
        let millis = request
            .parameters
            .get("duration_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        TaskResponse::success(request.parameters.clone())
    }
}
