//! Task dispatcher - hands long-running work to external workers
//!
//! Workers are addressed by a [`ScopingContext`] and are expected to eventually
//! publish a resume message carrying the task id as callback id.

pub mod local;

use crate::core::Ambiance;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use local::{LocalTaskExecutor, TaskHandler};

/// Error types for dispatch operations
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No worker can handle task type '{0}'")]
    NoWorker(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Worker pool rejected the task: {0}")]
    Rejected(String),

    #[error("Task failed: {0}")]
    Failed(String),
}

/// Account/org/project style routing key for the worker pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopingContext {
    pub values: BTreeMap<String, String>,
}

impl ScopingContext {
    pub fn from_ambiance(ambiance: &Ambiance) -> Self {
        Self {
            values: ambiance.setup_abstractions.clone(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// A unit of work for the worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Worker-side task type
    pub task_type: String,

    /// Node execution that waits for this task; resume messages are routed by it
    pub node_execution_id: Uuid,

    /// Opaque task payload
    #[serde(default)]
    pub parameters: Value,
}

impl TaskRequest {
    /// Build a request on behalf of the node execution the ambiance points at
    pub fn new(ambiance: &Ambiance, task_type: impl Into<String>, parameters: Value) -> Self {
        Self {
            task_type: task_type.into(),
            node_execution_id: ambiance.obtain_current_runtime_id().unwrap_or_default(),
            parameters,
        }
    }
}

/// Outcome reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failure,
    Expired,
    Aborted,
}

/// Opaque external result of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: TaskStatus,

    #[serde(default)]
    pub data: Value,

    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResponse {
    pub fn success(data: Value) -> Self {
        Self {
            status: TaskStatus::Success,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            data: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn expired() -> Self {
        Self {
            status: TaskStatus::Expired,
            data: Value::Null,
            error: Some("Task expired".to_string()),
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: TaskStatus::Aborted,
            data: Value::Null,
            error: Some("Task aborted".to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Trait for worker pools - allows for different implementations
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Enqueue a task without blocking, optionally holding it back before dispatch.
    /// Returns the task id, which doubles as callback id.
    async fn queue_task(
        &self,
        scope: &ScopingContext,
        request: TaskRequest,
        hold_for: Option<Duration>,
    ) -> Result<String, DispatchError>;

    /// Run a task and wait for its result
    async fn execute_task(
        &self,
        scope: &ScopingContext,
        request: TaskRequest,
    ) -> Result<TaskResponse, DispatchError>;

    /// Force-fail a still pending task
    async fn expire_task(&self, scope: &ScopingContext, task_id: &str) -> Result<(), DispatchError>;

    /// Best-effort cancellation; returns whether the task was still pending
    async fn abort_task(&self, scope: &ScopingContext, task_id: &str) -> Result<bool, DispatchError>;
}
