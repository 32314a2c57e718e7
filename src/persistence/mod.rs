//! Persistence layer for plans, executions and interrupts
//!
//! Every mutable record carries a `version`. Updates are conditional: they only
//! land when the stored version still equals the version the caller read, and a
//! stale write fails with [`StoreError::Conflict`] so the caller can re-read and
//! decide whether its transition still applies.

pub mod memory;
pub mod retry;

#[cfg(feature = "sqlite")]
pub mod store;

pub use memory::InMemoryStore;
pub use retry::with_retry;

#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

use crate::core::{Interrupt, InterruptFilter, InterruptState, NodeExecution, Plan, PlanExecution, Status};
use thiserror::Error;
use uuid::Uuid;

/// Error types for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Stale write to {entity} {id}")]
    Conflict { entity: &'static str, id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Save (or replace) a plan
    async fn save_plan(&self, plan: &Plan) -> StoreResult<()>;

    async fn get_plan(&self, plan_id: &str) -> StoreResult<Option<Plan>>;

    async fn insert_plan_execution(&self, execution: &PlanExecution) -> StoreResult<()>;

    async fn get_plan_execution(&self, id: Uuid) -> StoreResult<Option<PlanExecution>>;

    /// Conditional update; returns the stored record with its new version
    async fn update_plan_execution(&self, execution: &PlanExecution) -> StoreResult<PlanExecution>;

    /// Most recent plan executions first
    async fn list_plan_executions(&self, limit: usize) -> StoreResult<Vec<PlanExecution>>;

    async fn insert_node_execution(&self, execution: &NodeExecution) -> StoreResult<()>;

    async fn get_node_execution(&self, id: Uuid) -> StoreResult<Option<NodeExecution>>;

    /// Conditional update; returns the stored record with its new version
    async fn update_node_execution(&self, execution: &NodeExecution) -> StoreResult<NodeExecution>;

    /// Node execution that issued a callback id (pending or resolved)
    async fn find_node_execution_by_callback(&self, callback_id: &str) -> StoreResult<Option<NodeExecution>>;

    /// All node executions of a plan execution, ordered by creation time
    async fn node_executions_for_plan(&self, plan_execution_id: Uuid) -> StoreResult<Vec<NodeExecution>>;

    /// Node executions in any of the given statuses, across plan executions
    async fn node_executions_with_status(&self, statuses: &[Status]) -> StoreResult<Vec<NodeExecution>>;

    /// Children of a node execution, ordered by creation time
    async fn children_of(&self, parent_id: Uuid) -> StoreResult<Vec<NodeExecution>>;

    /// Persist a new interrupt, assigning its per-plan sequence number
    async fn insert_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt>;

    async fn get_interrupt(&self, id: Uuid) -> StoreResult<Option<Interrupt>>;

    /// Conditional update; returns the stored record with its new version
    async fn update_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt>;

    /// Interrupts of a plan execution, newest first
    async fn interrupts_for_plan(
        &self,
        plan_execution_id: Uuid,
        filter: &InterruptFilter,
    ) -> StoreResult<Vec<Interrupt>>;

    /// Node executions of a plan, skipping attempts replaced by a retry
    async fn node_executions_without_old_retries(&self, plan_execution_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        let mut executions = self.node_executions_for_plan(plan_execution_id).await?;
        executions.retain(|e| !e.old_retry);
        Ok(executions)
    }

    /// Interrupts still waiting to be processed, oldest first
    async fn registered_interrupts(&self, plan_execution_id: Uuid) -> StoreResult<Vec<Interrupt>> {
        let mut interrupts = self
            .interrupts_for_plan(plan_execution_id, &InterruptFilter::states(&[InterruptState::Registered]))
            .await?;
        interrupts.reverse();
        Ok(interrupts)
    }
}

/// Creation order of two interrupts of the same plan execution
pub(crate) fn interrupt_order(a: &Interrupt, b: &Interrupt) -> std::cmp::Ordering {
    a.seq.cmp(&b.seq).then(a.created_at.cmp(&b.created_at))
}
