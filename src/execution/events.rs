//! Events emitted while plans execute

use crate::{
    advise::AdviserResponse,
    core::{InterruptState, InterruptType, Status},
};
use std::sync::Arc;
use uuid::Uuid;

/// Events that can occur during plan execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    PlanStarted {
        plan_execution_id: Uuid,
        plan_id: String,
    },
    NodeStatusChanged {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        node_id: String,
        from: Status,
        to: Status,
    },
    AdviserResponded {
        node_execution_id: Uuid,
        node_id: String,
        response: AdviserResponse,
    },
    InterruptRegistered {
        plan_execution_id: Uuid,
        interrupt_id: Uuid,
        interrupt_type: InterruptType,
    },
    InterruptProcessed {
        plan_execution_id: Uuid,
        interrupt_id: Uuid,
        state: InterruptState,
    },
    PlanCompleted {
        plan_execution_id: Uuid,
        status: Status,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;
