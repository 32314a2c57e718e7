//! Messages consumed by the resume event consumer

use crate::{core::Status, dispatch::TaskResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Logical queue a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    NodeStart,
    NodeResume,
    NodeAdvise,
    ChildConcluded,
    Progress,
    Interrupt,
}

/// A unit of work for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineMessage {
    /// Start a queued node execution
    StartNode { node_execution_id: Uuid },

    /// A callback resolved
    Resume {
        node_execution_id: Uuid,
        callback_id: String,
        response: TaskResponse,
    },

    /// Re-evaluate a node whose callbacks may have resolved while it was held
    Wake { node_execution_id: Uuid },

    /// Consult the adviser chain after a status change
    Advise {
        node_execution_id: Uuid,
        from_status: Status,
    },

    /// All children of a parent round concluded
    ChildConcluded { parent_id: Uuid, child_round: u32 },

    /// Progress heartbeat from a worker
    Progress { node_execution_id: Uuid, data: Value },

    /// Drain registered interrupts of a plan execution
    Interrupt { plan_execution_id: Uuid },
}

impl EngineMessage {
    /// Key used to pick a partition. Node messages are keyed by node execution id,
    /// interrupts by plan execution id.
    pub fn partition_key(&self) -> Uuid {
        match self {
            EngineMessage::StartNode { node_execution_id }
            | EngineMessage::Resume { node_execution_id, .. }
            | EngineMessage::Wake { node_execution_id }
            | EngineMessage::Advise { node_execution_id, .. }
            | EngineMessage::Progress { node_execution_id, .. } => *node_execution_id,
            EngineMessage::ChildConcluded { parent_id, .. } => *parent_id,
            EngineMessage::Interrupt { plan_execution_id } => *plan_execution_id,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            EngineMessage::StartNode { .. } => MessageKind::NodeStart,
            EngineMessage::Resume { .. } | EngineMessage::Wake { .. } => MessageKind::NodeResume,
            EngineMessage::Advise { .. } => MessageKind::NodeAdvise,
            EngineMessage::ChildConcluded { .. } => MessageKind::ChildConcluded,
            EngineMessage::Progress { .. } => MessageKind::Progress,
            EngineMessage::Interrupt { .. } => MessageKind::Interrupt,
        }
    }
}
