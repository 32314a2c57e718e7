//! Durable execution records
//!
//! `PlanExecution` and `NodeExecution` are the only shared mutable state in the
//! engine. Every write goes through a conditional update keyed by `version`.
//! Relations (parent, previous sibling, retry chain) are plain ids, never live
//! references.

use crate::{
    advise::AdviserResponse,
    core::{ambiance::Ambiance, failure::FailureInfo, interrupt::InterruptType, plan::ExecutionMode, status::Status},
    dispatch::TaskResponse,
    strategy::{ChildChainResponse, ExecutableResponse},
    timeout::TimeoutInstance,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// One triggered run of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan_id: String,
    pub status: Status,

    /// Root ambiance (no levels)
    pub ambiance: Ambiance,

    pub root_node_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub failure: Option<FailureInfo>,

    /// Interrupt that ended the run (abort)
    #[serde(default)]
    pub interrupt_id: Option<Uuid>,

    /// Optimistic lock version
    pub version: u64,
}

impl PlanExecution {
    pub fn new(ambiance: Ambiance) -> Self {
        let now = Utc::now();
        Self {
            id: ambiance.plan_execution_id,
            plan_id: ambiance.plan_id.clone(),
            status: Status::Running,
            ambiance,
            root_node_execution_id: None,
            created_at: now,
            started_at: Some(now),
            ended_at: None,
            failure: None,
            interrupt_id: None,
            version: 0,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }
}

/// Record of an interrupt applied to a node execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: Uuid,
    pub interrupt_type: InterruptType,
    pub applied_at: DateTime<Utc>,
}

/// One runtime occurrence of a plan node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,

    /// Setup node this occurrence was instantiated from
    pub node_id: String,

    /// Ambiance snapshot; its last level points at this execution
    pub ambiance: Ambiance,

    pub status: Status,
    pub mode: ExecutionMode,

    /// Owning node execution (looked up by id)
    pub parent_id: Option<Uuid>,

    /// Child round of the parent this execution belongs to
    #[serde(default)]
    pub parent_round: u32,

    /// Sibling that proceeded into this one
    pub previous_id: Option<Uuid>,

    /// Earlier attempts, oldest first
    #[serde(default)]
    pub retry_ids: Vec<Uuid>,

    /// Set once a newer attempt replaced this one
    #[serde(default)]
    pub old_retry: bool,

    /// Inputs handed down by the parent's child response
    #[serde(default)]
    pub additional_inputs: Value,

    /// State carried between child chain links
    #[serde(default)]
    pub pass_through_data: Option<Value>,

    /// Callback ids that have not resolved yet
    #[serde(default)]
    pub pending_callbacks: BTreeSet<String>,

    /// Resolved callback results, keyed by callback id
    #[serde(default)]
    pub resolved_responses: BTreeMap<String, TaskResponse>,

    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,

    #[serde(default)]
    pub adviser_responses: Vec<AdviserResponse>,

    #[serde(default)]
    pub timeout: Option<TimeoutInstance>,

    #[serde(default)]
    pub outcome: Option<Value>,

    #[serde(default)]
    pub failure: Option<FailureInfo>,

    #[serde(default)]
    pub interrupt_history: Vec<InterruptEffect>,

    /// Incremented every time the node waits on a new child
    #[serde(default)]
    pub child_round: u32,

    /// Adviser decision applied; the node no longer blocks its parent
    #[serde(default)]
    pub concluded: bool,

    /// Status to return to when leaving PAUSED or INTERVENTION_WAITING
    #[serde(default)]
    pub held_from: Option<Status>,

    /// Do not start before this instant (retry wait interval)
    #[serde(default)]
    pub queued_until: Option<DateTime<Utc>>,

    /// Last progress payload reported by a worker
    #[serde(default)]
    pub progress: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic lock version
    pub version: u64,
}

impl NodeExecution {
    /// Create a queued node execution
    pub fn new(id: Uuid, node_id: impl Into<String>, mode: ExecutionMode, ambiance: Ambiance) -> Self {
        let now = Utc::now();
        Self {
            id,
            plan_execution_id: ambiance.plan_execution_id,
            node_id: node_id.into(),
            ambiance,
            status: Status::Queued,
            mode,
            parent_id: None,
            parent_round: 0,
            previous_id: None,
            retry_ids: Vec::new(),
            old_retry: false,
            additional_inputs: Value::Null,
            pass_through_data: None,
            pending_callbacks: BTreeSet::new(),
            resolved_responses: BTreeMap::new(),
            executable_responses: Vec::new(),
            adviser_responses: Vec::new(),
            timeout: None,
            outcome: None,
            failure: None,
            interrupt_history: Vec::new(),
            child_round: 0,
            concluded: false,
            held_from: None,
            queued_until: None,
            progress: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
            version: 0,
        }
    }

    /// Number of earlier attempts of this occurrence
    pub fn retry_attempt(&self) -> usize {
        self.retry_ids.len()
    }

    /// Latest child chain response, if the node runs a chain
    pub fn last_chain_response(&self) -> Option<&ChildChainResponse> {
        self.executable_responses.iter().rev().find_map(|r| match r {
            ExecutableResponse::ChildChain(chain) => Some(chain),
            _ => None,
        })
    }

    /// Number of chain links started so far
    pub fn chain_links(&self) -> usize {
        self.executable_responses
            .iter()
            .filter(|r| matches!(r, ExecutableResponse::ChildChain(_)))
            .count()
    }

    /// Apply a status change, stamping timestamps
    pub fn set_status(&mut self, status: Status) {
        let now = Utc::now();
        if status == Status::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_final() {
            self.ended_at = Some(now);
        }
        self.status = status;
    }

    pub fn record_interrupt(&mut self, interrupt_id: Uuid, interrupt_type: InterruptType) {
        self.interrupt_history.push(InterruptEffect {
            interrupt_id,
            interrupt_type,
            applied_at: Utc::now(),
        });
    }
}
