//! Interrupt model - durable control-plane requests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Kind of control request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    /// Abort the whole plan execution, or one node subtree when targeted
    Abort,
    PauseAll,
    ResumeAll,
    /// Spawn a fresh attempt of the targeted node execution
    Retry,
    /// Timeout fired for the targeted node execution
    MarkExpired,
    MarkSuccess,
    MarkFailed,
    /// Ignore the failure of a node waiting for intervention
    Ignore,
}

impl InterruptType {
    /// Whether the interrupt must name a node execution
    pub fn requires_target(self) -> bool {
        matches!(
            self,
            InterruptType::Retry
                | InterruptType::MarkExpired
                | InterruptType::MarkSuccess
                | InterruptType::MarkFailed
                | InterruptType::Ignore
        )
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(value.as_str().unwrap_or_default())
    }
}

impl std::str::FromStr for InterruptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_ascii_uppercase()))
            .map_err(|_| format!("Unknown interrupt type: {}", s))
    }
}

/// Processing state of an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processing,
    ProcessedSuccessfully,
    ProcessedUnsuccessfully,
}

impl InterruptState {
    pub fn is_processed(self) -> bool {
        matches!(
            self,
            InterruptState::ProcessedSuccessfully | InterruptState::ProcessedUnsuccessfully
        )
    }
}

impl fmt::Display for InterruptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = serde_json::to_value(self).map_err(|_| fmt::Error)?;
        f.write_str(value.as_str().unwrap_or_default())
    }
}

impl std::str::FromStr for InterruptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_ascii_uppercase()))
            .map_err(|_| format!("Unknown interrupt state: {}", s))
    }
}

/// A durable control request against a plan execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub interrupt_type: InterruptType,
    pub state: InterruptState,
    pub created_at: DateTime<Utc>,

    /// Tie-breaker for interrupts created within the same instant
    pub seq: u64,

    pub node_execution_id: Option<Uuid>,

    /// Free-form metadata supplied by the caller
    #[serde(default)]
    pub metadata: Value,

    /// Why processing failed, if it did
    #[serde(default)]
    pub message: Option<String>,

    pub version: u64,
}

impl Interrupt {
    pub fn new(
        plan_execution_id: Uuid,
        interrupt_type: InterruptType,
        node_execution_id: Option<Uuid>,
        seq: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            plan_execution_id,
            interrupt_type,
            state: InterruptState::Registered,
            created_at: Utc::now(),
            seq,
            node_execution_id,
            metadata: Value::Null,
            message: None,
            version: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for interrupt history queries
#[derive(Debug, Clone, Default)]
pub struct InterruptFilter {
    pub states: Option<Vec<InterruptState>>,
    pub types: Option<Vec<InterruptType>>,
}

impl InterruptFilter {
    pub fn states(states: &[InterruptState]) -> Self {
        Self {
            states: Some(states.to_vec()),
            types: None,
        }
    }

    pub fn types(types: &[InterruptType]) -> Self {
        Self {
            states: None,
            types: Some(types.to_vec()),
        }
    }

    pub fn matches(&self, interrupt: &Interrupt) -> bool {
        self.states
            .as_ref()
            .map_or(true, |s| s.contains(&interrupt.state))
            && self
                .types
                .as_ref()
                .map_or(true, |t| t.contains(&interrupt.interrupt_type))
    }
}
