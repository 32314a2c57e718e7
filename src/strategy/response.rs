//! Responses produced by executable strategies

use super::StrategyError;
use crate::core::{FailureInfo, FailureType, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Final result of a strategy invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,

    #[serde(default)]
    pub outcome: Option<Value>,

    #[serde(default)]
    pub failure: Option<FailureInfo>,
}

impl StepResponse {
    pub fn success(outcome: Option<Value>) -> Self {
        Self {
            status: Status::Succeeded,
            outcome,
            failure: None,
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            outcome: None,
            failure: Some(failure),
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            outcome: None,
            failure: None,
        }
    }
}

/// Callback ids an async strategy waits on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncExecutableResponse {
    pub callback_ids: Vec<String>,
}

/// The single child a child strategy wants to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutableResponse {
    pub child_node_id: String,

    #[serde(default)]
    pub additional_inputs: Value,
}

impl ChildExecutableResponse {
    pub fn new(child_node_id: impl Into<String>) -> Self {
        Self {
            child_node_id: child_node_id.into(),
            additional_inputs: Value::Null,
        }
    }
}

#[derive(Deserialize)]
struct RawChildChainResponse {
    next_child_id: Option<String>,
    previous_child_id: Option<String>,
    #[serde(default)]
    pass_through_data: Option<Value>,
    #[serde(default)]
    last_link: bool,
    #[serde(default)]
    suspend: bool,
}

/// One step of a child chain.
///
/// A response that neither names a next child nor suspends could never make
/// progress, so it cannot be constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawChildChainResponse")]
pub struct ChildChainResponse {
    next_child_id: Option<String>,
    previous_child_id: Option<String>,
    pass_through_data: Option<Value>,
    last_link: bool,
    suspend: bool,
}

impl ChildChainResponse {
    pub fn try_new(
        next_child_id: Option<String>,
        previous_child_id: Option<String>,
        pass_through_data: Option<Value>,
        last_link: bool,
        suspend: bool,
    ) -> Result<Self, StrategyError> {
        if !suspend && next_child_id.is_none() {
            return Err(StrategyError::InvalidChainResponse(
                "a chain link that does not suspend must name a next child".to_string(),
            ));
        }
        Ok(Self {
            next_child_id,
            previous_child_id,
            pass_through_data,
            last_link,
            suspend,
        })
    }

    /// Run `next_child_id` next
    pub fn next(
        next_child_id: impl Into<String>,
        previous_child_id: Option<String>,
        pass_through_data: Option<Value>,
        last_link: bool,
    ) -> Self {
        Self {
            next_child_id: Some(next_child_id.into()),
            previous_child_id,
            pass_through_data,
            last_link,
            suspend: false,
        }
    }

    /// Park the parent until an interrupt resolves it
    pub fn suspended(previous_child_id: Option<String>, pass_through_data: Option<Value>) -> Self {
        Self {
            next_child_id: None,
            previous_child_id,
            pass_through_data,
            last_link: false,
            suspend: true,
        }
    }

    pub fn next_child_id(&self) -> Option<&str> {
        self.next_child_id.as_deref()
    }

    pub fn previous_child_id(&self) -> Option<&str> {
        self.previous_child_id.as_deref()
    }

    pub fn pass_through_data(&self) -> Option<&Value> {
        self.pass_through_data.as_ref()
    }

    pub fn last_link(&self) -> bool {
        self.last_link
    }

    pub fn suspend(&self) -> bool {
        self.suspend
    }
}

impl TryFrom<RawChildChainResponse> for ChildChainResponse {
    type Error = StrategyError;

    fn try_from(raw: RawChildChainResponse) -> Result<Self, Self::Error> {
        Self::try_new(
            raw.next_child_id,
            raw.previous_child_id,
            raw.pass_through_data,
            raw.last_link,
            raw.suspend,
        )
    }
}

/// What a strategy answered when it was started, kept on the node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync { status: Status },
    Async { callback_ids: Vec<String> },
    Child { child_node_id: String },
    ChildChain(ChildChainResponse),
}

/// Rolled-up result of a child round, handed back to the parent strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildOutcome {
    /// Child node execution that was started for the round
    pub node_execution_id: Uuid,
    pub node_id: String,

    /// Aggregate status of every execution in the round
    pub status: Status,

    pub outcome: Option<Value>,
    pub failure: Option<FailureInfo>,

    /// Zero-based chain link the round ran for; always 0 outside chains
    #[serde(default)]
    pub link: usize,
}

impl ChildOutcome {
    /// Default parent response for a finished child
    pub fn to_step_response(&self) -> StepResponse {
        match self.status {
            s if s.is_positive() => StepResponse::success(self.outcome.clone()),
            Status::Aborted => StepResponse::with_status(Status::Aborted),
            _ => StepResponse::failed(self.failure.clone().unwrap_or_else(|| {
                FailureInfo::new(format!("Child '{}' did not succeed", self.node_id), FailureType::Unknown)
            })),
        }
    }
}
