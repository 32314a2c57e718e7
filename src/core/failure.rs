//! Failure classification attached to broken executions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Classification of a step failure, used by retry advisers' applicability filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Timeout,
    Connectivity,
    Authentication,
    Authorization,
    Verification,
    Application,
    Unknown,
}

/// Structured failure reason readable by API collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,

    #[serde(default)]
    pub failure_types: BTreeSet<FailureType>,

    /// Interrupt that caused the failure (abort, expiry)
    #[serde(default)]
    pub interrupt_id: Option<Uuid>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self {
            message: message.into(),
            failure_types: BTreeSet::from([failure_type]),
            interrupt_id: None,
        }
    }

    pub fn with_types<I: IntoIterator<Item = FailureType>>(message: impl Into<String>, types: I) -> Self {
        Self {
            message: message.into(),
            failure_types: types.into_iter().collect(),
            interrupt_id: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt_id: Uuid) -> Self {
        self.interrupt_id = Some(interrupt_id);
        self
    }

    pub fn has_type(&self, failure_type: FailureType) -> bool {
        self.failure_types.contains(&failure_type)
    }
}
