//! Execution status model and transition rules

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a node execution or a plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Created but not started yet
    Queued,
    /// Strategy is being invoked
    Running,
    /// Waiting for external task callbacks
    TaskWaiting,
    /// Waiting for a child node execution to conclude
    ChildWaiting,
    /// Broken node parked until an operator decides
    InterventionWaiting,
    /// Child chain gate waiting for an interrupt
    Suspended,
    /// Stopped accepting resumptions until RESUME_ALL
    Paused,
    /// Being torn down by an abort
    Discontinuing,
    Succeeded,
    Failed,
    Errored,
    Skipped,
    Aborted,
    Expired,
    /// Broken, but the failure was ignored by policy or by an operator
    IgnoreFailed,
}

impl Status {
    /// Statuses that are never left again
    pub const FINAL: &'static [Status] = &[
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Skipped,
        Status::Aborted,
        Status::Expired,
        Status::IgnoreFailed,
    ];

    /// Statuses that count as a failure for advisers and roll-up
    pub const BROKEN: &'static [Status] = &[Status::Failed, Status::Errored, Status::Expired];

    /// Statuses in which the engine is actively driving the node
    pub const FLOWING: &'static [Status] = &[
        Status::Running,
        Status::TaskWaiting,
        Status::ChildWaiting,
        Status::Discontinuing,
    ];

    /// Check if the status is terminal
    pub fn is_final(self) -> bool {
        Self::FINAL.contains(&self)
    }

    /// Check if the status is a failure
    pub fn is_broken(self) -> bool {
        Self::BROKEN.contains(&self)
    }

    pub fn is_flowing(self) -> bool {
        Self::FLOWING.contains(&self)
    }

    /// Terminal statuses that let the surrounding flow continue
    pub fn is_positive(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Skipped | Status::IgnoreFailed
        )
    }

    /// Check whether `self -> to` is a legal transition.
    ///
    /// Terminal statuses are final. The only exits from a broken status are the
    /// adviser-driven ones: parking for intervention and ignoring the failure.
    pub fn can_transition_to(self, to: Status) -> bool {
        if self == to {
            return false;
        }
        if self.is_broken() {
            return matches!(to, Status::InterventionWaiting | Status::IgnoreFailed);
        }
        if self.is_final() {
            return false;
        }
        match (self, to) {
            (_, Status::Aborted | Status::Discontinuing | Status::Expired | Status::Errored) => true,
            (Status::Queued, Status::Running | Status::Skipped | Status::Paused) => true,
            (Status::Queued, _) => false,
            (Status::Running, _) => to != Status::Queued,
            (Status::TaskWaiting, Status::Paused) => true,
            (Status::Paused, Status::TaskWaiting | Status::Queued) => true,
            (Status::InterventionWaiting, Status::Failed | Status::Succeeded | Status::IgnoreFailed) => true,
            (Status::Suspended, Status::Running | Status::Succeeded | Status::Failed) => true,
            (Status::Discontinuing, _) => false,
            (Status::ChildWaiting, Status::Suspended) => true,
            (Status::TaskWaiting | Status::ChildWaiting, _) => to.is_final() || to == Status::Running,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::ChildWaiting => "CHILD_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Suspended => "SUSPENDED",
            Status::Paused => "PAUSED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Skipped => "SKIPPED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::IgnoreFailed => "IGNORE_FAILED",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_ascii_uppercase()))
            .map_err(|_| format!("Unknown status: {}", s))
    }
}

/// Roll a set of child statuses up into the status of their owner.
///
/// Any broken child makes the result FAILED, otherwise any abort makes it ABORTED.
pub fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
    let mut result = Status::Succeeded;
    for status in statuses {
        if status.is_broken() {
            return Status::Failed;
        }
        if status == Status::Aborted {
            result = Status::Aborted;
        }
    }
    result
}
