//! Retry adviser

use super::{Adviser, AdviserResponse, AdvisingEvent, InterventionTimeoutAction};
use crate::core::FailureType;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

/// Longest wait a retry may ask for (one year)
pub const MAX_WAIT_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// What the retry adviser does once retries are exhausted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairAction {
    /// Treat the failure as success and continue, optionally at a named node
    Ignore {
        #[serde(default)]
        next_node_id: Option<String>,
    },

    /// Park the node for a human decision
    ManualIntervention {
        timeout_secs: u64,
        #[serde(default)]
        timeout_action: InterventionTimeoutAction,
    },

    /// Stop the whole plan
    EndExecution,

    /// Let the failure roll up
    #[default]
    MarkAsFailure,
}

/// Retries broken nodes with per-attempt wait intervals.
///
/// One interval is consumed per attempt; the last one is reused once attempts
/// outnumber the list. An empty `failure_types` set applies to every failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryAdviser {
    #[serde(deserialize_with = "bounded_intervals")]
    pub wait_intervals_secs: Vec<u64>,
    pub max_retries: usize,
    pub repair_action: RepairAction,
    pub failure_types: BTreeSet<FailureType>,
}

fn bounded_intervals<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let intervals = Vec::<u64>::deserialize(deserializer)?;
    match intervals.iter().find(|secs| **secs > MAX_WAIT_INTERVAL_SECS) {
        Some(secs) => Err(serde::de::Error::custom(format!(
            "wait interval of {}s exceeds the maximum of {}s",
            secs, MAX_WAIT_INTERVAL_SECS
        ))),
        None => Ok(intervals),
    }
}

impl RetryAdviser {
    pub fn new(wait_intervals_secs: Vec<u64>, max_retries: usize, repair_action: RepairAction) -> Self {
        Self {
            wait_intervals_secs,
            max_retries,
            repair_action,
            failure_types: BTreeSet::new(),
        }
    }

    pub fn for_failure_types<I: IntoIterator<Item = FailureType>>(mut self, types: I) -> Self {
        self.failure_types = types.into_iter().collect();
        self
    }

    /// Wait before attempt number `attempt` (zero-based count of earlier retries)
    pub fn wait_interval(&self, attempt: usize) -> u64 {
        match self.wait_intervals_secs.len() {
            0 => 0,
            len => self.wait_intervals_secs[attempt.min(len - 1)],
        }
    }

    fn repair(&self) -> Option<AdviserResponse> {
        match &self.repair_action {
            RepairAction::Ignore { next_node_id } => Some(AdviserResponse::IgnoreFailure {
                next_node_id: next_node_id.clone(),
            }),
            RepairAction::ManualIntervention {
                timeout_secs,
                timeout_action,
            } => Some(AdviserResponse::InterventionWaiting {
                timeout_secs: *timeout_secs,
                timeout_action: *timeout_action,
            }),
            RepairAction::EndExecution => Some(AdviserResponse::EndPlan),
            RepairAction::MarkAsFailure => None,
        }
    }
}

impl Adviser for RetryAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        if !event.to_status.is_broken() {
            return false;
        }
        self.failure_types.is_empty() || event.failure_types().any(|t| self.failure_types.contains(&t))
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        let attempt = event.retry_attempt();
        if attempt < self.max_retries {
            Some(AdviserResponse::Retry {
                wait_interval_secs: self.wait_interval(attempt),
                attempt: attempt + 1,
            })
        } else {
            self.repair()
        }
    }
}
