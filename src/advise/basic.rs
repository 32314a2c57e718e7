//! Proceed, fail, abort, rollback and intervention advisers

use super::{Adviser, AdviserResponse, AdvisingEvent, InterventionTimeoutAction, RollbackMap};
use crate::core::{FailureType, Status};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Routes a successful node to an explicit next node instead of its edges
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnSuccessAdviser {
    pub next_node_id: Option<String>,
}

impl Adviser for OnSuccessAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_positive()
    }

    fn on_advise_event(&self, _event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        self.next_node_id.as_ref().map(|id| AdviserResponse::Proceed {
            next_node_ids: vec![id.clone()],
        })
    }
}

/// Continues at a failure-handling node, or ends the plan when none is named
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnFailAdviser {
    pub next_node_id: Option<String>,
}

impl Adviser for OnFailAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broken()
    }

    fn on_advise_event(&self, _event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        Some(match &self.next_node_id {
            Some(id) => AdviserResponse::Proceed {
                next_node_ids: vec![id.clone()],
            },
            None => AdviserResponse::EndPlan,
        })
    }
}

/// Ends the plan when a node is aborted or broken
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OnAbortAdviser {}

impl Adviser for OnAbortAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broken() || event.to_status == Status::Aborted
    }

    fn on_advise_event(&self, _event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        Some(AdviserResponse::EndPlan)
    }
}

/// Enters the rollback node mapped for the configured strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAdviser {
    /// Rollback strategy to use
    #[serde(default = "default_rollback_strategy")]
    pub strategy: String,

    /// Rollback node per strategy
    #[serde(default)]
    pub strategy_to_node: RollbackMap,
}

fn default_rollback_strategy() -> String {
    "STAGE_ROLLBACK".to_string()
}

impl Default for RollbackAdviser {
    fn default() -> Self {
        Self {
            strategy: default_rollback_strategy(),
            strategy_to_node: RollbackMap::new(),
        }
    }
}

impl Adviser for RollbackAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broken() && self.strategy_to_node.contains_key(&self.strategy)
    }

    fn on_advise_event(&self, _event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        self.strategy_to_node
            .get(&self.strategy)
            .map(|node_id| AdviserResponse::Rollback {
                strategy: self.strategy.clone(),
                node_id: node_id.clone(),
            })
    }
}

/// Parks a broken node until an operator resolves it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualInterventionAdviser {
    pub timeout_secs: u64,
    pub timeout_action: InterventionTimeoutAction,
    pub failure_types: BTreeSet<FailureType>,
}

impl Default for ManualInterventionAdviser {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            timeout_action: InterventionTimeoutAction::default(),
            failure_types: BTreeSet::new(),
        }
    }
}

impl Adviser for ManualInterventionAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        // Never re-park a node whose intervention window just ran out
        if !event.to_status.is_broken() || event.from_status == Status::InterventionWaiting {
            return false;
        }
        self.failure_types.is_empty() || event.failure_types().any(|t| self.failure_types.contains(&t))
    }

    fn on_advise_event(&self, _event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        Some(AdviserResponse::InterventionWaiting {
            timeout_secs: self.timeout_secs,
            timeout_action: self.timeout_action,
        })
    }
}

/// Treats any failure as success
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreAdviser {
    pub next_node_id: Option<String>,
}

impl Adviser for IgnoreAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broken()
    }

    fn on_advise_event(&self, _event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        Some(AdviserResponse::IgnoreFailure {
            next_node_id: self.next_node_id.clone(),
        })
    }
}
