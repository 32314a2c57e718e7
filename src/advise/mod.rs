//! Adviser chain - decides what happens after a node reaches a terminal-ish status
//!
//! Nodes declare advisers by type name together with the statuses that should
//! trigger them. The registry turns each declaration into an [`Adviser`] and the
//! first one whose predicate matches produces the [`AdviserResponse`].

pub mod basic;
pub mod retry;

use crate::core::{AdviserObtainment, FailureType, Node, NodeExecution, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use basic::{IgnoreAdviser, ManualInterventionAdviser, OnAbortAdviser, OnFailAdviser, OnSuccessAdviser, RollbackAdviser};
pub use retry::{RepairAction, RetryAdviser};

/// Error types for adviser resolution
#[derive(Debug, Error)]
pub enum AdviseError {
    #[error("Unknown adviser type '{0}'")]
    UnknownAdviser(String),

    #[error("Invalid parameters for adviser '{adviser}': {source}")]
    InvalidParameters {
        adviser: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What to do when an intervention window runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionTimeoutAction {
    Ignore,
    EndExecution,
    #[default]
    MarkAsFailure,
}

/// Decision produced by an adviser, kept in the node execution's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviserResponse {
    /// Continue with the named nodes
    Proceed { next_node_ids: Vec<String> },

    /// Re-run the node after a wait
    Retry { wait_interval_secs: u64, attempt: usize },

    /// Enter the rollback node mapped for `strategy`
    Rollback { strategy: String, node_id: String },

    /// Stop every active node of the plan
    EndPlan,

    /// Park the node for a human decision
    InterventionWaiting {
        timeout_secs: u64,
        timeout_action: InterventionTimeoutAction,
    },

    /// Treat the failure as success, optionally continuing elsewhere
    IgnoreFailure { next_node_id: Option<String> },
}

/// Input to an adviser
#[derive(Debug, Clone, Copy)]
pub struct AdvisingEvent<'a> {
    pub node_execution: &'a NodeExecution,
    pub from_status: Status,
    pub to_status: Status,
}

impl<'a> AdvisingEvent<'a> {
    pub fn new(node_execution: &'a NodeExecution, from_status: Status) -> Self {
        Self {
            node_execution,
            from_status,
            to_status: node_execution.status,
        }
    }

    /// Earlier attempts of the advised node
    pub fn retry_attempt(&self) -> usize {
        self.node_execution.retry_attempt()
    }

    pub fn has_failure_type(&self, failure_type: FailureType) -> bool {
        self.node_execution
            .failure
            .as_ref()
            .is_some_and(|f| f.has_type(failure_type))
    }

    pub fn failure_types(&self) -> impl Iterator<Item = FailureType> + '_ {
        self.node_execution
            .failure
            .iter()
            .flat_map(|f| f.failure_types.iter().copied())
    }
}

/// Post-status-change policy
pub trait Adviser: Send + Sync {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool;

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Option<AdviserResponse>;
}

/// Builds an adviser from its declared parameters
pub type AdviserFactory = Arc<dyn Fn(&Value) -> Result<Box<dyn Adviser>, AdviseError> + Send + Sync>;

/// Adviser factories keyed by type name
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    factories: HashMap<String, AdviserFactory>,
}

/// Factory for advisers whose parameters deserialize straight into the adviser
fn from_params<A>(name: &'static str) -> AdviserFactory
where
    A: Adviser + serde::de::DeserializeOwned + 'static,
{
    Arc::new(move |params: &Value| {
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params.clone()
        };
        let adviser: A = serde_json::from_value(params).map_err(|source| AdviseError::InvalidParameters {
            adviser: name.to_string(),
            source,
        })?;
        Ok(Box::new(adviser) as Box<dyn Adviser>)
    })
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard advisers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("retry", from_params::<RetryAdviser>("retry"))
            .register("on_success", from_params::<OnSuccessAdviser>("on_success"))
            .register("on_fail", from_params::<OnFailAdviser>("on_fail"))
            .register("on_abort", from_params::<OnAbortAdviser>("on_abort"))
            .register("rollback", from_params::<RollbackAdviser>("rollback"))
            .register("manual_intervention", from_params::<ManualInterventionAdviser>("manual_intervention"))
            .register("ignore", from_params::<IgnoreAdviser>("ignore"));
        registry
    }

    pub fn register(&mut self, adviser_type: impl Into<String>, factory: AdviserFactory) -> &mut Self {
        self.factories.insert(adviser_type.into(), factory);
        self
    }

    pub fn obtain(&self, obtainment: &AdviserObtainment) -> Result<Box<dyn Adviser>, AdviseError> {
        let factory = self
            .factories
            .get(&obtainment.adviser_type)
            .ok_or_else(|| AdviseError::UnknownAdviser(obtainment.adviser_type.clone()))?;
        factory(&obtainment.parameters)
    }

    /// Run the node's adviser chain; the first adviser that answers wins
    pub fn advise(&self, node: &Node, event: &AdvisingEvent<'_>) -> Result<Option<AdviserResponse>, AdviseError> {
        for obtainment in &node.advisers {
            if !obtainment.when.is_empty() && !obtainment.when.contains(&event.to_status) {
                continue;
            }
            let adviser = self.obtain(obtainment)?;
            if !adviser.can_advise(event) {
                continue;
            }
            if let Some(response) = adviser.on_advise_event(event) {
                debug!(
                    "Adviser '{}' answered {:?} for node execution {}",
                    obtainment.adviser_type, response, event.node_execution.id
                );
                return Ok(Some(response));
            }
        }
        Ok(None)
    }
}

/// Rollback strategy name to rollback node id
pub type RollbackMap = BTreeMap<String, String>;
