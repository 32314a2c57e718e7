//! Ambiance - the hierarchical execution context passed through every engine call
//!
//! An ambiance is never mutated in place. Descending into a child node derives a new
//! value with one more [`Level`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Well-known setup abstraction keys
pub mod keys {
    pub const ACCOUNT_ID: &str = "accountId";
    pub const ORG_ID: &str = "orgId";
    pub const PROJECT_ID: &str = "projectId";
}

/// One position in the plan hierarchy (plan -> stage -> step)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Setup node id this level was instantiated from
    pub setup_id: String,

    /// Node execution id of this occurrence
    pub runtime_id: Uuid,

    /// Human readable identifier
    pub identifier: String,

    /// Optional grouping (STAGE, STEP, ...)
    pub group: Option<String>,

    /// Attempt index within the same logical occurrence
    pub order: u32,

    /// Step type of the node
    pub step_type: String,

    pub start_ts: DateTime<Utc>,
}

impl Level {
    pub fn new(setup_id: impl Into<String>, runtime_id: Uuid, identifier: impl Into<String>) -> Self {
        Self {
            setup_id: setup_id.into(),
            runtime_id,
            identifier: identifier.into(),
            group: None,
            order: 0,
            step_type: String::new(),
            start_ts: Utc::now(),
        }
    }

    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group;
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn with_step_type(mut self, step_type: impl Into<String>) -> Self {
        self.step_type = step_type.into();
        self
    }
}

/// Immutable execution context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: Uuid,
    pub plan_id: String,

    /// Scoping values such as account, org and project
    pub setup_abstractions: BTreeMap<String, String>,

    /// Ordered levels from the outermost node to the current one
    pub levels: Vec<Level>,
}

impl Ambiance {
    /// Create a root ambiance with no levels
    pub fn new(
        plan_execution_id: Uuid,
        plan_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            plan_execution_id,
            plan_id: plan_id.into(),
            setup_abstractions,
            levels: Vec::new(),
        }
    }

    /// Derive the ambiance of a child by appending a level
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut levels = self.levels.clone();
        levels.push(level);
        Self {
            levels,
            ..self.clone()
        }
    }

    /// Drop the current level, returning the ambiance of the owner
    pub fn clone_for_finish(&self) -> Self {
        self.truncated(self.levels.len().saturating_sub(1))
    }

    /// Keep only the first `depth` levels
    pub fn truncated(&self, depth: usize) -> Self {
        let mut levels = self.levels.clone();
        levels.truncate(depth);
        Self {
            levels,
            ..self.clone()
        }
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Node execution id of the current level
    pub fn obtain_current_runtime_id(&self) -> Option<Uuid> {
        self.current_level().map(|l| l.runtime_id)
    }

    /// Setup node id of the current level
    pub fn obtain_current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.setup_id.as_str())
    }

    pub fn obtain_step_identifier(&self) -> Option<&str> {
        self.current_level().map(|l| l.identifier.as_str())
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current_level().and_then(|l| l.group.as_deref())
    }

    /// Dotted path of level identifiers, e.g. `pipeline.stages.deploy`
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.identifier.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn setup_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.setup_abstraction(keys::ACCOUNT_ID)
    }

    pub fn org_id(&self) -> Option<&str> {
        self.setup_abstraction(keys::ORG_ID)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.setup_abstraction(keys::PROJECT_ID)
    }
}
