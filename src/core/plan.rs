//! Plan domain model
//!
//! Plans are compiled upstream and consumed read-only. Loading a plan is
//! deserialization plus structural validation, nothing more.

use crate::core::{
    condition::{SkipCondition, SkipConditionConfig},
    status::Status,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Errors found while validating a plan
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Duplicate node ID: {0}")]
    DuplicateNode(String),

    #[error("Start node '{0}' does not exist")]
    MissingStartNode(String),

    #[error("Node '{from}' has an edge to non-existent node '{to}'")]
    DanglingEdge { from: String, to: String },

    #[error("Node '{0}' has more than one predecessor")]
    MultiplePredecessors(String),

    #[error("Cycle detected in plan graph involving node '{0}'")]
    Cycle(String),

    #[error("Node '{node}' has an invalid skip condition: {source}")]
    InvalidSkipCondition {
        node: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to parse plan: {0}")]
    Parse(String),
}

/// How the engine drives a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sync,
    Async,
    Child,
    ChildChain,
}

/// Which adviser applies to a node, and on which statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviserObtainment {
    /// Adviser type name, resolved through the adviser registry
    #[serde(rename = "type")]
    pub adviser_type: String,

    /// Statuses that should trigger this adviser (empty = any)
    #[serde(default)]
    pub when: Vec<Status>,

    /// Adviser specific parameters
    #[serde(default)]
    pub parameters: Value,
}

/// Timeout configuration of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutObtainment {
    /// Tracker dimension, resolved through the timeout registry
    #[serde(default = "default_dimension")]
    pub dimension: String,

    pub timeout_secs: u64,
}

fn default_dimension() -> String {
    crate::timeout::ABSOLUTE.to_string()
}

/// A single node definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique setup node id
    pub id: String,

    /// Human readable identifier (defaults to the id)
    #[serde(default)]
    pub identifier: Option<String>,

    /// Step type, resolved through the step registry
    pub step_type: String,

    pub mode: ExecutionMode,

    #[serde(default)]
    pub group: Option<String>,

    /// Opaque step parameters, never inspected by the engine
    #[serde(default)]
    pub step_parameters: Value,

    /// Ordered outgoing edges
    #[serde(default)]
    pub next: Vec<String>,

    #[serde(default)]
    pub advisers: Vec<AdviserObtainment>,

    #[serde(default)]
    pub timeout: Option<TimeoutObtainment>,

    #[serde(default)]
    pub skip_when: Option<SkipConditionConfig>,
}

impl Node {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            id: id.into(),
            identifier: None,
            step_type: step_type.into(),
            mode,
            group: None,
            step_parameters: Value::Null,
            next: Vec::new(),
            advisers: Vec::new(),
            timeout: None,
            skip_when: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next.push(next.into());
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserObtainment) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_timeout(mut self, dimension: &str, timeout_secs: u64) -> Self {
        self.timeout = Some(TimeoutObtainment {
            dimension: dimension.to_string(),
            timeout_secs,
        });
        self
    }

    pub fn identifier(&self) -> &str {
        self.identifier.as_deref().unwrap_or(&self.id)
    }

    /// Compile the skip condition, if any
    pub fn skip_condition(&self) -> Result<Option<SkipCondition>, PlanError> {
        self.skip_when
            .as_ref()
            .map(SkipCondition::compile)
            .transpose()
            .map_err(|source| PlanError::InvalidSkipCondition {
                node: self.id.clone(),
                source,
            })
    }
}

/// An immutable, compiled plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Root node of the plan
    pub start_node_id: String,

    pub nodes: Vec<Node>,
}

impl Plan {
    /// Load a plan from a YAML (or JSON) file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&content)?)
    }

    /// Parse a plan from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, PlanError> {
        let plan: Plan = serde_yaml::from_str(yaml).map_err(|e| PlanError::Parse(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Get a node by ID
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.node(&self.start_node_id)
    }

    /// Validate the plan structure
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !seen_ids.insert(node.id.as_str()) {
                return Err(PlanError::DuplicateNode(node.id.clone()));
            }
        }

        if !seen_ids.contains(self.start_node_id.as_str()) {
            return Err(PlanError::MissingStartNode(self.start_node_id.clone()));
        }

        let mut predecessors: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            for next in &node.next {
                if !seen_ids.contains(next.as_str()) {
                    return Err(PlanError::DanglingEdge {
                        from: node.id.clone(),
                        to: next.clone(),
                    });
                }
                if !predecessors.insert(next.as_str()) {
                    return Err(PlanError::MultiplePredecessors(next.clone()));
                }
            }
            node.skip_condition()?;
        }

        self.check_cycles()
    }

    /// Check for cycles along `next` edges
    fn check_cycles(&self) -> Result<(), PlanError> {
        let edges: HashMap<&str, &Vec<String>> =
            self.nodes.iter().map(|n| (n.id.as_str(), &n.next)).collect();
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for node in &self.nodes {
            if !visited.contains(node.id.as_str()) {
                Self::dfs_check(&node.id, &edges, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check<'a>(
        node_id: &'a str,
        edges: &HashMap<&'a str, &'a Vec<String>>,
        visited: &mut HashSet<&'a str>,
        recursion_stack: &mut HashSet<&'a str>,
    ) -> Result<(), PlanError> {
        visited.insert(node_id);
        recursion_stack.insert(node_id);

        if let Some(&next) = edges.get(node_id) {
            for target in next.iter() {
                if recursion_stack.contains(target.as_str()) {
                    return Err(PlanError::Cycle(target.clone()));
                }
                if !visited.contains(target.as_str()) {
                    Self::dfs_check(target, edges, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(node_id);
        Ok(())
    }
}
