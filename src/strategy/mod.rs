//! Executable strategies - the per-node execution contract
//!
//! A node declares one of four execution modes. Step implementations register an
//! [`Executable`] of the matching variant in a [`StepRegistry`], which the engine
//! consults by step type. Strategies only return responses; the engine owns every
//! status change.

pub mod builtin;
pub mod response;

use crate::{
    core::{Ambiance, ExecutionMode, FailureInfo, FailureType, Node, Status},
    dispatch::{DispatchError, ScopingContext, TaskExecutor, TaskRequest, TaskResponse},
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use response::{
    AsyncExecutableResponse, ChildChainResponse, ChildExecutableResponse, ChildOutcome, ExecutableResponse,
    StepResponse,
};

/// Error types for strategy invocations
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("{message}")]
    Failed {
        message: String,
        failure_types: BTreeSet<FailureType>,
    },

    #[error("Invalid chain response: {0}")]
    InvalidChainResponse(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("No step registered for type '{0}'")]
    UnknownStep(String),

    #[error("Step '{step_type}' is registered as {registered:?} but the node declares {declared:?}")]
    ModeMismatch {
        step_type: String,
        declared: ExecutionMode,
        registered: ExecutionMode,
    },
}

impl StrategyError {
    pub fn failed(message: impl Into<String>, failure_type: FailureType) -> Self {
        StrategyError::Failed {
            message: message.into(),
            failure_types: BTreeSet::from([failure_type]),
        }
    }

    /// Status the node ends in when this error escapes a strategy
    pub fn status(&self) -> Status {
        match self {
            StrategyError::Failed { .. } | StrategyError::Dispatch(_) => Status::Failed,
            _ => Status::Errored,
        }
    }

    /// Whether the node must skip the adviser chain
    pub fn is_fatal(&self) -> bool {
        matches!(self, StrategyError::InvalidChainResponse(_))
    }

    /// Structured failure reason for the node execution
    pub fn failure_info(&self) -> FailureInfo {
        let message = self.to_string();
        match self {
            StrategyError::Failed { failure_types, .. } => {
                FailureInfo::with_types(message, failure_types.iter().copied())
            }
            StrategyError::Dispatch(_) => FailureInfo::new(message, FailureType::Connectivity),
            _ => FailureInfo::new(message, FailureType::Application),
        }
    }
}

/// Everything a strategy sees about the node it runs for
#[derive(Clone)]
pub struct StepContext {
    pub ambiance: Ambiance,
    pub node: Node,

    /// Inputs handed down by the parent
    pub inputs: Value,

    pub dispatcher: Arc<dyn TaskExecutor>,
}

impl StepContext {
    pub fn parameters(&self) -> &Value {
        &self.node.step_parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.node.step_parameters.get(key)
    }

    pub fn scope(&self) -> ScopingContext {
        ScopingContext::from_ambiance(&self.ambiance)
    }

    /// Queue work for the worker pool on behalf of this node
    pub async fn queue_task(
        &self,
        task_type: &str,
        parameters: Value,
        hold_for: Option<Duration>,
    ) -> Result<String, StrategyError> {
        let request = TaskRequest::new(&self.ambiance, task_type, parameters);
        Ok(self.dispatcher.queue_task(&self.scope(), request, hold_for).await?)
    }
}

/// Runs to completion without suspending
#[async_trait]
pub trait SyncExecutable: Send + Sync {
    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepResponse, StrategyError>;
}

/// Hands work to the worker pool and is resumed once every callback resolved
#[async_trait]
pub trait AsyncExecutable: Send + Sync {
    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncExecutableResponse, StrategyError>;

    /// Called exactly once per node execution, with every callback result
    async fn handle_async_response(
        &self,
        ctx: &StepContext,
        responses: &BTreeMap<String, TaskResponse>,
    ) -> Result<StepResponse, StrategyError>;
}

/// Runs exactly one child node
#[async_trait]
pub trait ChildExecutable: Send + Sync {
    async fn obtain_child(&self, ctx: &StepContext) -> Result<ChildExecutableResponse, StrategyError>;

    async fn handle_child_response(
        &self,
        _ctx: &StepContext,
        child: &ChildOutcome,
    ) -> Result<StepResponse, StrategyError> {
        Ok(child.to_step_response())
    }
}

/// Runs children one after another, deciding the next one as it goes
#[async_trait]
pub trait ChildChainExecutable: Send + Sync {
    async fn start_chain_link(&self, ctx: &StepContext) -> Result<ChildChainResponse, StrategyError>;

    async fn execute_next_link(
        &self,
        ctx: &StepContext,
        pass_through_data: Option<&Value>,
        previous: &ChildOutcome,
    ) -> Result<ChildChainResponse, StrategyError>;

    async fn finalize_execution(
        &self,
        _ctx: &StepContext,
        _pass_through_data: Option<&Value>,
        last: &ChildOutcome,
    ) -> Result<StepResponse, StrategyError> {
        Ok(last.to_step_response())
    }
}

/// A registered step implementation
#[derive(Clone)]
pub enum Executable {
    Sync(Arc<dyn SyncExecutable>),
    Async(Arc<dyn AsyncExecutable>),
    Child(Arc<dyn ChildExecutable>),
    ChildChain(Arc<dyn ChildChainExecutable>),
}

impl Executable {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Executable::Sync(_) => ExecutionMode::Sync,
            Executable::Async(_) => ExecutionMode::Async,
            Executable::Child(_) => ExecutionMode::Child,
            Executable::ChildChain(_) => ExecutionMode::ChildChain,
        }
    }
}

/// Lookup table from step type to implementation
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Executable>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the structural built-in steps
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, step_type: impl Into<String>, executable: Executable) -> &mut Self {
        self.steps.insert(step_type.into(), executable);
        self
    }

    /// Builder-style registration
    pub fn with(mut self, step_type: impl Into<String>, executable: Executable) -> Self {
        self.register(step_type, executable);
        self
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    /// Resolve the implementation for a node, checking its declared mode
    pub fn resolve(&self, node: &Node) -> Result<Executable, StrategyError> {
        let executable = self
            .steps
            .get(&node.step_type)
            .cloned()
            .ok_or_else(|| StrategyError::UnknownStep(node.step_type.clone()))?;

        if executable.mode() != node.mode {
            return Err(StrategyError::ModeMismatch {
                step_type: node.step_type.clone(),
                declared: node.mode,
                registered: executable.mode(),
            });
        }
        Ok(executable)
    }
}
