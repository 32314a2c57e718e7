//! Structural built-in steps
//!
//! These carry no business payload. They exist so plans can be run end to end from
//! the command line and exercise every execution mode.

use super::{
    AsyncExecutable, AsyncExecutableResponse, ChildChainExecutable, ChildChainResponse, ChildExecutable,
    ChildExecutableResponse, ChildOutcome, Executable, StepContext, StepRegistry, StepResponse, StrategyError,
    SyncExecutable,
};
use crate::{
    core::{FailureType, Status},
    dispatch::{TaskResponse, TaskStatus},
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Register every built-in step under its conventional type name
pub fn register_all(registry: &mut StepRegistry) {
    registry
        .register("noop", Executable::Sync(Arc::new(NoopStep)))
        .register("fail", Executable::Sync(Arc::new(FailStep)))
        .register("wait", Executable::Async(Arc::new(WaitStep)))
        .register("section", Executable::Child(Arc::new(SectionStep)))
        .register("for_each", Executable::ChildChain(Arc::new(ForEachStep)))
        .register("approval", Executable::ChildChain(Arc::new(ApprovalStep)));
}

/// Succeeds immediately; `outcome` is echoed as the node outcome
pub struct NoopStep;

#[async_trait]
impl SyncExecutable for NoopStep {
    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepResponse, StrategyError> {
        Ok(StepResponse::success(ctx.parameter("outcome").cloned()))
    }
}

/// Fails immediately with `message` and `failure_type`
pub struct FailStep;

#[async_trait]
impl SyncExecutable for FailStep {
    async fn execute_sync(&self, ctx: &StepContext) -> Result<StepResponse, StrategyError> {
        let message = ctx
            .parameter("message")
            .and_then(Value::as_str)
            .unwrap_or("Step failed")
            .to_string();
        let failure_type = ctx
            .parameter("failure_type")
            .and_then(|v| serde_json::from_value::<FailureType>(v.clone()).ok())
            .unwrap_or(FailureType::Application);
        Err(StrategyError::failed(message, failure_type))
    }
}

/// Queues `tasks` tasks of `task_type` (default `sleep`) and waits for all of them
pub struct WaitStep;

#[async_trait]
impl AsyncExecutable for WaitStep {
    async fn execute_async(&self, ctx: &StepContext) -> Result<AsyncExecutableResponse, StrategyError> {
        let task_type = ctx.parameter("task_type").and_then(Value::as_str).unwrap_or("sleep");
        let tasks = ctx.parameter("tasks").and_then(Value::as_u64).unwrap_or(1);
        let hold_for = ctx
            .parameter("hold_for_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        let mut callback_ids = Vec::with_capacity(tasks as usize);
        for _ in 0..tasks {
            let id = ctx.queue_task(task_type, ctx.parameters().clone(), hold_for).await?;
            callback_ids.push(id);
        }
        Ok(AsyncExecutableResponse { callback_ids })
    }

    async fn handle_async_response(
        &self,
        _ctx: &StepContext,
        responses: &BTreeMap<String, TaskResponse>,
    ) -> Result<StepResponse, StrategyError> {
        summarize_task_responses(responses)
    }
}

/// Fold task results into one step response
pub fn summarize_task_responses(
    responses: &BTreeMap<String, TaskResponse>,
) -> Result<StepResponse, StrategyError> {
    if responses.values().any(|r| r.status == TaskStatus::Aborted) {
        return Ok(StepResponse::with_status(Status::Aborted));
    }

    let mut failure_types = BTreeSet::new();
    let mut errors = Vec::new();
    for (id, response) in responses {
        match response.status {
            TaskStatus::Success => {}
            TaskStatus::Expired => {
                failure_types.insert(FailureType::Timeout);
                errors.push(format!("{}: expired", id));
            }
            _ => {
                failure_types.insert(FailureType::Application);
                errors.push(format!("{}: {}", id, response.error.as_deref().unwrap_or("failed")));
            }
        }
    }

    if !errors.is_empty() {
        return Err(StrategyError::Failed {
            message: errors.join("; "),
            failure_types,
        });
    }

    let outcome: serde_json::Map<String, Value> = responses
        .iter()
        .map(|(id, response)| (id.clone(), response.data.clone()))
        .collect();
    Ok(StepResponse::success(Some(Value::Object(outcome))))
}

/// Runs the node named by `child_node_id`, passing `inputs` down
pub struct SectionStep;

#[async_trait]
impl ChildExecutable for SectionStep {
    async fn obtain_child(&self, ctx: &StepContext) -> Result<ChildExecutableResponse, StrategyError> {
        let child_node_id = ctx
            .parameter("child_node_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StrategyError::failed("section requires 'child_node_id'", FailureType::Application))?;

        Ok(ChildExecutableResponse {
            child_node_id: child_node_id.to_string(),
            additional_inputs: ctx.parameter("inputs").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Runs each node listed in `children` in order, one at a time
pub struct ForEachStep;

impl ForEachStep {
    fn children(ctx: &StepContext) -> Result<Vec<String>, StrategyError> {
        let children = ctx
            .parameter("children")
            .and_then(Value::as_array)
            .ok_or_else(|| StrategyError::failed("for_each requires a 'children' list", FailureType::Application))?;

        Ok(children
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl ChildChainExecutable for ForEachStep {
    async fn start_chain_link(&self, ctx: &StepContext) -> Result<ChildChainResponse, StrategyError> {
        let children = Self::children(ctx)?;
        let pass_through = ctx
            .parameter("pass_through_data")
            .cloned()
            .unwrap_or_else(|| json!({ "children": children }));

        ChildChainResponse::try_new(
            children.first().cloned(),
            None,
            Some(pass_through),
            children.len() <= 1,
            false,
        )
    }

    async fn execute_next_link(
        &self,
        ctx: &StepContext,
        pass_through_data: Option<&Value>,
        previous: &ChildOutcome,
    ) -> Result<ChildChainResponse, StrategyError> {
        let children = Self::children(ctx)?;
        if children.get(previous.link) != Some(&previous.node_id) {
            return Err(StrategyError::InvalidChainResponse(format!(
                "'{}' is not link {} of the chain",
                previous.node_id, previous.link
            )));
        }

        let next = previous.link + 1;
        ChildChainResponse::try_new(
            children.get(next).cloned(),
            Some(previous.node_id.clone()),
            pass_through_data.cloned(),
            next + 1 >= children.len(),
            false,
        )
    }
}

/// Chain that suspends straight away, waiting for an interrupt to resolve it
pub struct ApprovalStep;

#[async_trait]
impl ChildChainExecutable for ApprovalStep {
    async fn start_chain_link(&self, ctx: &StepContext) -> Result<ChildChainResponse, StrategyError> {
        Ok(ChildChainResponse::suspended(None, Some(ctx.parameters().clone())))
    }

    async fn execute_next_link(
        &self,
        _ctx: &StepContext,
        pass_through_data: Option<&Value>,
        previous: &ChildOutcome,
    ) -> Result<ChildChainResponse, StrategyError> {
        Ok(ChildChainResponse::suspended(
            Some(previous.node_id.clone()),
            pass_through_data.cloned(),
        ))
    }
}
