//! Starting node executions and driving their strategies

use super::engine::{EngineError, EngineResult, OrchestrationEngine};
use crate::{
    consumer::EngineMessage,
    core::{status, ExecutionMode, FailureInfo, FailureType, NodeExecution, Status},
    strategy::{
        ChildChainResponse, ChildOutcome, Executable, ExecutableResponse, StepContext, StepResponse, StrategyError,
    },
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

impl OrchestrationEngine {
    /// Start a queued node execution
    pub(super) async fn start_node(&self, id: Uuid) -> EngineResult<()> {
        let execution = self.load_node(id).await?;
        if execution.status != Status::Queued {
            debug!("Node execution {} is {}, not starting it again", id, execution.status);
            return Ok(());
        }

        let plan_execution = self.get_plan_execution(execution.plan_execution_id).await?;
        if plan_execution.is_final() {
            // Queued after the plan execution ended
            self.transition_node(id, &[Status::Queued], Status::Aborted, |e| e.concluded = true)
                .await?;
            return Ok(());
        }
        if plan_execution.status == Status::Paused {
            debug!("Plan execution {} is paused, {} stays queued", plan_execution.id, id);
            return Ok(());
        }

        let node = self
            .node_definition(&execution.ambiance.plan_id, &execution.node_id)
            .await?;

        let skip = match node.skip_condition() {
            Ok(condition) => condition.is_some_and(|c| c.should_skip(&execution.ambiance)),
            Err(e) => {
                let failure = FailureInfo::new(e.to_string(), FailureType::Unknown);
                return self.error_queued_node(id, failure).await;
            }
        };
        if skip {
            info!("Skipping node '{}' ({})", node.id, id);
            if self
                .transition_node(id, &[Status::Queued], Status::Skipped, |_| {})
                .await?
                .is_some()
            {
                self.publish(EngineMessage::Advise {
                    node_execution_id: id,
                    from_status: Status::Queued,
                })?;
            }
            return Ok(());
        }

        let timeout = match node.timeout.as_ref() {
            Some(obtainment) => match self.timeouts().create(obtainment, Utc::now()) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    let failure = FailureInfo::new(e.to_string(), FailureType::Unknown);
                    return self.error_queued_node(id, failure).await;
                }
            },
            None => None,
        };

        let Some(running) = self
            .transition_node(id, &[Status::Queued], Status::Running, |e| {
                e.timeout = timeout.clone();
            })
            .await?
        else {
            return Ok(());
        };

        info!("Running node '{}' ({:?}) as {}", node.id, node.mode, id);
        let ctx = self.step_context(&running, node);
        self.run_strategy(&running, ctx).await
    }

    async fn error_queued_node(&self, id: Uuid, failure: FailureInfo) -> EngineResult<()> {
        warn!("Node execution {} cannot start: {}", id, failure.message);
        self.complete_node(
            id,
            &[Status::Queued],
            StepResponse {
                status: Status::Errored,
                outcome: None,
                failure: Some(failure),
            },
        )
        .await
    }

    /// Invoke the strategy of a freshly started node
    async fn run_strategy(&self, execution: &NodeExecution, ctx: StepContext) -> EngineResult<()> {
        let id = execution.id;
        let executable = match self.steps().resolve(&ctx.node) {
            Ok(executable) => executable,
            Err(e) => return self.fail_node(id, &[Status::Running], e).await,
        };

        match executable {
            Executable::Sync(step) => match step.execute_sync(&ctx).await {
                Ok(response) => self.complete_node(id, &[Status::Running], response).await,
                Err(e) => self.fail_node(id, &[Status::Running], e).await,
            },
            Executable::Async(step) => match step.execute_async(&ctx).await {
                Ok(response) if response.callback_ids.is_empty() => {
                    match step.handle_async_response(&ctx, &BTreeMap::new()).await {
                        Ok(response) => self.complete_node(id, &[Status::Running], response).await,
                        Err(e) => self.fail_node(id, &[Status::Running], e).await,
                    }
                }
                Ok(response) => self.await_callbacks(execution, response.callback_ids).await,
                Err(e) => self.fail_node(id, &[Status::Running], e).await,
            },
            Executable::Child(step) => match step.obtain_child(&ctx).await {
                Ok(response) => {
                    let record = ExecutableResponse::Child {
                        child_node_id: response.child_node_id.clone(),
                    };
                    self.spawn_child(
                        execution,
                        &[Status::Running],
                        &response.child_node_id,
                        response.additional_inputs,
                        |e| e.executable_responses.push(record.clone()),
                    )
                    .await
                }
                Err(e) => self.fail_node(id, &[Status::Running], e).await,
            },
            Executable::ChildChain(step) => match step.start_chain_link(&ctx).await {
                Ok(response) => self.apply_chain_response(execution, &[Status::Running], response).await,
                Err(e) => self.fail_node(id, &[Status::Running], e).await,
            },
        }
    }

    async fn await_callbacks(&self, execution: &NodeExecution, callback_ids: Vec<String>) -> EngineResult<()> {
        let pending: BTreeSet<String> = callback_ids.iter().cloned().collect();
        let waiting = self
            .transition_node(execution.id, &[Status::Running], Status::TaskWaiting, |e| {
                e.pending_callbacks = pending.clone();
                e.executable_responses.push(ExecutableResponse::Async {
                    callback_ids: callback_ids.clone(),
                });
            })
            .await?;

        match waiting {
            Some(_) => debug!("Node execution {} waits on {} callbacks", execution.id, pending.len()),
            None => {
                // Torn down while the strategy ran; nobody will consume these results
                let mut orphaned = execution.clone();
                orphaned.pending_callbacks = pending;
                self.abort_tasks(&orphaned);
            }
        }
        Ok(())
    }

    /// Hand resolved callbacks to the async strategy, exactly once
    pub(super) async fn drive_async(&self, id: Uuid) -> EngineResult<()> {
        // Claiming TASK_WAITING -> RUNNING is what makes this single-shot
        let Some(execution) = self
            .update_node(id, |e| {
                if e.status != Status::TaskWaiting || !e.pending_callbacks.is_empty() {
                    return false;
                }
                e.set_status(Status::Running);
                true
            })
            .await?
        else {
            debug!("Node execution {} already driven", id);
            return Ok(());
        };

        // The claim is the point a node counts as running; a pause or end that
        // landed before it keeps the strategy from being invoked
        let plan_execution = self.get_plan_execution(execution.plan_execution_id).await?;
        if plan_execution.is_final() {
            debug!("Plan execution {} ended, not driving {}", plan_execution.id, id);
            return Ok(());
        }
        if plan_execution.status == Status::Paused {
            let released = self
                .transition_node(id, &[Status::Running], Status::TaskWaiting, |_| {})
                .await?;
            if released.is_some() {
                info!("Plan execution {} paused, holding {} until resumed", plan_execution.id, id);
                // RESUME_ALL may have passed over the node while it was claimed
                if self.get_plan_execution(plan_execution.id).await?.status == Status::Running {
                    self.publish(EngineMessage::Wake { node_execution_id: id })?;
                }
            }
            return Ok(());
        }

        let node = self
            .node_definition(&execution.ambiance.plan_id, &execution.node_id)
            .await?;
        let ctx = self.step_context(&execution, node);
        match self.steps().resolve(&ctx.node) {
            Ok(Executable::Async(step)) => match step.handle_async_response(&ctx, &execution.resolved_responses).await {
                Ok(response) => self.complete_node(id, &[Status::Running], response).await,
                Err(e) => self.fail_node(id, &[Status::Running], e).await,
            },
            Ok(other) => {
                let error = StrategyError::ModeMismatch {
                    step_type: ctx.node.step_type.clone(),
                    declared: ExecutionMode::Async,
                    registered: other.mode(),
                };
                self.fail_node(id, &[Status::Running], error).await
            }
            Err(e) => self.fail_node(id, &[Status::Running], e).await,
        }
    }

    /// Create the child of `parent` and move the parent to CHILD_WAITING
    async fn spawn_child<F>(
        &self,
        parent: &NodeExecution,
        from: &[Status],
        child_node_id: &str,
        inputs: Value,
        mut record: F,
    ) -> EngineResult<()>
    where
        F: FnMut(&mut NodeExecution) + Send,
    {
        let child_node = match self.node_definition(&parent.ambiance.plan_id, child_node_id).await {
            Ok(node) => node,
            Err(EngineError::NodeNotFound { .. }) => {
                let error = StrategyError::failed(
                    format!("Child node '{}' does not exist", child_node_id),
                    FailureType::Unknown,
                );
                return self.fail_node(parent.id, from, error).await;
            }
            Err(e) => return Err(e),
        };

        let round = parent.child_round;
        let Some(waiting) = self
            .update_node(parent.id, |e| {
                if !from.contains(&e.status) || e.child_round != round {
                    return false;
                }
                if e.status != Status::ChildWaiting {
                    if !e.status.can_transition_to(Status::ChildWaiting) {
                        return false;
                    }
                    e.set_status(Status::ChildWaiting);
                }
                e.child_round += 1;
                record(e);
                true
            })
            .await?
        else {
            debug!("Node execution {} moved on, not spawning '{}'", parent.id, child_node_id);
            return Ok(());
        };

        let mut child = self.instantiate(&child_node, &waiting.ambiance);
        child.parent_id = Some(waiting.id);
        child.parent_round = waiting.child_round;
        child.additional_inputs = inputs;
        info!(
            "Node execution {} spawned child '{}' (round {})",
            waiting.id, child_node_id, waiting.child_round
        );
        self.enqueue(child).await?;
        Ok(())
    }

    /// Act on a chain strategy's answer: spawn the next link or suspend
    async fn apply_chain_response(
        &self,
        parent: &NodeExecution,
        from: &[Status],
        response: ChildChainResponse,
    ) -> EngineResult<()> {
        let pass_through = response.pass_through_data().cloned();
        let record = ExecutableResponse::ChildChain(response.clone());

        match response.next_child_id() {
            Some(next) => {
                self.spawn_child(parent, from, next, Value::Null, |e| {
                    e.pass_through_data = pass_through.clone();
                    e.executable_responses.push(record.clone());
                })
                .await
            }
            None => {
                let round = parent.child_round;
                let suspended = self
                    .update_node(parent.id, |e| {
                        if !from.contains(&e.status)
                            || e.child_round != round
                            || !e.status.can_transition_to(Status::Suspended)
                        {
                            return false;
                        }
                        e.set_status(Status::Suspended);
                        e.pass_through_data = pass_through.clone();
                        e.executable_responses.push(record.clone());
                        true
                    })
                    .await?;
                if suspended.is_some() {
                    info!("Chain node execution {} suspended", parent.id);
                }
                Ok(())
            }
        }
    }

    /// Every child of a round concluded; give the parent its rolled-up result
    pub(super) async fn child_concluded(&self, parent_id: Uuid, round: u32) -> EngineResult<()> {
        let parent = self.load_node(parent_id).await?;
        if parent.status != Status::ChildWaiting || parent.child_round != round {
            debug!(
                "Ignoring round {} completion for {} ({} at round {})",
                round, parent_id, parent.status, parent.child_round
            );
            return Ok(());
        }

        let children = self.round_children(parent_id, round).await?;
        if children.is_empty() || children.iter().any(|c| !c.concluded) {
            debug!("Round {} of {} is still running", round, parent_id);
            return Ok(());
        }
        let outcome = child_outcome(&children, parent.chain_links().saturating_sub(1));

        let node = self
            .node_definition(&parent.ambiance.plan_id, &parent.node_id)
            .await?;
        let ctx = self.step_context(&parent, node);
        let from = &[Status::ChildWaiting];

        match self.steps().resolve(&ctx.node) {
            Ok(Executable::Child(step)) => match step.handle_child_response(&ctx, &outcome).await {
                Ok(response) => self.complete_node(parent_id, from, response).await,
                Err(e) => self.fail_node(parent_id, from, e).await,
            },
            Ok(Executable::ChildChain(step)) => {
                let last = parent.last_chain_response().cloned();
                let pass_through = parent.pass_through_data.clone();
                let finished = last.as_ref().map_or(true, |l| l.last_link()) || !outcome.status.is_positive();

                if finished {
                    match step.finalize_execution(&ctx, pass_through.as_ref(), &outcome).await {
                        Ok(response) => self.complete_node(parent_id, from, response).await,
                        Err(e) => self.fail_node(parent_id, from, e).await,
                    }
                } else if last.as_ref().is_some_and(|l| l.suspend()) {
                    let suspended = self
                        .transition_node(parent_id, from, Status::Suspended, |_| {})
                        .await?;
                    if suspended.is_some() {
                        info!("Chain node execution {} suspended after round {}", parent_id, round);
                    }
                    Ok(())
                } else {
                    match step.execute_next_link(&ctx, pass_through.as_ref(), &outcome).await {
                        Ok(response) => self.apply_chain_response(&parent, from, response).await,
                        Err(e) => self.fail_node(parent_id, from, e).await,
                    }
                }
            }
            Ok(other) => {
                let error = StrategyError::ModeMismatch {
                    step_type: ctx.node.step_type.clone(),
                    declared: ctx.node.mode,
                    registered: other.mode(),
                };
                self.fail_node(parent_id, from, error).await
            }
            Err(e) => self.fail_node(parent_id, from, e).await,
        }
    }

    /// Live (not replaced) children of one round, in creation order
    pub(super) async fn round_children(&self, parent_id: Uuid, round: u32) -> EngineResult<Vec<NodeExecution>> {
        let store = self.store();
        let mut children = self
            .persist("load children", move || store.children_of(parent_id))
            .await?;
        children.retain(|c| c.parent_round == round && !c.old_retry);
        Ok(children)
    }

    /// Write a strategy's final response and hand the node to the adviser chain
    pub(super) async fn complete_node(&self, id: Uuid, from: &[Status], response: StepResponse) -> EngineResult<()> {
        let status = if response.status.is_final() {
            response.status
        } else {
            warn!("Strategy of {} answered non-final status {}", id, response.status);
            Status::Errored
        };

        let mut from_status = None;
        let completed = self
            .update_node(id, |e| {
                if !from.contains(&e.status) || !e.status.can_transition_to(status) {
                    return false;
                }
                from_status = Some(e.status);
                e.set_status(status);
                e.outcome = response.outcome.clone();
                e.failure = response.failure.clone();
                if e.mode == ExecutionMode::Sync {
                    e.executable_responses.push(ExecutableResponse::Sync { status });
                }
                true
            })
            .await?;

        match (completed, from_status) {
            (Some(execution), Some(from_status)) => {
                info!("Node '{}' ({}) ended {}", execution.node_id, id, status);
                self.publish(EngineMessage::Advise {
                    node_execution_id: id,
                    from_status,
                })
            }
            _ => {
                debug!("Node execution {} left {:?} before completing, dropping {}", id, from, status);
                Ok(())
            }
        }
    }

    /// Apply a strategy error. Fatal errors skip the adviser chain.
    pub(super) async fn fail_node(&self, id: Uuid, from: &[Status], error: StrategyError) -> EngineResult<()> {
        warn!("Node execution {} failed: {}", id, error);
        if !error.is_fatal() {
            let response = StepResponse {
                status: error.status(),
                outcome: None,
                failure: Some(error.failure_info()),
            };
            return self.complete_node(id, from, response).await;
        }

        let failure = error.failure_info();
        if let Some(errored) = self
            .transition_node(id, from, Status::Errored, |e| {
                e.failure = Some(failure.clone());
                e.concluded = true;
            })
            .await?
        {
            self.roll_up(&errored).await?;
        }
        Ok(())
    }
}

/// Roll the executions of one child round up into what the parent sees
pub(super) fn child_outcome(children: &[NodeExecution], link: usize) -> ChildOutcome {
    let first = &children[0];
    ChildOutcome {
        node_execution_id: first.id,
        node_id: first.node_id.clone(),
        status: status::aggregate(children.iter().map(|c| c.status)),
        outcome: children.iter().rev().find_map(|c| c.outcome.clone()),
        failure: children
            .iter()
            .find(|c| c.status.is_broken())
            .and_then(|c| c.failure.clone()),
        link,
    }
}
