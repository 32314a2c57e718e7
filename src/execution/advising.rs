//! Adviser chain application and roll-up of concluded node executions

use super::engine::{EngineError, EngineResult, OrchestrationEngine};
use super::events::ExecutionEvent;
use crate::{
    advise::{AdviserResponse, AdvisingEvent},
    consumer::EngineMessage,
    core::{status, FailureInfo, FailureType, Interrupt, Node, NodeExecution, Status},
    timeout::{TimeoutInstance, ABSOLUTE},
};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

impl OrchestrationEngine {
    /// Consult the adviser chain of a node that reached a final status
    pub(super) async fn advise_node(&self, id: Uuid, from_status: Status) -> EngineResult<()> {
        let execution = self.load_node(id).await?;
        if execution.concluded || !execution.status.is_final() {
            debug!("Node execution {} needs no advice ({})", id, execution.status);
            return Ok(());
        }

        let plan_execution = self.get_plan_execution(execution.plan_execution_id).await?;
        if plan_execution.is_final() {
            return self.conclude(id, None).await;
        }

        let node = self
            .node_definition(&execution.ambiance.plan_id, &execution.node_id)
            .await?;
        let event = AdvisingEvent::new(&execution, from_status);
        let response = match self.advisers().advise(&node, &event) {
            Ok(response) => response,
            Err(e) => {
                error!("Adviser chain of node '{}' failed: {}", node.id, e);
                None
            }
        };

        match response {
            None => self.apply_default_advice(&execution, &node).await,
            Some(response) => {
                info!("Adviser answered {:?} for node '{}' ({})", response, node.id, id);
                self.emit_event(ExecutionEvent::AdviserResponded {
                    node_execution_id: id,
                    node_id: node.id.clone(),
                    response: response.clone(),
                })
                .await;
                self.apply_advice(&execution, &node, response).await
            }
        }
    }

    /// Positive nodes continue along their edges; anything else rolls up
    async fn apply_default_advice(&self, execution: &NodeExecution, node: &Node) -> EngineResult<()> {
        if execution.status.is_positive() && !self.start_next(execution, &node.next).await? {
            return Ok(());
        }
        self.conclude(execution.id, None).await
    }

    async fn apply_advice(&self, execution: &NodeExecution, node: &Node, response: AdviserResponse) -> EngineResult<()> {
        match &response {
            AdviserResponse::Proceed { next_node_ids } => {
                if self.start_next(execution, next_node_ids).await? {
                    self.conclude(execution.id, Some(response)).await?;
                }
                Ok(())
            }
            AdviserResponse::Retry { wait_interval_secs, .. } => {
                let wait = Duration::from_secs(*wait_interval_secs);
                self.retry_node(execution, node, wait, Some(response), None).await
            }
            AdviserResponse::Rollback { node_id, .. } => {
                if self.start_next(execution, std::slice::from_ref(node_id)).await? {
                    self.conclude(execution.id, Some(response)).await?;
                }
                Ok(())
            }
            AdviserResponse::EndPlan => {
                self.end_plan(execution, Some(response), "Plan execution ended by adviser").await
            }
            AdviserResponse::InterventionWaiting { timeout_secs, .. } => {
                let from = execution.status;
                let instance = TimeoutInstance::new(ABSOLUTE, *timeout_secs, Utc::now());
                let parked = self
                    .transition_node(execution.id, &[from], Status::InterventionWaiting, |e| {
                        e.held_from = Some(from);
                        e.timeout = Some(instance.clone());
                        e.adviser_responses.push(response.clone());
                    })
                    .await?;
                match parked {
                    Some(_) => info!("Node execution {} waits for intervention", execution.id),
                    None => self.conclude(execution.id, Some(response)).await?,
                }
                Ok(())
            }
            AdviserResponse::IgnoreFailure { next_node_id } => {
                let next = match next_node_id {
                    Some(id) => vec![id.clone()],
                    None => node.next.clone(),
                };
                self.ignore_failure(execution, &next, Some(response), None).await
            }
        }
    }

    /// Turn a broken (or parked) node into IGNORE_FAILED and continue
    pub(super) async fn ignore_failure(
        &self,
        execution: &NodeExecution,
        next: &[String],
        response: Option<AdviserResponse>,
        interrupt: Option<&Interrupt>,
    ) -> EngineResult<()> {
        let ignored = self
            .transition_node(execution.id, &[], Status::IgnoreFailed, |e| {
                if let Some(response) = &response {
                    e.adviser_responses.push(response.clone());
                }
                if let Some(interrupt) = interrupt {
                    e.record_interrupt(interrupt.id, interrupt.interrupt_type);
                }
            })
            .await?;

        let Some(ignored) = ignored else {
            // Not broken any more; just let it roll up
            return self.conclude(execution.id, response).await;
        };
        if self.start_next(&ignored, next).await? {
            self.conclude(ignored.id, None).await?;
        }
        Ok(())
    }

    /// Queue sibling executions of `execution` for the given node ids.
    ///
    /// Returns false when an id does not exist, in which case the plan
    /// execution has been errored out.
    pub(super) async fn start_next(&self, execution: &NodeExecution, node_ids: &[String]) -> EngineResult<bool> {
        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            match self.node_definition(&execution.ambiance.plan_id, node_id).await {
                Ok(node) => nodes.push(node),
                Err(e @ EngineError::NodeNotFound { .. }) => {
                    error!("Cannot continue from {}: {}", execution.id, e);
                    self.end_plan(execution, None, &e.to_string()).await?;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        let base = execution.ambiance.clone_for_finish();
        for node in &nodes {
            let mut sibling = self.instantiate(node, &base);
            sibling.parent_id = execution.parent_id;
            sibling.parent_round = execution.parent_round;
            sibling.previous_id = Some(execution.id);
            self.enqueue(sibling).await?;
        }
        Ok(true)
    }

    /// Replace `execution` with a fresh attempt of the same node
    pub(super) async fn retry_node(
        &self,
        execution: &NodeExecution,
        node: &Node,
        wait: Duration,
        response: Option<AdviserResponse>,
        interrupt: Option<&Interrupt>,
    ) -> EngineResult<()> {
        let mut attempt = self.instantiate(node, &execution.ambiance.clone_for_finish());
        attempt.parent_id = execution.parent_id;
        attempt.parent_round = execution.parent_round;
        attempt.previous_id = execution.previous_id;
        attempt.additional_inputs = execution.additional_inputs.clone();
        attempt.retry_ids = execution.retry_ids.clone();
        attempt.retry_ids.push(execution.id);
        if let Some(level) = attempt.ambiance.levels.last_mut() {
            level.order = attempt.retry_ids.len() as u32;
        }
        if !wait.is_zero() {
            // A wait past the calendar's end holds the attempt indefinitely
            let until = chrono::Duration::from_std(wait)
                .ok()
                .and_then(|wait| attempt.created_at.checked_add_signed(wait))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            attempt.queued_until = Some(until);
        }

        // The new attempt exists before the old one stops counting, so the
        // parent never sees an empty round in between
        let store = self.store();
        let record = &attempt;
        self.persist("insert retry", move || store.insert_node_execution(record))
            .await?;

        let retired = self
            .update_node(execution.id, |e| {
                if e.old_retry || e.concluded {
                    return false;
                }
                e.old_retry = true;
                e.concluded = true;
                if let Some(response) = &response {
                    e.adviser_responses.push(response.clone());
                }
                if let Some(interrupt) = interrupt {
                    e.record_interrupt(interrupt.id, interrupt.interrupt_type);
                }
                true
            })
            .await?;

        if retired.is_none() {
            warn!("Node execution {} was already retried or concluded", execution.id);
            self.transition_node(attempt.id, &[Status::Queued], Status::Aborted, |e| e.concluded = true)
                .await?;
            return Ok(());
        }

        info!(
            "Retrying node '{}' as {} (attempt {}, wait {:?})",
            node.id,
            attempt.id,
            attempt.retry_ids.len() + 1,
            wait
        );
        self.schedule_start(&attempt)
    }

    /// Error out every other active node of the plan, then finish it
    pub(super) async fn end_plan(
        &self,
        execution: &NodeExecution,
        response: Option<AdviserResponse>,
        reason: &str,
    ) -> EngineResult<()> {
        let plan_execution_id = execution.plan_execution_id;
        let failure = FailureInfo::new(reason, FailureType::Unknown);

        let active = self.active_executions(plan_execution_id).await?;
        for other in active.iter().filter(|e| e.id != execution.id) {
            let errored = self
                .transition_node(other.id, &[], Status::Errored, |e| {
                    e.failure = Some(failure.clone());
                    e.concluded = true;
                })
                .await?;
            if let Some(errored) = errored {
                self.abort_tasks(&errored);
            }
        }

        self.conclude(execution.id, response).await?;

        let executions = self.live_executions(plan_execution_id).await?;
        let status = status::aggregate(
            executions
                .iter()
                .filter(|e| e.parent_id.is_none())
                .map(|e| e.status),
        );
        let failure = executions
            .iter()
            .find(|e| e.status.is_broken())
            .and_then(|e| e.failure.clone())
            .or(Some(failure));
        // A plan ended this way never counts as a success
        let status = if status.is_positive() { Status::Failed } else { status };
        self.finish_plan(plan_execution_id, status, failure, None).await?;
        Ok(())
    }

    /// Mark a node as concluded and tell whoever waits on it
    pub(super) async fn conclude(&self, id: Uuid, response: Option<AdviserResponse>) -> EngineResult<()> {
        let concluded = self
            .update_node(id, |e| {
                if e.concluded {
                    return false;
                }
                if let Some(response) = &response {
                    e.adviser_responses.push(response.clone());
                }
                e.concluded = true;
                true
            })
            .await?;

        match concluded {
            Some(execution) => self.roll_up(&execution).await,
            None => Ok(()),
        }
    }

    /// Propagate a concluded node to its parent, or to the plan execution
    pub(super) async fn roll_up(&self, execution: &NodeExecution) -> EngineResult<()> {
        let Some(parent_id) = execution.parent_id else {
            return self.try_complete_plan(execution.plan_execution_id).await;
        };

        let round = self.round_children(parent_id, execution.parent_round).await?;
        if round.iter().all(|c| c.concluded) {
            self.publish(EngineMessage::ChildConcluded {
                parent_id,
                child_round: execution.parent_round,
            })?;
        }
        Ok(())
    }

    /// Finish the plan execution once every top-level node concluded
    pub(super) async fn try_complete_plan(&self, plan_execution_id: Uuid) -> EngineResult<()> {
        let executions = self.live_executions(plan_execution_id).await?;
        let top_level: Vec<&NodeExecution> = executions.iter().filter(|e| e.parent_id.is_none()).collect();
        if top_level.is_empty() || top_level.iter().any(|e| !e.concluded) {
            return Ok(());
        }

        let status = status::aggregate(top_level.iter().map(|e| e.status));
        let failure = top_level
            .iter()
            .find(|e| e.status.is_broken())
            .and_then(|e| e.failure.clone());
        self.finish_plan(plan_execution_id, status, failure, None).await?;
        Ok(())
    }

    /// Node executions of a plan, without replaced attempts
    pub(super) async fn live_executions(&self, plan_execution_id: Uuid) -> EngineResult<Vec<NodeExecution>> {
        let store = self.store();
        self.persist("load plan nodes", move || {
            store.node_executions_without_old_retries(plan_execution_id)
        })
        .await
    }

    /// Node executions of a plan that have not reached a final status
    pub(super) async fn active_executions(&self, plan_execution_id: Uuid) -> EngineResult<Vec<NodeExecution>> {
        let mut executions = self.live_executions(plan_execution_id).await?;
        executions.retain(|e| !e.status.is_final());
        Ok(executions)
    }
}
