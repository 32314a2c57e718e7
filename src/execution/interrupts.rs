//! Interrupt controller
//!
//! Interrupts are persisted when registered and applied by the partition that
//! owns their plan execution, strictly in registration order. Expiry from the
//! timeout monitor goes through the same path as operator requests.

use super::engine::{EngineError, EngineResult, OrchestrationEngine};
use super::events::ExecutionEvent;
use crate::{
    advise::{AdviserResponse, InterventionTimeoutAction},
    consumer::EngineMessage,
    core::{FailureInfo, FailureType, Interrupt, InterruptState, InterruptType, NodeExecution, Status},
};
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reasons an interrupt is rejected or cannot be applied
#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("{0} interrupts need a target node execution")]
    MissingTarget(InterruptType),

    #[error("Plan execution {0} has already finished")]
    PlanFinished(Uuid),

    #[error("Node execution {node_execution_id} does not belong to plan execution {plan_execution_id}")]
    ForeignTarget {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
    },

    #[error("{interrupt_type} does not apply to node execution {node_execution_id} in status {status}")]
    InvalidNodeState {
        interrupt_type: InterruptType,
        node_execution_id: Uuid,
        status: Status,
    },

    #[error("{interrupt_type} does not apply while the plan execution is {status}")]
    InvalidPlanState {
        interrupt_type: InterruptType,
        status: Status,
    },
}

impl OrchestrationEngine {
    /// Persist an interrupt and queue it for processing
    pub async fn register_interrupt(
        &self,
        plan_execution_id: Uuid,
        interrupt_type: InterruptType,
        node_execution_id: Option<Uuid>,
        metadata: Value,
    ) -> EngineResult<Interrupt> {
        let plan_execution = self.get_plan_execution(plan_execution_id).await?;
        if plan_execution.is_final() {
            return Err(InterruptError::PlanFinished(plan_execution_id).into());
        }
        if interrupt_type.requires_target() && node_execution_id.is_none() {
            return Err(InterruptError::MissingTarget(interrupt_type).into());
        }
        if let Some(target) = node_execution_id {
            let node = self.get_node_execution(target).await?;
            if node.plan_execution_id != plan_execution_id {
                return Err(InterruptError::ForeignTarget {
                    plan_execution_id,
                    node_execution_id: target,
                }
                .into());
            }
        }

        let store = self.store();
        let candidate = Interrupt::new(plan_execution_id, interrupt_type, node_execution_id, 0).with_metadata(metadata);
        let record = &candidate;
        let interrupt = self
            .persist("insert interrupt", move || store.insert_interrupt(record))
            .await?;

        info!(
            "Registered {} interrupt {} on plan execution {}",
            interrupt_type, interrupt.id, plan_execution_id
        );
        self.emit_event(ExecutionEvent::InterruptRegistered {
            plan_execution_id,
            interrupt_id: interrupt.id,
            interrupt_type,
        })
        .await;
        self.publish(EngineMessage::Interrupt { plan_execution_id })?;
        Ok(interrupt)
    }

    /// Apply every registered interrupt of a plan execution, oldest first
    pub(super) async fn process_interrupts(&self, plan_execution_id: Uuid) -> EngineResult<()> {
        let store = self.store();
        let registered = self
            .persist("load registered interrupts", move || store.registered_interrupts(plan_execution_id))
            .await?;

        for interrupt in registered {
            let Some(claimed) = self.set_interrupt_state(&interrupt, InterruptState::Processing, None).await? else {
                debug!("Interrupt {} claimed elsewhere", interrupt.id);
                continue;
            };

            let result = self.apply_interrupt(&claimed).await;
            let (state, message) = match &result {
                Ok(()) => (InterruptState::ProcessedSuccessfully, None),
                Err(e) => {
                    warn!("{} interrupt {} failed: {}", claimed.interrupt_type, claimed.id, e);
                    (InterruptState::ProcessedUnsuccessfully, Some(e.to_string()))
                }
            };

            if let Some(processed) = self.set_interrupt_state(&claimed, state, message).await? {
                self.emit_event(ExecutionEvent::InterruptProcessed {
                    plan_execution_id,
                    interrupt_id: processed.id,
                    state: processed.state,
                })
                .await;
            }

            if let Err(e) = result {
                if e.is_persistence_failure() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Conditional state change of an interrupt; `None` if someone else moved it
    async fn set_interrupt_state(
        &self,
        interrupt: &Interrupt,
        state: InterruptState,
        message: Option<String>,
    ) -> EngineResult<Option<Interrupt>> {
        let mut next = interrupt.clone();
        next.state = state;
        next.message = message;

        let store = self.store();
        let record = &next;
        match self
            .persist("update interrupt", move || store.update_interrupt(record))
            .await
        {
            Ok(updated) => Ok(Some(updated)),
            Err(EngineError::Store(e)) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply_interrupt(&self, interrupt: &Interrupt) -> EngineResult<()> {
        let kind = interrupt.interrupt_type;
        let target = || {
            interrupt
                .node_execution_id
                .ok_or(EngineError::Interrupt(InterruptError::MissingTarget(kind)))
        };

        match kind {
            InterruptType::Abort => match interrupt.node_execution_id {
                None => self.abort_plan(interrupt).await,
                Some(target) => self.abort_subtree(interrupt, target).await,
            },
            InterruptType::PauseAll => self.pause_plan(interrupt).await,
            InterruptType::ResumeAll => self.resume_plan(interrupt).await,
            InterruptType::Retry => self.retry_interrupt(interrupt, target()?).await,
            InterruptType::MarkExpired => self.expire_node(interrupt, target()?).await,
            InterruptType::MarkSuccess => self.mark_node(interrupt, target()?, Status::Succeeded).await,
            InterruptType::MarkFailed => self.mark_node(interrupt, target()?, Status::Failed).await,
            InterruptType::Ignore => self.ignore_interrupt(interrupt, target()?).await,
        }
    }

    fn invalid_state(interrupt: &Interrupt, execution: &NodeExecution) -> EngineError {
        InterruptError::InvalidNodeState {
            interrupt_type: interrupt.interrupt_type,
            node_execution_id: execution.id,
            status: execution.status,
        }
        .into()
    }

    async fn abort_plan(&self, interrupt: &Interrupt) -> EngineResult<()> {
        let plan_execution_id = interrupt.plan_execution_id;
        // The plan goes first so in-flight resumes and late starts are dropped
        let interrupt_id = interrupt.id;
        let aborted_plan = self
            .update_plan_execution(plan_execution_id, |p| {
                if p.is_final() {
                    return false;
                }
                p.status = Status::Aborted;
                p.ended_at = Some(Utc::now());
                p.interrupt_id = Some(interrupt_id);
                true
            })
            .await?;
        if aborted_plan.is_none() {
            return Err(InterruptError::PlanFinished(plan_execution_id).into());
        }

        let executions = self.node_executions(plan_execution_id).await?;
        let mut aborted = 0;
        for execution in executions.iter().filter(|e| !e.status.is_final()) {
            if self.discontinue(execution.id, interrupt, true).await? {
                aborted += 1;
            }
        }

        info!("Aborted plan execution {} ({} node executions)", plan_execution_id, aborted);
        self.emit_event(ExecutionEvent::PlanCompleted {
            plan_execution_id,
            status: Status::Aborted,
        })
        .await;
        Ok(())
    }

    /// Abort one node execution and everything below it
    async fn abort_subtree(&self, interrupt: &Interrupt, target: Uuid) -> EngineResult<()> {
        let execution = self.load_node(target).await?;
        if execution.status.is_final() {
            return Err(Self::invalid_state(interrupt, &execution));
        }

        for descendant in self.descendants(target).await? {
            if !descendant.status.is_final() {
                self.discontinue(descendant.id, interrupt, true).await?;
            }
        }

        if !self.discontinue(target, interrupt, false).await? {
            return Err(Self::invalid_state(interrupt, &execution));
        }
        // The target still goes through its advisers so the surrounding flow reacts
        self.publish(EngineMessage::Advise {
            node_execution_id: target,
            from_status: execution.status,
        })
    }

    /// DISCONTINUING -> ABORTED, cancelling outstanding tasks in between
    async fn discontinue(&self, id: Uuid, interrupt: &Interrupt, conclude: bool) -> EngineResult<bool> {
        let Some(discontinuing) = self
            .transition_node(id, &[], Status::Discontinuing, |e| {
                e.record_interrupt(interrupt.id, interrupt.interrupt_type);
            })
            .await?
        else {
            return Ok(false);
        };
        self.abort_tasks(&discontinuing);

        let failure = FailureInfo::with_types("Aborted by interrupt", std::iter::empty()).with_interrupt(interrupt.id);
        let aborted = self
            .transition_node(id, &[Status::Discontinuing], Status::Aborted, |e| {
                e.failure = Some(failure.clone());
                e.concluded = conclude;
            })
            .await?;
        Ok(aborted.is_some())
    }

    /// Every node execution below `root`, breadth first
    async fn descendants(&self, root: Uuid) -> EngineResult<Vec<NodeExecution>> {
        let store = self.store();
        let mut found = Vec::new();
        let mut frontier = vec![root];
        while let Some(parent_id) = frontier.pop() {
            let children = self
                .persist("load children", move || store.children_of(parent_id))
                .await?;
            frontier.extend(children.iter().map(|c| c.id));
            found.extend(children);
        }
        Ok(found)
    }

    async fn pause_plan(&self, interrupt: &Interrupt) -> EngineResult<()> {
        let plan_execution_id = interrupt.plan_execution_id;
        let mut previous = Status::Running;
        let paused = self
            .update_plan_execution(plan_execution_id, |p| {
                previous = p.status;
                if p.status != Status::Running {
                    return false;
                }
                p.status = Status::Paused;
                true
            })
            .await?;
        if paused.is_none() {
            return Err(InterruptError::InvalidPlanState {
                interrupt_type: interrupt.interrupt_type,
                status: previous,
            }
            .into());
        }

        for execution in self.active_executions(plan_execution_id).await? {
            if execution.status != Status::TaskWaiting {
                continue;
            }
            self.transition_node(execution.id, &[Status::TaskWaiting], Status::Paused, |e| {
                e.held_from = Some(Status::TaskWaiting);
                e.record_interrupt(interrupt.id, interrupt.interrupt_type);
            })
            .await?;
        }
        info!("Paused plan execution {}", plan_execution_id);
        Ok(())
    }

    async fn resume_plan(&self, interrupt: &Interrupt) -> EngineResult<()> {
        let plan_execution_id = interrupt.plan_execution_id;
        let mut previous = Status::Paused;
        let resumed = self
            .update_plan_execution(plan_execution_id, |p| {
                previous = p.status;
                if p.status != Status::Paused {
                    return false;
                }
                p.status = Status::Running;
                true
            })
            .await?;
        if resumed.is_none() {
            return Err(InterruptError::InvalidPlanState {
                interrupt_type: interrupt.interrupt_type,
                status: previous,
            }
            .into());
        }

        for execution in self.active_executions(plan_execution_id).await? {
            let execution = match execution.status {
                Status::Paused => {
                    let restore = execution.held_from.unwrap_or(Status::TaskWaiting);
                    let restored = self
                        .transition_node(execution.id, &[Status::Paused], restore, |e| {
                            e.held_from = None;
                            e.record_interrupt(interrupt.id, interrupt.interrupt_type);
                        })
                        .await?;
                    match restored {
                        Some(restored) => restored,
                        None => continue,
                    }
                }
                _ => execution,
            };

            match execution.status {
                Status::Queued => self.schedule_start(&execution)?,
                Status::TaskWaiting if execution.pending_callbacks.is_empty() => {
                    self.publish(EngineMessage::Wake {
                        node_execution_id: execution.id,
                    })?
                }
                _ => {}
            }
        }
        info!("Resumed plan execution {}", plan_execution_id);
        Ok(())
    }

    async fn retry_interrupt(&self, interrupt: &Interrupt, target: Uuid) -> EngineResult<()> {
        let execution = self.load_node(target).await?;
        let parked = matches!(execution.status, Status::InterventionWaiting | Status::Suspended);
        let open_failure = execution.status.is_broken() && !execution.concluded;
        if execution.old_retry || !(parked || open_failure) {
            return Err(Self::invalid_state(interrupt, &execution));
        }

        let execution = if parked {
            self.transition_node(target, &[execution.status], Status::Failed, |_| {})
                .await?
                .ok_or_else(|| Self::invalid_state(interrupt, &execution))?
        } else {
            execution
        };

        let node = self
            .node_definition(&execution.ambiance.plan_id, &execution.node_id)
            .await?;
        self.retry_node(&execution, &node, Duration::ZERO, None, Some(interrupt))
            .await
    }

    async fn expire_node(&self, interrupt: &Interrupt, target: Uuid) -> EngineResult<()> {
        let execution = self.load_node(target).await?;
        if execution.status == Status::InterventionWaiting {
            return self.intervention_timed_out(interrupt, execution).await;
        }
        if execution.status.is_final() {
            return Err(Self::invalid_state(interrupt, &execution));
        }

        let failure = FailureInfo::new("Node execution timed out", FailureType::Timeout).with_interrupt(interrupt.id);
        let Some(expired) = self
            .transition_node(target, &[], Status::Expired, |e| {
                e.failure = Some(failure.clone());
                e.record_interrupt(interrupt.id, interrupt.interrupt_type);
            })
            .await?
        else {
            return Err(Self::invalid_state(interrupt, &execution));
        };

        // After the status change, so late task results find a final node
        self.expire_tasks(&expired);
        for descendant in self.descendants(target).await? {
            if !descendant.status.is_final() {
                self.discontinue(descendant.id, interrupt, true).await?;
            }
        }

        info!("Expired node execution {} ({})", target, expired.node_id);
        self.publish(EngineMessage::Advise {
            node_execution_id: target,
            from_status: execution.status,
        })
    }

    /// The intervention window of a parked node ran out
    async fn intervention_timed_out(&self, interrupt: &Interrupt, execution: NodeExecution) -> EngineResult<()> {
        let action = execution
            .adviser_responses
            .iter()
            .rev()
            .find_map(|r| match r {
                AdviserResponse::InterventionWaiting { timeout_action, .. } => Some(*timeout_action),
                _ => None,
            })
            .unwrap_or_default();
        info!("Intervention on {} timed out, applying {:?}", execution.id, action);

        match action {
            InterventionTimeoutAction::Ignore => {
                let node = self
                    .node_definition(&execution.ambiance.plan_id, &execution.node_id)
                    .await?;
                self.ignore_failure(&execution, &node.next, None, Some(interrupt)).await
            }
            InterventionTimeoutAction::MarkAsFailure | InterventionTimeoutAction::EndExecution => {
                let failed = self
                    .transition_node(execution.id, &[Status::InterventionWaiting], Status::Failed, |e| {
                        e.record_interrupt(interrupt.id, interrupt.interrupt_type);
                    })
                    .await?
                    .ok_or_else(|| Self::invalid_state(interrupt, &execution))?;

                if action == InterventionTimeoutAction::EndExecution {
                    self.end_plan(&failed, None, "Intervention window expired").await
                } else {
                    self.conclude(failed.id, None).await
                }
            }
        }
    }

    /// MARK_SUCCESS / MARK_FAILED on a parked node
    async fn mark_node(&self, interrupt: &Interrupt, target: Uuid, status: Status) -> EngineResult<()> {
        let execution = self.load_node(target).await?;
        if !matches!(execution.status, Status::InterventionWaiting | Status::Suspended) {
            return Err(Self::invalid_state(interrupt, &execution));
        }

        let failure = (status == Status::Failed).then(|| {
            execution
                .failure
                .clone()
                .unwrap_or_else(|| FailureInfo::new("Marked as failed", FailureType::Unknown))
                .with_interrupt(interrupt.id)
        });
        let marked = self
            .transition_node(target, &[execution.status], status, |e| {
                e.failure = failure.clone();
                e.held_from = None;
                e.record_interrupt(interrupt.id, interrupt.interrupt_type);
            })
            .await?
            .ok_or_else(|| Self::invalid_state(interrupt, &execution))?;
        info!("Marked node execution {} as {}", target, marked.status);

        // A failure confirmed by an operator is not advised a second time
        if execution.status == Status::InterventionWaiting && status == Status::Failed {
            return self.conclude(target, None).await;
        }
        self.publish(EngineMessage::Advise {
            node_execution_id: target,
            from_status: execution.status,
        })
    }

    async fn ignore_interrupt(&self, interrupt: &Interrupt, target: Uuid) -> EngineResult<()> {
        let execution = self.load_node(target).await?;
        let ignorable = execution.status == Status::InterventionWaiting
            || (execution.status.is_broken() && !execution.concluded);
        if !ignorable {
            return Err(Self::invalid_state(interrupt, &execution));
        }

        let node = self
            .node_definition(&execution.ambiance.plan_id, &execution.node_id)
            .await?;
        self.ignore_failure(&execution, &node.next, None, Some(interrupt)).await
    }
}
