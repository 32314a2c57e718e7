//! Callback resolution and progress heartbeats

use super::engine::{EngineResult, OrchestrationEngine};
use crate::{
    core::{InterruptFilter, InterruptState, InterruptType, Status},
    dispatch::TaskResponse,
};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl OrchestrationEngine {
    /// Record one resolved callback, driving the node once nothing is pending
    pub(super) async fn resume_node(&self, id: Uuid, callback_id: String, response: TaskResponse) -> EngineResult<()> {
        let execution = self.load_node(id).await?;
        if !execution.pending_callbacks.contains(&callback_id) {
            debug!("Callback {} is not pending on {}, ignoring", callback_id, id);
            return Ok(());
        }
        if !matches!(execution.status, Status::TaskWaiting | Status::Paused) {
            debug!("Node execution {} is {}, dropping callback {}", id, execution.status, callback_id);
            return Ok(());
        }

        let plan_execution = self.get_plan_execution(execution.plan_execution_id).await?;
        if plan_execution.is_final() {
            debug!("Plan execution {} already ended, dropping callback {}", plan_execution.id, callback_id);
            return Ok(());
        }
        if self.abort_pending(plan_execution.id, id).await? {
            info!("Abort pending for {}, dropping callback {}", id, callback_id);
            return Ok(());
        }

        let Some(updated) = self
            .update_node(id, |e| {
                if !matches!(e.status, Status::TaskWaiting | Status::Paused) || !e.pending_callbacks.remove(&callback_id) {
                    return false;
                }
                e.resolved_responses.insert(callback_id.clone(), response.clone());
                true
            })
            .await?
        else {
            debug!("Callback {} of {} was consumed concurrently", callback_id, id);
            return Ok(());
        };

        debug!(
            "Node execution {} resolved callback {} ({} pending)",
            id,
            callback_id,
            updated.pending_callbacks.len()
        );
        if updated.pending_callbacks.is_empty()
            && updated.status == Status::TaskWaiting
            && plan_execution.status != Status::Paused
        {
            self.drive_async(id).await?;
        }
        Ok(())
    }

    /// Re-evaluate a node that may have become runnable while it was held
    pub(super) async fn wake_node(&self, id: Uuid) -> EngineResult<()> {
        let execution = self.load_node(id).await?;
        match execution.status {
            Status::Queued => self.start_node(id).await,
            Status::TaskWaiting if execution.pending_callbacks.is_empty() => {
                let plan_execution = self.get_plan_execution(execution.plan_execution_id).await?;
                if plan_execution.status == Status::Paused {
                    return Ok(());
                }
                self.drive_async(id).await
            }
            status => {
                debug!("Nothing to wake on {} ({})", id, status);
                Ok(())
            }
        }
    }

    pub(super) async fn record_progress(&self, id: Uuid, data: Value) -> EngineResult<()> {
        let now = Utc::now();
        let timeouts = self.timeouts();
        let updated = self
            .update_node(id, |e| {
                if e.status.is_final() {
                    return false;
                }
                e.progress = Some(data.clone());
                if let Some(instance) = e.timeout.as_mut() {
                    timeouts.on_progress(instance, now);
                }
                true
            })
            .await?;

        if updated.is_none() {
            warn!("Progress for finished node execution {} ignored", id);
        }
        Ok(())
    }

    /// Whether an abort covering `node_execution_id` is registered but not applied yet
    async fn abort_pending(&self, plan_execution_id: Uuid, node_execution_id: Uuid) -> EngineResult<bool> {
        let filter = InterruptFilter {
            states: Some(vec![InterruptState::Registered, InterruptState::Processing]),
            types: Some(vec![InterruptType::Abort]),
        };
        let pending = self.interrupt_history(plan_execution_id, &filter).await?;
        Ok(pending
            .iter()
            .any(|i| i.node_execution_id.map_or(true, |target| target == node_execution_id)))
    }
}
