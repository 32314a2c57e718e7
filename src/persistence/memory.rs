//! In-memory persistence (for testing or ephemeral use)

use super::{interrupt_order, ExecutionStore, StoreError, StoreResult};
use crate::core::{Interrupt, InterruptFilter, NodeExecution, Plan, PlanExecution, Status};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    plans: HashMap<String, Plan>,
    plan_executions: HashMap<Uuid, PlanExecution>,
    node_executions: HashMap<Uuid, NodeExecution>,

    /// Insertion ordinal, breaks created_at ties
    node_order: HashMap<Uuid, u64>,
    next_ordinal: u64,

    callbacks: HashMap<String, Uuid>,
    interrupts: HashMap<Uuid, Interrupt>,
    interrupt_seq: HashMap<Uuid, u64>,
}

impl State {
    fn sorted(&self, mut executions: Vec<NodeExecution>) -> Vec<NodeExecution> {
        executions.sort_by_key(|e| (e.created_at, self.node_order.get(&e.id).copied().unwrap_or(u64::MAX)));
        executions
    }

    fn index_callbacks(&mut self, execution: &NodeExecution) {
        for callback in execution
            .pending_callbacks
            .iter()
            .chain(execution.resolved_responses.keys())
        {
            self.callbacks.insert(callback.clone(), execution.id);
        }
    }
}

/// Store backed by process memory
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    failing_writes: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with a backend error
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_write(&self) -> StoreResult<()> {
        let failed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failed {
            Ok(_) => Err(StoreError::Backend(anyhow::anyhow!("injected write failure"))),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryStore {
    async fn save_plan(&self, plan: &Plan) -> StoreResult<()> {
        self.check_write()?;
        let mut state = self.state.write().await;
        state.plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, plan_id: &str) -> StoreResult<Option<Plan>> {
        let state = self.state.read().await;
        Ok(state.plans.get(plan_id).cloned())
    }

    async fn insert_plan_execution(&self, execution: &PlanExecution) -> StoreResult<()> {
        self.check_write()?;
        let mut state = self.state.write().await;
        state.plan_executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_plan_execution(&self, id: Uuid) -> StoreResult<Option<PlanExecution>> {
        let state = self.state.read().await;
        Ok(state.plan_executions.get(&id).cloned())
    }

    async fn update_plan_execution(&self, execution: &PlanExecution) -> StoreResult<PlanExecution> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let stored = state
            .plan_executions
            .get_mut(&execution.id)
            .ok_or(StoreError::NotFound {
                entity: "plan execution",
                id: execution.id,
            })?;

        if stored.version != execution.version {
            return Err(StoreError::Conflict {
                entity: "plan execution",
                id: execution.id,
            });
        }

        let mut updated = execution.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list_plan_executions(&self, limit: usize) -> StoreResult<Vec<PlanExecution>> {
        let state = self.state.read().await;
        let mut executions: Vec<_> = state.plan_executions.values().cloned().collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(limit);
        Ok(executions)
    }

    async fn insert_node_execution(&self, execution: &NodeExecution) -> StoreResult<()> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        state.node_order.insert(execution.id, ordinal);
        state.index_callbacks(execution);
        state.node_executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_node_execution(&self, id: Uuid) -> StoreResult<Option<NodeExecution>> {
        let state = self.state.read().await;
        Ok(state.node_executions.get(&id).cloned())
    }

    async fn update_node_execution(&self, execution: &NodeExecution) -> StoreResult<NodeExecution> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let stored = state
            .node_executions
            .get_mut(&execution.id)
            .ok_or(StoreError::NotFound {
                entity: "node execution",
                id: execution.id,
            })?;

        if stored.version != execution.version {
            return Err(StoreError::Conflict {
                entity: "node execution",
                id: execution.id,
            });
        }

        let mut updated = execution.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        state.index_callbacks(&updated);
        Ok(updated)
    }

    async fn find_node_execution_by_callback(&self, callback_id: &str) -> StoreResult<Option<NodeExecution>> {
        let state = self.state.read().await;
        Ok(state
            .callbacks
            .get(callback_id)
            .and_then(|id| state.node_executions.get(id))
            .cloned())
    }

    async fn node_executions_for_plan(&self, plan_execution_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        let state = self.state.read().await;
        let executions = state
            .node_executions
            .values()
            .filter(|e| e.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        Ok(state.sorted(executions))
    }

    async fn node_executions_with_status(&self, statuses: &[Status]) -> StoreResult<Vec<NodeExecution>> {
        let state = self.state.read().await;
        let executions = state
            .node_executions
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect();
        Ok(state.sorted(executions))
    }

    async fn children_of(&self, parent_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        let state = self.state.read().await;
        let executions = state
            .node_executions
            .values()
            .filter(|e| e.parent_id == Some(parent_id))
            .cloned()
            .collect();
        Ok(state.sorted(executions))
    }

    async fn insert_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let seq = state.interrupt_seq.entry(interrupt.plan_execution_id).or_insert(0);
        *seq += 1;

        let mut stored = interrupt.clone();
        stored.seq = *seq;
        state.interrupts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_interrupt(&self, id: Uuid) -> StoreResult<Option<Interrupt>> {
        let state = self.state.read().await;
        Ok(state.interrupts.get(&id).cloned())
    }

    async fn update_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt> {
        self.check_write()?;
        let mut state = self.state.write().await;
        let stored = state.interrupts.get_mut(&interrupt.id).ok_or(StoreError::NotFound {
            entity: "interrupt",
            id: interrupt.id,
        })?;

        if stored.version != interrupt.version {
            return Err(StoreError::Conflict {
                entity: "interrupt",
                id: interrupt.id,
            });
        }

        let mut updated = interrupt.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn interrupts_for_plan(
        &self,
        plan_execution_id: Uuid,
        filter: &InterruptFilter,
    ) -> StoreResult<Vec<Interrupt>> {
        let state = self.state.read().await;
        let mut interrupts: Vec<_> = state
            .interrupts
            .values()
            .filter(|i| i.plan_execution_id == plan_execution_id && filter.matches(i))
            .cloned()
            .collect();
        interrupts.sort_by(|a, b| interrupt_order(b, a));
        Ok(interrupts)
    }
}
