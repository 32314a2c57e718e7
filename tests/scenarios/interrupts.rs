//! Operator interrupts: abort, pause/resume, manual resolution

use crate::helpers::*;
use async_trait::async_trait;
use orchestrator::core::{
    Interrupt, InterruptFilter, InterruptState, InterruptType, NodeExecution, Plan, PlanExecution, Status,
};
use orchestrator::dispatch::TaskResponse;
use orchestrator::execution::{EngineError, InterruptError};
use orchestrator::persistence::{ExecutionStore, InMemoryStore, StoreResult};
use orchestrator::strategy::Executable;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const GATHER: &str = r#"
id: gather
start_node_id: gather
nodes:
  - id: gather
    step_type: record
    mode: async
"#;

/// Waits on a worker task that never finishes
const HELD: &str = r#"
id: held
start_node_id: hold
nodes:
  - id: hold
    step_type: wait
    mode: async
    step_parameters:
      task_type: pending
"#;

const PARKED: &str = r#"
id: parked
start_node_id: migrate
nodes:
  - id: migrate
    step_type: fail
    mode: sync
    advisers:
      - type: manual_intervention
    next: [announce]
  - id: announce
    step_type: noop
    mode: sync
"#;

#[tokio::test]
async fn test_abort_wins_over_pending_resume() {
    let step = Arc::new(RecordingAsyncStep::default());
    let h = harness().step("record", Executable::Async(step.clone())).start().await;
    let id = h.run(GATHER).await;
    let waiting = wait_for_node(&h.engine, id, "gather", |e| e.status == Status::TaskWaiting).await;

    let abort = h
        .engine
        .register_interrupt(id, InterruptType::Abort, None, json!({"reason": "bad release"}))
        .await
        .unwrap();
    for callback in &waiting.pending_callbacks {
        h.engine
            .resume_callback(callback, TaskResponse::success(json!("late")))
            .await
            .unwrap();
    }

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Aborted);
    assert_eq!(finished.interrupt_id, Some(abort.id));

    let gather = wait_for_node(&h.engine, id, "gather", |e| e.status.is_final()).await;
    assert_eq!(gather.status, Status::Aborted);
    assert_eq!(gather.failure.as_ref().unwrap().interrupt_id, Some(abort.id));
    assert!(gather.resolved_responses.is_empty());
    assert!(step.deliveries().is_empty());

    let history = h.engine.interrupt_history(id, &InterruptFilter::default()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, InterruptState::ProcessedSuccessfully);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_racing_resumes_still_aborts() {
    let step = Arc::new(RecordingAsyncStep::default());
    let h = harness().step("record", Executable::Async(step.clone())).start().await;
    let id = h
        .run(
            r#"
id: racing
start_node_id: gather
nodes:
  - id: gather
    step_type: record
    mode: async
    step_parameters:
      tasks: 4
"#,
        )
        .await;
    let waiting = wait_for_node(&h.engine, id, "gather", |e| e.status == Status::TaskWaiting).await;
    let mut callbacks: Vec<String> = waiting.pending_callbacks.iter().cloned().collect();
    let last = callbacks.pop().unwrap();

    let mut resumes = Vec::new();
    for callback in callbacks {
        let engine = h.engine.clone();
        resumes.push(tokio::spawn(async move {
            engine
                .resume_callback(&callback, TaskResponse::success(json!("raced")))
                .await
        }));
    }
    let engine = h.engine.clone();
    let abort = tokio::spawn(async move {
        engine
            .register_interrupt(id, InterruptType::Abort, None, Value::Null)
            .await
    });
    for resume in resumes {
        resume.await.unwrap().unwrap();
    }
    let abort = abort.await.unwrap().unwrap();

    // The final result only arrives once the abort is on record
    h.engine
        .resume_callback(&last, TaskResponse::success(json!("late")))
        .await
        .unwrap();

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Aborted);
    assert_eq!(finished.interrupt_id, Some(abort.id));

    let gather = wait_for_node(&h.engine, id, "gather", |e| e.status.is_final()).await;
    assert_eq!(gather.status, Status::Aborted);
    assert!(!gather.resolved_responses.contains_key(&last));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(step.deliveries().is_empty());
}

#[tokio::test]
async fn test_pause_holds_callbacks_until_resume() {
    let step = Arc::new(RecordingAsyncStep::default());
    let h = harness().step("record", Executable::Async(step.clone())).start().await;
    let id = h.run(GATHER).await;
    let waiting = wait_for_node(&h.engine, id, "gather", |e| e.status == Status::TaskWaiting).await;

    h.engine
        .register_interrupt(id, InterruptType::PauseAll, None, Value::Null)
        .await
        .unwrap();
    wait_for_node(&h.engine, id, "gather", |e| e.status == Status::Paused).await;
    assert_eq!(h.engine.get_plan_execution(id).await.unwrap().status, Status::Paused);

    for callback in &waiting.pending_callbacks {
        h.engine
            .resume_callback(callback, TaskResponse::success(json!(callback)))
            .await
            .unwrap();
    }
    let held = wait_for_node(&h.engine, id, "gather", |e| e.pending_callbacks.is_empty()).await;
    assert_eq!(held.status, Status::Paused);
    assert_eq!(held.held_from, Some(Status::TaskWaiting));
    assert_eq!(held.resolved_responses.len(), 2);
    assert!(step.deliveries().is_empty());

    h.engine
        .register_interrupt(id, InterruptType::ResumeAll, None, Value::Null)
        .await
        .unwrap();
    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);
    assert_eq!(step.deliveries().len(), 1);

    let gather = h.engine.get_node_execution(waiting.id).await.unwrap();
    let applied: Vec<_> = gather.interrupt_history.iter().map(|i| i.interrupt_type).collect();
    assert_eq!(applied, vec![InterruptType::PauseAll, InterruptType::ResumeAll]);
    assert!(gather.held_from.is_none());
}

/// Store that pauses the plan the moment a node's last callback is recorded,
/// before the node can be claimed
struct PauseOnLastCallback {
    inner: InMemoryStore,
    armed: AtomicBool,
}

#[async_trait]
impl ExecutionStore for PauseOnLastCallback {
    async fn save_plan(&self, plan: &Plan) -> StoreResult<()> {
        self.inner.save_plan(plan).await
    }

    async fn get_plan(&self, plan_id: &str) -> StoreResult<Option<Plan>> {
        self.inner.get_plan(plan_id).await
    }

    async fn insert_plan_execution(&self, execution: &PlanExecution) -> StoreResult<()> {
        self.inner.insert_plan_execution(execution).await
    }

    async fn get_plan_execution(&self, id: Uuid) -> StoreResult<Option<PlanExecution>> {
        self.inner.get_plan_execution(id).await
    }

    async fn update_plan_execution(&self, execution: &PlanExecution) -> StoreResult<PlanExecution> {
        self.inner.update_plan_execution(execution).await
    }

    async fn list_plan_executions(&self, limit: usize) -> StoreResult<Vec<PlanExecution>> {
        self.inner.list_plan_executions(limit).await
    }

    async fn insert_node_execution(&self, execution: &NodeExecution) -> StoreResult<()> {
        self.inner.insert_node_execution(execution).await
    }

    async fn get_node_execution(&self, id: Uuid) -> StoreResult<Option<NodeExecution>> {
        self.inner.get_node_execution(id).await
    }

    async fn update_node_execution(&self, execution: &NodeExecution) -> StoreResult<NodeExecution> {
        let updated = self.inner.update_node_execution(execution).await?;
        let drained = updated.status == Status::TaskWaiting
            && updated.pending_callbacks.is_empty()
            && !updated.resolved_responses.is_empty();
        if drained && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(mut plan_execution) = self.inner.get_plan_execution(updated.plan_execution_id).await? {
                plan_execution.status = Status::Paused;
                self.inner.update_plan_execution(&plan_execution).await?;
            }
        }
        Ok(updated)
    }

    async fn find_node_execution_by_callback(&self, callback_id: &str) -> StoreResult<Option<NodeExecution>> {
        self.inner.find_node_execution_by_callback(callback_id).await
    }

    async fn node_executions_for_plan(&self, plan_execution_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        self.inner.node_executions_for_plan(plan_execution_id).await
    }

    async fn node_executions_with_status(&self, statuses: &[Status]) -> StoreResult<Vec<NodeExecution>> {
        self.inner.node_executions_with_status(statuses).await
    }

    async fn children_of(&self, parent_id: Uuid) -> StoreResult<Vec<NodeExecution>> {
        self.inner.children_of(parent_id).await
    }

    async fn insert_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt> {
        self.inner.insert_interrupt(interrupt).await
    }

    async fn get_interrupt(&self, id: Uuid) -> StoreResult<Option<Interrupt>> {
        self.inner.get_interrupt(id).await
    }

    async fn update_interrupt(&self, interrupt: &Interrupt) -> StoreResult<Interrupt> {
        self.inner.update_interrupt(interrupt).await
    }

    async fn interrupts_for_plan(
        &self,
        plan_execution_id: Uuid,
        filter: &InterruptFilter,
    ) -> StoreResult<Vec<Interrupt>> {
        self.inner.interrupts_for_plan(plan_execution_id, filter).await
    }
}

#[tokio::test]
async fn test_pause_landing_before_claim_holds_the_node() {
    let store = Arc::new(PauseOnLastCallback {
        inner: InMemoryStore::new(),
        armed: AtomicBool::new(true),
    });
    let step = Arc::new(RecordingAsyncStep::default());
    let h = harness()
        .store(store.clone())
        .step("record", Executable::Async(step.clone()))
        .start()
        .await;
    let id = h.run(GATHER).await;
    let waiting = wait_for_node(&h.engine, id, "gather", |e| e.status == Status::TaskWaiting).await;

    for callback in &waiting.pending_callbacks {
        h.engine
            .resume_callback(callback, TaskResponse::success(json!(callback)))
            .await
            .unwrap();
    }
    let held = wait_for_node(&h.engine, id, "gather", |e| e.resolved_responses.len() == 2).await;
    assert!(!store.armed.load(Ordering::SeqCst));
    assert_eq!(h.engine.get_plan_execution(id).await.unwrap().status, Status::Paused);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let held = h.engine.get_node_execution(held.id).await.unwrap();
    assert_eq!(held.status, Status::TaskWaiting);
    assert!(step.deliveries().is_empty());

    h.engine
        .register_interrupt(id, InterruptType::ResumeAll, None, Value::Null)
        .await
        .unwrap();
    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);
    assert_eq!(step.deliveries().len(), 1);
}

#[tokio::test]
async fn test_interrupt_history_is_newest_first_and_filterable() {
    let h = harness().start().await;
    let id = h.run(HELD).await;
    wait_for_node(&h.engine, id, "hold", |e| e.status == Status::TaskWaiting).await;

    let pause = h
        .engine
        .register_interrupt(id, InterruptType::PauseAll, None, Value::Null)
        .await
        .unwrap();
    let resume = h
        .engine
        .register_interrupt(id, InterruptType::ResumeAll, None, Value::Null)
        .await
        .unwrap();
    assert!(resume.seq > pause.seq);

    wait_for_node(&h.engine, id, "hold", |e| e.interrupt_history.len() == 2).await;
    let processed = InterruptFilter::states(&[InterruptState::ProcessedSuccessfully]);
    let history = loop {
        let history = h.engine.interrupt_history(id, &processed).await.unwrap();
        if history.len() == 2 {
            break history;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert_eq!(history[0].id, resume.id);
    assert_eq!(history[1].id, pause.id);

    let pauses = h
        .engine
        .interrupt_history(id, &InterruptFilter::types(&[InterruptType::PauseAll]))
        .await
        .unwrap();
    assert_eq!(pauses.len(), 1);
    assert_eq!(pauses[0].id, pause.id);

    let failed = h
        .engine
        .interrupt_history(id, &InterruptFilter::states(&[InterruptState::ProcessedUnsuccessfully]))
        .await
        .unwrap();
    assert!(failed.is_empty());
    assert_eq!(h.engine.get_plan_execution(id).await.unwrap().status, Status::Running);
}

#[tokio::test]
async fn test_resume_without_pause_is_processed_unsuccessfully() {
    let h = harness().start().await;
    let id = h.run(HELD).await;
    wait_for_node(&h.engine, id, "hold", |e| e.status == Status::TaskWaiting).await;

    let resume = h
        .engine
        .register_interrupt(id, InterruptType::ResumeAll, None, Value::Null)
        .await
        .unwrap();
    let filter = InterruptFilter::states(&[InterruptState::ProcessedUnsuccessfully]);
    let rejected = loop {
        let found = h.engine.interrupt_history(id, &filter).await.unwrap();
        if let Some(interrupt) = found.into_iter().next() {
            break interrupt;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert_eq!(rejected.id, resume.id);
    assert!(rejected.message.unwrap().contains("RUNNING"));
}

#[tokio::test]
async fn test_mark_success_releases_parked_node() {
    let h = harness().start().await;
    let id = h.run(PARKED).await;
    let parked = wait_for_node(&h.engine, id, "migrate", |e| e.status == Status::InterventionWaiting).await;
    assert_eq!(parked.held_from, Some(Status::Failed));
    assert!(parked.timeout.is_some());
    assert!(executions_of(&h.engine, id, "announce").await.is_empty());

    let interrupt = h
        .engine
        .register_interrupt(id, InterruptType::MarkSuccess, Some(parked.id), Value::Null)
        .await
        .unwrap();

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);
    let migrate = h.engine.get_node_execution(parked.id).await.unwrap();
    assert_eq!(migrate.status, Status::Succeeded);
    assert_eq!(migrate.interrupt_history[0].interrupt_id, interrupt.id);
    assert_eq!(executions_of(&h.engine, id, "announce").await[0].status, Status::Succeeded);
}

#[tokio::test]
async fn test_ignore_continues_past_parked_node() {
    let h = harness().start().await;
    let id = h.run(PARKED).await;
    let parked = wait_for_node(&h.engine, id, "migrate", |e| e.status == Status::InterventionWaiting).await;

    h.engine
        .register_interrupt(id, InterruptType::Ignore, Some(parked.id), Value::Null)
        .await
        .unwrap();

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);
    let migrate = h.engine.get_node_execution(parked.id).await.unwrap();
    assert_eq!(migrate.status, Status::IgnoreFailed);
    assert!(migrate.failure.is_some());
    assert_eq!(executions_of(&h.engine, id, "announce").await[0].previous_id, Some(parked.id));
}

#[tokio::test]
async fn test_mark_failed_confirms_failure() {
    let h = harness().start().await;
    let id = h.run(PARKED).await;
    let parked = wait_for_node(&h.engine, id, "migrate", |e| e.status == Status::InterventionWaiting).await;

    h.engine
        .register_interrupt(id, InterruptType::MarkFailed, Some(parked.id), Value::Null)
        .await
        .unwrap();

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);
    let migrate = h.engine.get_node_execution(parked.id).await.unwrap();
    assert_eq!(migrate.status, Status::Failed);
    assert!(migrate.concluded);
    // Parked only once: the operator's decision is not advised again
    assert_eq!(migrate.adviser_responses.len(), 1);
    assert!(executions_of(&h.engine, id, "announce").await.is_empty());
}

#[tokio::test]
async fn test_registration_is_validated() {
    let h = harness().start().await;
    let id = h.run(PARKED).await;
    let parked = wait_for_node(&h.engine, id, "migrate", |e| e.status == Status::InterventionWaiting).await;

    let err = h
        .engine
        .register_interrupt(id, InterruptType::MarkSuccess, None, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Interrupt(InterruptError::MissingTarget(InterruptType::MarkSuccess))
    ));

    let other = h.run(HELD).await;
    let err = h
        .engine
        .register_interrupt(other, InterruptType::Retry, Some(parked.id), Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Interrupt(InterruptError::ForeignTarget { .. })));

    h.engine
        .register_interrupt(id, InterruptType::Abort, None, Value::Null)
        .await
        .unwrap();
    wait_for_plan(&h.engine, id).await;
    let err = h
        .engine
        .register_interrupt(id, InterruptType::Abort, None, Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Interrupt(InterruptError::PlanFinished(p)) if p == id));
}

#[tokio::test]
async fn test_abort_of_child_aborts_section() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: section_abort
start_node_id: stage
nodes:
  - id: stage
    step_type: section
    mode: child
    step_parameters:
      child_node_id: soak
  - id: soak
    step_type: wait
    mode: async
    step_parameters:
      task_type: pending
"#,
        )
        .await;
    let soak = wait_for_node(&h.engine, id, "soak", |e| e.status == Status::TaskWaiting).await;

    let interrupt = h
        .engine
        .register_interrupt(id, InterruptType::Abort, Some(soak.id), Value::Null)
        .await
        .unwrap();

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Aborted);

    let soak = h.engine.get_node_execution(soak.id).await.unwrap();
    assert_eq!(soak.status, Status::Aborted);
    assert_eq!(soak.interrupt_history[0].interrupt_id, interrupt.id);
    let stage = executions_of(&h.engine, id, "stage").await.remove(0);
    assert_eq!(stage.status, Status::Aborted);
}
