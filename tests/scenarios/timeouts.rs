//! Node timeouts and intervention windows

use crate::helpers::*;
use orchestrator::core::{FailureType, InterruptFilter, InterruptType, Status};
use orchestrator::dispatch::TaskResponse;
use orchestrator::strategy::Executable;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_expired_async_node_drops_late_callbacks() {
    let step = Arc::new(RecordingAsyncStep::default());
    let h = harness().step("record", Executable::Async(step.clone())).start().await;
    let id = h
        .run(
            r#"
id: expiring
start_node_id: gather
nodes:
  - id: gather
    step_type: record
    mode: async
    timeout:
      timeout_secs: 0
"#,
        )
        .await;

    let waiting = wait_for_node(&h.engine, id, "gather", |e| e.status == Status::TaskWaiting).await;
    let instance = waiting.timeout.clone().unwrap();
    assert_eq!(instance.dimension, "ABSOLUTE");

    let first = waiting.pending_callbacks.iter().next().unwrap().clone();
    h.engine
        .resume_callback(&first, TaskResponse::success(json!(1)))
        .await
        .unwrap();
    wait_for_node(&h.engine, id, "gather", |e| e.resolved_responses.contains_key(&first)).await;

    assert_eq!(h.engine.check_timeouts().await.unwrap(), 1);

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);

    let gather = h.engine.get_node_execution(waiting.id).await.unwrap();
    assert_eq!(gather.status, Status::Expired);
    assert!(gather.timeout.unwrap().expired_at.is_some());
    let failure = gather.failure.unwrap();
    assert!(failure.has_type(FailureType::Timeout));

    let expiries = h
        .engine
        .interrupt_history(id, &InterruptFilter::types(&[InterruptType::MarkExpired]))
        .await
        .unwrap();
    assert_eq!(expiries.len(), 1);
    assert_eq!(failure.interrupt_id, Some(expiries[0].id));
    assert_eq!(expiries[0].node_execution_id, Some(waiting.id));
    assert_eq!(expiries[0].metadata["source"], json!("timeout"));
    assert_eq!(expiries[0].metadata["timeout_instance_id"], json!(instance.id));

    // The remaining task result arrives after expiry
    for callback in &waiting.pending_callbacks {
        h.engine
            .resume_callback(callback, TaskResponse::success(json!(2)))
            .await
            .unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(step.deliveries().is_empty());
    assert_eq!(h.engine.check_timeouts().await.unwrap(), 0);
}

#[tokio::test]
async fn test_nodes_within_timeout_are_left_alone() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: patient
start_node_id: hold
nodes:
  - id: hold
    step_type: wait
    mode: async
    step_parameters:
      task_type: pending
    timeout:
      timeout_secs: 3600
"#,
        )
        .await;
    wait_for_node(&h.engine, id, "hold", |e| e.status == Status::TaskWaiting).await;

    assert_eq!(h.engine.check_timeouts().await.unwrap(), 0);
    assert_eq!(h.engine.get_plan_execution(id).await.unwrap().status, Status::Running);
}

#[tokio::test]
async fn test_out_of_range_timeout_is_never_due() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: forever
start_node_id: hold
nodes:
  - id: hold
    step_type: wait
    mode: async
    step_parameters:
      task_type: pending
    timeout:
      timeout_secs: 18446744073709551615
"#,
        )
        .await;
    let waiting = wait_for_node(&h.engine, id, "hold", |e| e.status == Status::TaskWaiting).await;
    assert_eq!(waiting.timeout.unwrap().timeout_secs, u64::MAX);

    let engine = h.engine.clone();
    let scan = tokio::spawn(async move { engine.check_timeouts().await });
    assert_eq!(scan.await.unwrap().unwrap(), 0);
    assert_eq!(h.engine.get_plan_execution(id).await.unwrap().status, Status::Running);
}

#[tokio::test]
async fn test_progress_extends_active_timeout() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: heartbeat
start_node_id: hold
nodes:
  - id: hold
    step_type: wait
    mode: async
    step_parameters:
      task_type: pending
    timeout:
      dimension: ACTIVE
      timeout_secs: 3600
"#,
        )
        .await;
    let waiting = wait_for_node(&h.engine, id, "hold", |e| e.status == Status::TaskWaiting).await;
    let before = waiting.timeout.clone().unwrap();
    assert_eq!(before.dimension, "ACTIVE");

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.engine
        .report_progress(waiting.id, json!({"percent": 40}))
        .unwrap();

    let progressed = wait_for_node(&h.engine, id, "hold", |e| e.progress.is_some()).await;
    assert_eq!(progressed.progress, Some(json!({"percent": 40})));
    let after = progressed.timeout.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.started_at, before.started_at);
    assert!(after.last_progress_at > before.last_progress_at);
}

#[tokio::test]
async fn test_intervention_window_expiry_applies_timeout_action() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: unattended
start_node_id: migrate
nodes:
  - id: migrate
    step_type: fail
    mode: sync
    advisers:
      - type: manual_intervention
        parameters:
          timeout_secs: 0
          timeout_action: IGNORE
    next: [announce]
  - id: announce
    step_type: noop
    mode: sync
"#,
        )
        .await;

    let parked = wait_for_node(&h.engine, id, "migrate", |e| e.status == Status::InterventionWaiting).await;
    assert_eq!(h.engine.check_timeouts().await.unwrap(), 1);

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);

    let migrate = h.engine.get_node_execution(parked.id).await.unwrap();
    assert_eq!(migrate.status, Status::IgnoreFailed);
    assert_eq!(migrate.interrupt_history[0].interrupt_type, InterruptType::MarkExpired);
    assert_eq!(executions_of(&h.engine, id, "announce").await[0].status, Status::Succeeded);
}

#[tokio::test]
async fn test_intervention_window_expiry_marks_failure_by_default() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: unattended_fail
start_node_id: migrate
nodes:
  - id: migrate
    step_type: fail
    mode: sync
    advisers:
      - type: manual_intervention
        parameters:
          timeout_secs: 0
"#,
        )
        .await;

    let parked = wait_for_node(&h.engine, id, "migrate", |e| e.status == Status::InterventionWaiting).await;
    assert_eq!(h.engine.check_timeouts().await.unwrap(), 1);

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);
    let migrate = h.engine.get_node_execution(parked.id).await.unwrap();
    assert_eq!(migrate.status, Status::Failed);
    assert!(migrate.concluded);
}
