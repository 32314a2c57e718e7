//! Retry adviser and RETRY interrupts

use crate::helpers::*;
use chrono::{DateTime, Utc};
use orchestrator::advise::{AdviseError, Adviser, AdviserResponse, AdvisingEvent};
use orchestrator::core::{InterruptType, Status};
use orchestrator::strategy::Executable;
use serde_json::Value;
use std::sync::Arc;

/// Retries the first failure after a wait no calendar can hold
struct EndlessWaitAdviser;

impl Adviser for EndlessWaitAdviser {
    fn can_advise(&self, event: &AdvisingEvent<'_>) -> bool {
        event.to_status.is_broken() && event.retry_attempt() == 0
    }

    fn on_advise_event(&self, event: &AdvisingEvent<'_>) -> Option<AdviserResponse> {
        Some(AdviserResponse::Retry {
            wait_interval_secs: u64::MAX,
            attempt: event.retry_attempt() + 1,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_then_ignores_after_max_attempts() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: retrying
start_node_id: deploy
nodes:
  - id: deploy
    step_type: fail
    mode: sync
    step_parameters:
      message: registry unavailable
      failure_type: CONNECTIVITY
    advisers:
      - type: retry
        when: [FAILED]
        parameters:
          wait_intervals_secs: [1, 2, 5]
          max_retries: 3
          repair_action:
            action: IGNORE
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);

    let attempts = executions_of(&h.engine, id, "deploy").await;
    assert_eq!(attempts.len(), 4);

    let waits: Vec<i64> = attempts[1..]
        .iter()
        .map(|a| (a.queued_until.unwrap() - a.created_at).num_seconds())
        .collect();
    assert_eq!(waits, vec![1, 2, 5]);
    assert!(attempts[0].queued_until.is_none());

    for (n, old) in attempts[..3].iter().enumerate() {
        assert_eq!(old.status, Status::Failed);
        assert!(old.old_retry && old.concluded);
        assert_eq!(
            old.adviser_responses,
            vec![AdviserResponse::Retry {
                wait_interval_secs: [1, 2, 5][n],
                attempt: n + 1,
            }]
        );
    }

    let last = &attempts[3];
    assert_eq!(last.status, Status::IgnoreFailed);
    assert!(!last.old_retry);
    assert_eq!(last.retry_ids, attempts[..3].iter().map(|a| a.id).collect::<Vec<_>>());
    assert_eq!(last.ambiance.levels.last().unwrap().order, 3);
    assert_eq!(last.failure.as_ref().unwrap().message, "registry unavailable");
    assert_eq!(
        last.adviser_responses,
        vec![AdviserResponse::IgnoreFailure { next_node_id: None }]
    );
}

#[tokio::test]
async fn test_retry_ignores_unlisted_failure_types() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: typed_retry
start_node_id: deploy
nodes:
  - id: deploy
    step_type: fail
    mode: sync
    advisers:
      - type: retry
        parameters:
          max_retries: 2
          failure_types: [TIMEOUT]
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);
    let attempts = executions_of(&h.engine, id, "deploy").await;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].adviser_responses.is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_mark_failure() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: exhausted
start_node_id: deploy
nodes:
  - id: deploy
    step_type: fail
    mode: sync
    advisers:
      - type: retry
        parameters:
          max_retries: 1
    next: [announce]
  - id: announce
    step_type: noop
    mode: sync
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);
    assert_eq!(executions_of(&h.engine, id, "deploy").await.len(), 2);
    assert!(executions_of(&h.engine, id, "announce").await.is_empty());
}

#[tokio::test]
async fn test_retry_wait_beyond_maximum_falls_back_to_default_advice() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: too_patient
start_node_id: deploy
nodes:
  - id: deploy
    step_type: fail
    mode: sync
    advisers:
      - type: retry
        parameters:
          wait_intervals_secs: [100000000000000]
          max_retries: 1
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);

    let attempts = executions_of(&h.engine, id, "deploy").await;
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].concluded);
    assert!(!attempts[0].old_retry);
    assert!(attempts[0].adviser_responses.is_empty());
}

#[tokio::test]
async fn test_unrepresentable_retry_wait_holds_the_attempt() {
    let h = harness()
        .adviser("endless_wait", Arc::new(|_: &Value| Ok::<_, AdviseError>(Box::new(EndlessWaitAdviser) as Box<dyn Adviser>)))
        .start()
        .await;
    let id = h
        .run(
            r#"
id: endless
start_node_id: deploy
nodes:
  - id: deploy
    step_type: fail
    mode: sync
    advisers:
      - type: endless_wait
"#,
        )
        .await;

    let held = wait_for_node(&h.engine, id, "deploy", |e| !e.retry_ids.is_empty()).await;
    assert_eq!(held.status, Status::Queued);
    assert_eq!(held.queued_until, Some(DateTime::<Utc>::MAX_UTC));
    let first_id = held.retry_ids[0];
    let engine = h.engine.clone();
    let first = tokio::time::timeout(WAIT, async move {
        loop {
            let first = engine.get_node_execution(first_id).await.unwrap();
            if first.old_retry {
                return first;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(first.concluded);

    h.engine
        .register_interrupt(id, InterruptType::Abort, None, Value::Null)
        .await
        .unwrap();
    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Aborted);
    assert_eq!(h.engine.get_node_execution(held.id).await.unwrap().status, Status::Aborted);
}

#[tokio::test]
async fn test_manual_intervention_retry_interrupt_reruns_node() {
    let flaky = Arc::new(FlakyStep::failing(1));
    let h = harness().step("flaky", Executable::Sync(flaky.clone())).start().await;
    let id = h
        .run(
            r#"
id: manual_retry
start_node_id: migrate
nodes:
  - id: migrate
    step_type: flaky
    mode: sync
    advisers:
      - type: manual_intervention
        parameters:
          timeout_secs: 600
"#,
        )
        .await;

    let parked = wait_for_node(&h.engine, id, "migrate", |e| e.status == Status::InterventionWaiting).await;
    let interrupt = h
        .engine
        .register_interrupt(id, InterruptType::Retry, Some(parked.id), Value::Null)
        .await
        .unwrap();

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);
    assert_eq!(flaky.calls(), 2);

    let attempts = executions_of(&h.engine, id, "migrate").await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, Status::Failed);
    assert!(attempts[0].old_retry);
    assert_eq!(attempts[0].interrupt_history[0].interrupt_id, interrupt.id);
    assert_eq!(attempts[1].status, Status::Succeeded);
    assert_eq!(attempts[1].retry_ids, vec![parked.id]);
    assert!(attempts[1].queued_until.is_none());
}

#[tokio::test]
async fn test_retry_interrupt_rejected_for_succeeded_node() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: done_then_hold
start_node_id: build
nodes:
  - id: build
    step_type: noop
    mode: sync
    next: [hold]
  - id: hold
    step_type: wait
    mode: async
    step_parameters:
      task_type: pending
"#,
        )
        .await;
    wait_for_node(&h.engine, id, "hold", |e| e.status == Status::TaskWaiting).await;
    let build = executions_of(&h.engine, id, "build").await.remove(0);

    let interrupt = h
        .engine
        .register_interrupt(id, InterruptType::Retry, Some(build.id), Value::Null)
        .await
        .unwrap();

    let processed = loop {
        let history = h
            .engine
            .interrupt_history(id, &Default::default())
            .await
            .unwrap();
        if let Some(found) = history.into_iter().find(|i| i.id == interrupt.id && i.state.is_processed()) {
            break found;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    assert!(processed.message.unwrap().contains("SUCCEEDED"));
    assert_eq!(executions_of(&h.engine, id, "build").await.len(), 1);
}
