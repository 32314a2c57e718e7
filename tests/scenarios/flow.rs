//! Sequencing along edges, skip conditions and adviser routing

use crate::helpers::*;
use orchestrator::advise::AdviserResponse;
use orchestrator::core::Status;
use orchestrator::execution::ExecutionEvent;
use std::collections::BTreeMap;

#[tokio::test]
async fn test_linear_plan_runs_in_order() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: linear
name: Linear release
start_node_id: build
nodes:
  - id: build
    step_type: noop
    mode: sync
    next: [publish]
  - id: publish
    step_type: wait
    mode: async
    step_parameters:
      task_type: echo
    next: [notify]
  - id: notify
    step_type: noop
    mode: sync
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);
    assert!(finished.failure.is_none());
    assert!(finished.ended_at.is_some());

    let build = executions_of(&h.engine, id, "build").await.remove(0);
    let publish = executions_of(&h.engine, id, "publish").await.remove(0);
    let notify = executions_of(&h.engine, id, "notify").await.remove(0);
    assert_eq!(finished.root_node_execution_id, Some(build.id));
    assert_eq!(publish.previous_id, Some(build.id));
    assert_eq!(notify.previous_id, Some(publish.id));
    assert!([build, publish, notify].iter().all(|e| e.concluded && e.parent_id.is_none()));

    let events = h.events();
    assert!(matches!(events.first(), Some(ExecutionEvent::PlanStarted { .. })));
    let completions: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::PlanCompleted { .. }))
        .collect();
    assert_eq!(completions.len(), 1);
}

#[tokio::test]
async fn test_skip_condition_skips_and_continues() {
    let h = harness().start().await;
    let yaml = r#"
id: skipping
start_node_id: build
nodes:
  - id: build
    step_type: noop
    mode: sync
    next: [smoke]
  - id: smoke
    step_type: fail
    mode: sync
    skip_when:
      key: env
      pattern: prod
    next: [deploy]
  - id: deploy
    step_type: noop
    mode: sync
"#;

    let setup = BTreeMap::from([("env".to_string(), "prod".to_string())]);
    let id = h.run_with(yaml, setup).await;
    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Succeeded);

    let smoke = executions_of(&h.engine, id, "smoke").await.remove(0);
    assert_eq!(smoke.status, Status::Skipped);
    assert!(smoke.started_at.is_none());
    let deploy = executions_of(&h.engine, id, "deploy").await.remove(0);
    assert_eq!(deploy.status, Status::Succeeded);
    assert_eq!(deploy.previous_id, Some(smoke.id));

    // Without the setup value the failing step runs
    let id = h.run(yaml).await;
    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);
}

#[tokio::test]
async fn test_regex_skip_condition() {
    let h = harness().start().await;
    let yaml = r#"
id: regex_skip
start_node_id: canary
nodes:
  - id: canary
    step_type: fail
    mode: sync
    skip_when:
      key: region
      pattern: "^eu-"
      use_regex: true
"#;

    let setup = BTreeMap::from([("region".to_string(), "eu-west-1".to_string())]);
    let id = h.run_with(yaml, setup).await;
    assert_eq!(wait_for_plan(&h.engine, id).await.status, Status::Succeeded);

    let setup = BTreeMap::from([("region".to_string(), "us-east-1".to_string())]);
    let id = h.run_with(yaml, setup).await;
    assert_eq!(wait_for_plan(&h.engine, id).await.status, Status::Failed);
}

#[tokio::test]
async fn test_dangling_adviser_target_fails_plan() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: dangling
start_node_id: build
nodes:
  - id: build
    step_type: noop
    mode: sync
    advisers:
      - type: on_success
        parameters:
          next_node_id: ghost
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);
    assert!(finished.failure.unwrap().message.contains("ghost"));

    let build = executions_of(&h.engine, id, "build").await.remove(0);
    assert_eq!(build.status, Status::Succeeded);
    assert!(build.concluded);
}

#[tokio::test]
async fn test_on_fail_routes_to_handler() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: on_fail
start_node_id: deploy
nodes:
  - id: deploy
    step_type: fail
    mode: sync
    advisers:
      - type: on_fail
        when: [FAILED]
        parameters:
          next_node_id: page_oncall
  - id: page_oncall
    step_type: noop
    mode: sync
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    // The failure still counts once the handler ran
    assert_eq!(finished.status, Status::Failed);

    let deploy = executions_of(&h.engine, id, "deploy").await.remove(0);
    assert_eq!(
        deploy.adviser_responses,
        vec![AdviserResponse::Proceed {
            next_node_ids: vec!["page_oncall".to_string()]
        }]
    );
    let page = executions_of(&h.engine, id, "page_oncall").await.remove(0);
    assert_eq!(page.status, Status::Succeeded);
    assert_eq!(page.previous_id, Some(deploy.id));
}

#[tokio::test]
async fn test_rollback_enters_mapped_node() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: rollback
start_node_id: deploy
nodes:
  - id: deploy
    step_type: fail
    mode: sync
    step_parameters:
      message: health check failed
      failure_type: VERIFICATION
    advisers:
      - type: rollback
        parameters:
          strategy_to_node:
            STAGE_ROLLBACK: restore
  - id: restore
    step_type: noop
    mode: sync
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);
    assert_eq!(finished.failure.unwrap().message, "health check failed");

    let deploy = executions_of(&h.engine, id, "deploy").await.remove(0);
    assert!(matches!(
        deploy.adviser_responses.as_slice(),
        [AdviserResponse::Rollback { strategy, node_id }] if strategy == "STAGE_ROLLBACK" && node_id == "restore"
    ));
    let restore = executions_of(&h.engine, id, "restore").await.remove(0);
    assert_eq!(restore.status, Status::Succeeded);
}

#[tokio::test]
async fn test_end_plan_errors_other_branches() {
    let h = harness().start().await;
    let id = h
        .run(
            r#"
id: end_plan
start_node_id: stage
nodes:
  - id: stage
    step_type: section
    mode: child
    step_parameters:
      child_node_id: verify
  - id: verify
    step_type: fail
    mode: sync
    advisers:
      - type: on_abort
"#,
        )
        .await;

    let finished = wait_for_plan(&h.engine, id).await;
    assert_eq!(finished.status, Status::Failed);

    let stage = executions_of(&h.engine, id, "stage").await.remove(0);
    assert_eq!(stage.status, Status::Errored);
    assert!(stage.concluded);
    let verify = executions_of(&h.engine, id, "verify").await.remove(0);
    assert_eq!(verify.status, Status::Failed);
    assert_eq!(verify.adviser_responses, vec![AdviserResponse::EndPlan]);
}
