#[path = "common/mod.rs"]
mod common;

use common::ScriptedDeliverer;
use serde_json::json;
use std::time::Duration;
use switchyard::flow::execution::{ExecutionStatus, FlowExecution, StepStatus};
use uuid::Uuid;

fn step<'a>(execution: &'a FlowExecution, name: &str) -> &'a switchyard::flow::execution::StepState {
    execution.step(name).expect("step state")
}

const PIPELINE_DEFINITIONS: &str = r#"
endpoints:
  - name: out
    kind: queue
    address: amqp://broker/out

transformations:
  - name: order_total
    script: "{order_id: .id, total: (.net + .tax)}"

routes:
  - name: deliver
    source: "*"
    kind: direct
    destination: out

flows:
  - name: pipeline
    steps:
      - name: shape
        type: transformation
        transformation: order_total
      - name: send
        type: endpoint_call
        route: deliver
        depends_on: [shape]
"#;

#[tokio::test]
async fn pipeline_runs_each_step_once_in_order() {
    let (engine, deliverer) = common::engine_with(PIPELINE_DEFINITIONS, ScriptedDeliverer::default());

    let execution = engine
        .run_flow("pipeline", json!({"id": 7, "net": 10.0, "tax": 2.0}))
        .await
        .expect("flow run");

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(step(&execution, "shape").status, StepStatus::Succeeded);
    assert_eq!(step(&execution, "shape").attempt, 1);
    assert_eq!(step(&execution, "send").status, StepStatus::Succeeded);
    assert_eq!(deliverer.calls(), ["out"]);
}

const RETRY_FLOW_DEFINITIONS: &str = r#"
endpoints:
  - name: flaky
    kind: rest
    address: https://flaky.internal

routes:
  - name: unstable
    source: "*"
    kind: direct
    destination: flaky

flows:
  - name: persistent
    config:
      retries: 2
      backoff: fixed
      delay: 1ms
    steps:
      - name: send
        type: endpoint_call
        route: unstable
        on_error: retry
"#;

#[tokio::test]
async fn step_retry_exhausts_transient_failures() {
    let (engine, deliverer) = common::engine_with(
        RETRY_FLOW_DEFINITIONS,
        ScriptedDeliverer::default().failing("flaky", 2, true),
    );

    let execution = engine
        .run_flow("persistent", json!({"id": 1}))
        .await
        .expect("flow run");

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    let send = step(&execution, "send");
    assert_eq!(send.status, StepStatus::Succeeded);
    assert_eq!(send.attempt, 3, "two failures then one success");
    assert_eq!(deliverer.calls().len(), 3);
}

const CONTINUE_DEFINITIONS: &str = r#"
endpoints:
  - name: down
    kind: rest
    address: https://down.internal
  - name: out
    kind: queue
    address: amqp://broker/out

routes:
  - name: doomed
    source: "*"
    kind: direct
    destination: down
  - name: deliver
    source: "*"
    kind: direct
    destination: out

flows:
  - name: tolerant
    steps:
      - name: optional_audit
        type: endpoint_call
        route: doomed
        on_error: continue
      - name: after_audit
        type: endpoint_call
        route: deliver
        depends_on: [optional_audit]
      - name: independent
        type: endpoint_call
        route: deliver
"#;

#[tokio::test]
async fn continue_skips_dependents_but_keeps_the_flow_alive() {
    let (engine, deliverer) = common::engine_with(
        CONTINUE_DEFINITIONS,
        ScriptedDeliverer::default().failing("down", 10, false),
    );

    let execution = engine
        .run_flow("tolerant", json!({"id": 1}))
        .await
        .expect("flow run");

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(step(&execution, "optional_audit").status, StepStatus::Failed);
    assert_eq!(step(&execution, "after_audit").status, StepStatus::Skipped);
    assert_eq!(step(&execution, "independent").status, StepStatus::Succeeded);
    // Only the failing call and the independent branch hit the transport.
    assert_eq!(deliverer.calls(), ["down", "out"]);
}

const STOP_DEFINITIONS: &str = r#"
endpoints:
  - name: down
    kind: rest
    address: https://down.internal
  - name: out
    kind: queue
    address: amqp://broker/out

routes:
  - name: doomed
    source: "*"
    kind: direct
    destination: down
  - name: deliver
    source: "*"
    kind: direct
    destination: out

flows:
  - name: strict
    steps:
      - name: must_pass
        type: endpoint_call
        route: doomed
        on_error: stop
      - name: downstream
        type: endpoint_call
        route: deliver
        depends_on: [must_pass]
"#;

#[tokio::test]
async fn stop_fails_the_flow_and_cancels_unstarted_steps() {
    let (engine, _deliverer) = common::engine_with(
        STOP_DEFINITIONS,
        ScriptedDeliverer::default().failing("down", 10, false),
    );

    let execution = engine
        .run_flow("strict", json!({"id": 1}))
        .await
        .expect("flow run");

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let failed = step(&execution, "must_pass");
    assert_eq!(failed.status, StepStatus::Failed);
    assert!(failed.error.as_deref().unwrap_or("").contains("must_pass"));
    assert_eq!(step(&execution, "downstream").status, StepStatus::Cancelled);
}

const FALLBACK_DEFINITIONS: &str = r#"
endpoints:
  - name: down
    kind: rest
    address: https://down.internal
  - name: backup_queue
    kind: queue
    address: amqp://broker/backup
  - name: out
    kind: queue
    address: amqp://broker/out

routes:
  - name: doomed
    source: "*"
    kind: direct
    destination: down
  - name: backup
    source: "*"
    kind: direct
    destination: backup_queue
  - name: deliver
    source: "*"
    kind: direct
    destination: out

flows:
  - name: resilient
    steps:
      - name: primary_send
        type: endpoint_call
        route: doomed
        on_error: fallback
        fallback_step: backup_send
      - name: backup_send
        type: endpoint_call
        route: backup
      - name: confirm
        type: endpoint_call
        route: deliver
        depends_on: [primary_send]
"#;

#[tokio::test]
async fn fallback_substitutes_for_the_failed_step() {
    let (engine, deliverer) = common::engine_with(
        FALLBACK_DEFINITIONS,
        ScriptedDeliverer::default().failing("down", 10, false),
    );

    let execution = engine
        .run_flow("resilient", json!({"id": 1}))
        .await
        .expect("flow run");

    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(step(&execution, "primary_send").status, StepStatus::Failed);
    assert_eq!(step(&execution, "backup_send").status, StepStatus::Succeeded);
    assert_eq!(step(&execution, "confirm").status, StepStatus::Succeeded);
    assert_eq!(deliverer.calls(), ["down", "backup_queue", "out"]);
}

const SLOW_DEFINITIONS: &str = r#"
endpoints:
  - name: slow
    kind: rest
    address: https://slow.internal
  - name: out
    kind: queue
    address: amqp://broker/out

routes:
  - name: crawl
    source: "*"
    kind: direct
    destination: slow
  - name: deliver
    source: "*"
    kind: direct
    destination: out

flows:
  - name: leisurely
    steps:
      - name: long_call
        type: endpoint_call
        route: crawl
      - name: followup
        type: endpoint_call
        route: deliver
        depends_on: [long_call]
"#;

async fn wait_terminal(engine: &switchyard::engine::Engine, id: Uuid) -> FlowExecution {
    for _ in 0..200 {
        let execution = engine.flow_execution(id).expect("execution");
        if execution.status.is_terminal() {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution never reached a terminal status");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_lets_inflight_steps_finish() {
    let (engine, deliverer) = common::engine_with(
        SLOW_DEFINITIONS,
        ScriptedDeliverer::default().with_delay(Duration::from_millis(200)),
    );

    let id = engine
        .start_flow("leisurely", json!({"id": 1}))
        .expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.orchestrator().cancel(id).expect("cancel");

    let execution = wait_terminal(&engine, id).await;
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(step(&execution, "long_call").status, StepStatus::Succeeded);
    assert_eq!(step(&execution, "followup").status, StepStatus::Cancelled);
    assert_eq!(deliverer.calls(), ["slow"]);
}

#[tokio::test]
async fn executions_are_queryable_after_completion() {
    let (engine, _deliverer) = common::engine_with(PIPELINE_DEFINITIONS, ScriptedDeliverer::default());

    for _ in 0..3 {
        engine
            .run_flow("pipeline", json!({"id": 1, "net": 1.0, "tax": 0.1}))
            .await
            .expect("flow run");
    }

    let all = engine.list_flow_executions(Some("pipeline"), None);
    assert_eq!(all.len(), 3);
    let succeeded = engine.list_flow_executions(Some("pipeline"), Some(ExecutionStatus::Succeeded));
    assert_eq!(succeeded.len(), 3);
    let fetched = engine.flow_execution(all[0].id).expect("by id");
    assert_eq!(fetched.flow, "pipeline");
}
