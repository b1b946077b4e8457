#[path = "common/mod.rs"]
mod common;

use common::ScriptedDeliverer;
use serde_json::json;
use std::sync::Arc;
use switchyard::config::definitions::DefinitionsConfig;
use switchyard::config::{BreakerConfig, EngineConfig};
use switchyard::domain::Message;
use switchyard::events::EngineEvent;
use switchyard::engine::Engine;
use switchyard::gateway::{DispatchOutcome, EndpointDeliverer};
use switchyard::metrics::metrics;

const RETRY_DEFINITIONS: &str = r#"
endpoints:
  - name: flaky
    kind: rest
    address: https://flaky.internal

routes:
  - name: unstable
    source: "*"
    kind: direct
    destination: flaky
    policy:
      async: true
      retries: 2
      backoff: fixed
      delay: 1ms
"#;

#[tokio::test]
async fn transient_failures_are_retried_until_delivery() {
    let (engine, deliverer) = common::engine_with(
        RETRY_DEFINITIONS,
        ScriptedDeliverer::default().failing("flaky", 2, true),
    );

    let outcome = engine
        .gateway()
        .dispatch_route("unstable", Message::json("src", &json!({"id": 1})))
        .await
        .expect("dispatch resolves");

    assert_eq!(
        outcome,
        DispatchOutcome::Delivered {
            endpoints: vec!["flaky".to_string()]
        }
    );
    // Two connectivity failures burn two attempts; the third succeeds.
    assert_eq!(deliverer.calls().len(), 3);
}

const NO_DLQ_DEFINITIONS: &str = r#"
endpoints:
  - name: down
    kind: rest
    address: https://down.internal

routes:
  - name: lossy
    source: "*"
    kind: direct
    destination: down
    policy:
      async: true
      retries: 1
      backoff: fixed
      delay: 1ms
"#;

#[tokio::test]
async fn exhausted_retries_without_dlq_drop_exactly_once() {
    let (engine, deliverer) = common::engine_with(
        NO_DLQ_DEFINITIONS,
        ScriptedDeliverer::default().failing("down", 10, true),
    );

    let before = metrics().snapshot().fatal_drops;
    let outcome = engine
        .gateway()
        .dispatch_route("lossy", Message::json("src", &json!({"id": 2})))
        .await
        .expect("dispatch resolves");

    assert!(matches!(outcome, DispatchOutcome::Dropped { .. }));
    assert_eq!(deliverer.calls().len(), 2, "retries: 1 means two attempts");
    assert_eq!(metrics().snapshot().fatal_drops, before + 1);
}

const DLQ_DEFINITIONS: &str = r#"
endpoints:
  - name: down
    kind: rest
    address: https://down.internal
  - name: parking
    kind: queue
    address: amqp://broker/parking

routes:
  - name: parked
    source: "*"
    kind: direct
    destination: down
    policy:
      async: true
      retries: 1
      backoff: fixed
      delay: 1ms
      dead_letter: parking
"#;

#[tokio::test]
async fn exhausted_retries_park_the_message_on_the_dlq() {
    let (engine, deliverer) = common::engine_with(
        DLQ_DEFINITIONS,
        ScriptedDeliverer::default().failing("down", 10, true),
    );

    let mut stream = engine.subscribe();
    let outcome = engine
        .gateway()
        .dispatch_route("parked", Message::json("src", &json!({"id": 3})))
        .await
        .expect("dispatch resolves");

    assert!(
        matches!(outcome, DispatchOutcome::DeadLettered { ref endpoint, .. } if endpoint == "parking")
    );
    assert_eq!(deliverer.calls(), ["down", "down", "parking"]);

    let mut dead_letters = 0;
    while let Some(event) = stream.try_recv() {
        if let EngineEvent::DeadLetter { route, endpoint, .. } = event {
            assert_eq!(route, "parked");
            assert_eq!(endpoint, "parking");
            dead_letters += 1;
        }
    }
    assert_eq!(dead_letters, 1);
}

#[tokio::test]
async fn open_breaker_short_circuits_repeat_dispatches() {
    let config = EngineConfig {
        breaker: BreakerConfig {
            failure_threshold: 2,
            recovery_timeout_secs: 60,
            half_open_max_calls: 1,
        },
        ..EngineConfig::default()
    };
    let deliverer = Arc::new(ScriptedDeliverer::default().failing("down", 20, true));
    let engine = Engine::new(&config, Arc::clone(&deliverer) as Arc<dyn EndpointDeliverer>);
    engine
        .load_definitions(
            DefinitionsConfig::from_yaml_str(
                r#"
endpoints:
  - name: down
    kind: rest
    address: https://down.internal

routes:
  - name: guarded
    source: "*"
    kind: direct
    destination: down
"#,
            )
            .expect("definitions"),
        )
        .expect("load");

    for _ in 0..2 {
        let _ = engine
            .gateway()
            .dispatch_route("guarded", Message::json("src", &json!({})))
            .await;
    }

    let err = engine
        .gateway()
        .dispatch_route("guarded", Message::json("src", &json!({})))
        .await
        .expect_err("breaker open");
    assert!(err.to_string().contains("circuit"));
    // The third dispatch never reached the transport.
    assert_eq!(deliverer.calls().len(), 2);
}
