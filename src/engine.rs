use crate::breaker::BreakerBoard;
use crate::config::definitions::DefinitionsConfig;
use crate::config::EngineConfig;
use crate::domain::{HealthStatus, Message};
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::error::Result;
use crate::events::{EventBus, EventStream};
use crate::flow::execution::{ExecutionStatus, FlowExecution};
use crate::flow::orchestrator::{FlowOrchestrator, StepDispatcher, StepFault};
use crate::gateway::{DispatchGateway, DispatchOutcome, EndpointDeliverer, TriggerKind};
use crate::metrics::{metrics, RouteOutcomeSnapshot};
use crate::router::Router;
use crate::transform::TransformationExecutor;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Top-level wiring of the engine: one event bus, one endpoint registry, one
/// router, one transformation executor, a gateway guarding the boundary, and
/// the flow orchestrator on top.
pub struct Engine {
    events: EventBus,
    registry: Arc<EndpointRegistry>,
    transformations: Arc<TransformationExecutor>,
    gateway: Arc<DispatchGateway>,
    orchestrator: Arc<FlowOrchestrator>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: &EngineConfig, deliverer: Arc<dyn EndpointDeliverer>) -> Self {
        let events = EventBus::new(config.events.buffer);
        let shutdown = CancellationToken::new();
        let registry = Arc::new(EndpointRegistry::new(events.clone()));
        let router = Arc::new(Router::new(events.clone()));
        let transformations = Arc::new(TransformationExecutor::new(events.clone()));
        let gateway = Arc::new(DispatchGateway::new(
            Arc::clone(&registry),
            router,
            BreakerBoard::new(config.breaker.settings()),
            deliverer,
            events.clone(),
            shutdown.clone(),
        ));
        let dispatcher = Arc::new(EngineStepDispatcher {
            gateway: Arc::clone(&gateway),
            transformations: Arc::clone(&transformations),
        });
        let orchestrator = Arc::new(FlowOrchestrator::new(
            dispatcher,
            events.clone(),
            shutdown.clone(),
        ));

        Self {
            events,
            registry,
            transformations,
            gateway,
            orchestrator,
            shutdown,
        }
    }

    /// Registers a validated definition set: endpoints first, then
    /// transformations, routes, and flows, so references always resolve.
    pub fn load_definitions(&self, definitions: DefinitionsConfig) -> Result<()> {
        for endpoint in definitions.endpoints {
            self.registry.register(endpoint)?;
        }
        for transformation in definitions.transformations {
            self.transformations.register(transformation)?;
        }
        for route in definitions.routes {
            self.gateway.register_route(route)?;
        }
        for flow in definitions.flows {
            self.orchestrator.register(flow)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn transformations(&self) -> &Arc<TransformationExecutor> {
        &self.transformations
    }

    pub fn gateway(&self) -> &Arc<DispatchGateway> {
        &self.gateway
    }

    pub fn orchestrator(&self) -> &Arc<FlowOrchestrator> {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Accepts an inbound trigger and routes its message.
    pub async fn ingest(&self, trigger: TriggerKind, message: Message) -> Result<DispatchOutcome> {
        Ok(self.gateway.ingest(trigger, message).await?)
    }

    /// Runs a flow to completion for one trigger document.
    pub async fn run_flow(&self, flow: &str, document: JsonValue) -> Result<FlowExecution> {
        Ok(self.orchestrator.run(flow, document).await?)
    }

    /// Fires a flow in the background.
    pub fn start_flow(&self, flow: &str, document: JsonValue) -> Result<Uuid> {
        Ok(self.orchestrator.start(flow, document)?)
    }

    // Query surface for dashboards and reporting collaborators.

    pub fn endpoint_health(&self, name: &str) -> Result<HealthStatus> {
        Ok(self.registry.lookup(name)?.health)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.registry.list_all()
    }

    pub fn route_stats(&self, route: &str) -> RouteOutcomeSnapshot {
        metrics().route_snapshot(route)
    }

    pub fn flow_execution(&self, id: Uuid) -> Result<FlowExecution> {
        Ok(self.orchestrator.execution(id)?)
    }

    pub fn list_flow_executions(
        &self,
        flow: Option<&str>,
        status: Option<ExecutionStatus>,
    ) -> Vec<FlowExecution> {
        self.orchestrator.list_executions(flow, status)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals every loop (schedules, retry backoffs, flow executions) to
    /// wind down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Routes flow steps to the gateway and the transformation executor.
struct EngineStepDispatcher {
    gateway: Arc<DispatchGateway>,
    transformations: Arc<TransformationExecutor>,
}

#[async_trait]
impl StepDispatcher for EngineStepDispatcher {
    async fn call_route(&self, route: &str, document: JsonValue) -> Result<JsonValue, StepFault> {
        let message = Message::json("flow", &document).with_trigger("flow");
        let outcome = self
            .gateway
            .dispatch_route(route, message)
            .await
            .map_err(|err| StepFault::new(err.to_string()))?;
        match outcome {
            DispatchOutcome::Delivered { .. } => Ok(document),
            DispatchOutcome::DeadLettered { endpoint, reason } => Err(StepFault::new(format!(
                "message dead-lettered to `{endpoint}`: {reason}"
            ))),
            DispatchOutcome::Dropped { reason } => {
                Err(StepFault::new(format!("message dropped: {reason}")))
            }
        }
    }

    async fn transform(
        &self,
        transformation: &str,
        document: JsonValue,
    ) -> Result<JsonValue, StepFault> {
        self.transformations
            .apply(transformation, &document)
            .await
            .map_err(|err| StepFault::new(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointDescriptor;
    use crate::gateway::DeliveryError;
    use serde_json::json;

    struct AcceptAll;

    #[async_trait]
    impl EndpointDeliverer for AcceptAll {
        async fn deliver(
            &self,
            _endpoint: &EndpointDescriptor,
            _message: &Message,
        ) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    const DEFINITIONS: &str = r#"
endpoints:
  - name: out_queue
    kind: queue
    address: amqp://broker/out

transformations:
  - name: shape
    script: "{id: .id}"

routes:
  - name: deliver
    source: "*"
    kind: direct
    destination: out_queue

flows:
  - name: pipeline
    steps:
      - name: shape
        type: transformation
        transformation: shape
      - name: send
        type: endpoint_call
        route: deliver
        depends_on: [shape]
"#;

    #[tokio::test]
    async fn engine_wires_definitions_end_to_end() {
        let engine = Engine::new(&EngineConfig::default(), Arc::new(AcceptAll));
        let definitions =
            DefinitionsConfig::from_yaml_str(DEFINITIONS).expect("valid definitions");
        engine.load_definitions(definitions).expect("load");

        let execution = engine
            .run_flow("pipeline", json!({"id": 1, "noise": true}))
            .await
            .expect("flow run");
        assert_eq!(execution.status, ExecutionStatus::Succeeded);

        let outcome = engine
            .ingest(
                TriggerKind::Webhook,
                Message::json("orders", &json!({"id": 2})),
            )
            .await
            .expect("ingest");
        assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
        assert!(engine.route_stats("deliver").decisions >= 1);
    }
}
