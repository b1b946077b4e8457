#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard::config::definitions::DefinitionsConfig;
use switchyard::config::EngineConfig;
use switchyard::domain::Message;
use switchyard::endpoint::EndpointDescriptor;
use switchyard::engine::Engine;
use switchyard::gateway::{DeliveryError, EndpointDeliverer};

/// Deliverer scripted per endpoint: fail the first N calls to an endpoint,
/// then accept. Records every call in arrival order.
#[derive(Default)]
pub struct ScriptedDeliverer {
    failures: Mutex<HashMap<String, (u32, bool)>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedDeliverer {
    pub fn failing(self, endpoint: &str, failures: u32, connectivity: bool) -> Self {
        self.failures
            .lock()
            .expect("failures")
            .insert(endpoint.to_string(), (failures, connectivity));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl EndpointDeliverer for ScriptedDeliverer {
    async fn deliver(
        &self,
        endpoint: &EndpointDescriptor,
        _message: &Message,
    ) -> Result<(), DeliveryError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().expect("calls").push(endpoint.name.clone());
        let mut failures = self.failures.lock().expect("failures");
        if let Some((remaining, connectivity)) = failures.get_mut(&endpoint.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return if *connectivity {
                    Err(DeliveryError::Connectivity {
                        reason: "connection refused".to_string(),
                    })
                } else {
                    Err(DeliveryError::Rejected {
                        reason: "schema mismatch".to_string(),
                    })
                };
            }
        }
        Ok(())
    }
}

/// Builds an engine from a definitions YAML document and a scripted
/// deliverer, returning both so tests can inspect recorded calls.
pub fn engine_with(definitions: &str, deliverer: ScriptedDeliverer) -> (Engine, Arc<ScriptedDeliverer>) {
    let deliverer = Arc::new(deliverer);
    let engine = Engine::new(
        &EngineConfig::default(),
        Arc::clone(&deliverer) as Arc<dyn EndpointDeliverer>,
    );
    let parsed = DefinitionsConfig::from_yaml_str(definitions).expect("definitions should parse");
    engine.load_definitions(parsed).expect("definitions should register");
    (engine, deliverer)
}
