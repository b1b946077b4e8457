use crate::breaker::{BreakerBoard, CircuitOpen};
use crate::domain::Message;
use crate::endpoint::{EndpointDescriptor, EndpointRegistry, EndpointRegistryError};
use crate::events::{EngineEvent, EventBus};
use crate::metrics::metrics;
use crate::retry::sleep_with_shutdown;
use crate::router::{RouteDefinition, Router, RoutingError, RoutingKind};
use crate::switchyard_event;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How an inbound message entered the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerKind {
    Schedule,
    MessageQueue,
    Webhook,
    FileWatch,
    /// Carries no runtime semantics of its own; the message passes through
    /// tagged so collaborators can tell it apart.
    Manual,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Schedule => "schedule",
            TriggerKind::MessageQueue => "message_queue",
            TriggerKind::Webhook => "webhook",
            TriggerKind::FileWatch => "file_watch",
            TriggerKind::Manual => "manual",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "schedule" => Some(TriggerKind::Schedule),
            "message_queue" => Some(TriggerKind::MessageQueue),
            "webhook" => Some(TriggerKind::Webhook),
            "file_watch" => Some(TriggerKind::FileWatch),
            "manual" => Some(TriggerKind::Manual),
            _ => None,
        }
    }
}

/// Outcome class of one endpoint call. Failover routes advance past
/// connectivity failures only; a rejection is final for the whole route.
#[derive(Clone, Debug, Error)]
pub enum DeliveryError {
    #[error("connectivity failure: {reason}")]
    Connectivity { reason: String },
    #[error("rejected by endpoint: {reason}")]
    Rejected { reason: String },
}

impl DeliveryError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, DeliveryError::Connectivity { .. })
    }
}

/// Transport seam. The engine core never opens sockets itself; a deliverer
/// adapter owns the wire.
#[async_trait]
pub trait EndpointDeliverer: Send + Sync {
    async fn deliver(
        &self,
        endpoint: &EndpointDescriptor,
        message: &Message,
    ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("route `{route}` is already registered")]
    DuplicateRoute { route: String },
    #[error("route `{route}` is not registered")]
    RouteNotFound { route: String },
    #[error("route `{route}` references unknown endpoint `{endpoint}`")]
    UnknownEndpoint { route: String, endpoint: String },
    #[error("no route accepts messages from source `{source_name}`")]
    NoRouteForSource { source_name: String },
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Endpoint(#[from] EndpointRegistryError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error("delivery to `{endpoint}` failed: {reason}")]
    Delivery { endpoint: String, reason: String },
    #[error("delivery to `{endpoint}` timed out after {timeout:?}")]
    DeliveryTimeout { endpoint: String, timeout: Duration },
}

/// What happened to an accepted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { endpoints: Vec<String> },
    DeadLettered { endpoint: String, reason: String },
    /// Retries exhausted with no dead-letter queue configured. Logged exactly
    /// once, counted, never silent.
    Dropped { reason: String },
}

/// Boundary between triggers and the routing core: owns the route registry,
/// guards every outbound call with a circuit breaker, and applies async
/// retry/dead-letter policy.
pub struct DispatchGateway {
    registry: Arc<EndpointRegistry>,
    router: Arc<Router>,
    routes: Mutex<HashMap<String, Arc<RouteDefinition>>>,
    breakers: BreakerBoard,
    deliverer: Arc<dyn EndpointDeliverer>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl DispatchGateway {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        router: Arc<Router>,
        breakers: BreakerBoard,
        deliverer: Arc<dyn EndpointDeliverer>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            router,
            routes: Mutex::new(HashMap::new()),
            breakers,
            deliverer,
            events,
            shutdown,
        }
    }

    /// Registers a route after checking every referenced endpoint exists.
    /// Accepted routes pin their endpoints against deregistration.
    pub fn register_route(&self, route: RouteDefinition) -> Result<(), DispatchError> {
        let mut routes = self.routes.lock().expect("route registry");
        if routes.contains_key(&route.name) {
            return Err(DispatchError::DuplicateRoute { route: route.name });
        }

        let referenced = route.referenced_endpoints();
        for endpoint in &referenced {
            if self.registry.lookup(endpoint).is_err() {
                return Err(DispatchError::UnknownEndpoint {
                    route: route.name.clone(),
                    endpoint: (*endpoint).to_string(),
                });
            }
        }
        for endpoint in &referenced {
            // Cannot fail: existence was checked above under no concurrent
            // deregistration of a referenced endpoint.
            let _ = self.registry.retain(endpoint);
        }

        switchyard_event!(
            info,
            "switchyard::gateway",
            "route_registered",
            route = route.name.as_str(),
            kind = route.kind.as_str(),
        );
        routes.insert(route.name.clone(), Arc::new(route));
        Ok(())
    }

    pub fn deregister_route(&self, name: &str) -> Result<(), DispatchError> {
        let mut routes = self.routes.lock().expect("route registry");
        let route = routes
            .remove(name)
            .ok_or_else(|| DispatchError::RouteNotFound {
                route: name.to_string(),
            })?;
        for endpoint in route.referenced_endpoints() {
            self.registry.release(endpoint);
        }
        Ok(())
    }

    pub fn route_definition(&self, name: &str) -> Result<Arc<RouteDefinition>, DispatchError> {
        let routes = self.routes.lock().expect("route registry");
        routes
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::RouteNotFound {
                route: name.to_string(),
            })
    }

    pub fn list_routes(&self) -> Vec<Arc<RouteDefinition>> {
        let routes = self.routes.lock().expect("route registry");
        let mut all: Vec<_> = routes.values().cloned().collect();
        all.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        all
    }

    /// First registered route (by name order, deterministic) whose source
    /// pattern accepts the message source.
    pub fn route_for_source(&self, source: &str) -> Result<Arc<RouteDefinition>, DispatchError> {
        self.list_routes()
            .into_iter()
            .find(|route| route.matches_source(source))
            .ok_or_else(|| DispatchError::NoRouteForSource {
                source_name: source.to_string(),
            })
    }

    /// Accepts a trigger-tagged message and dispatches it through the first
    /// route matching its source.
    pub async fn ingest(
        &self,
        trigger: TriggerKind,
        message: Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        let message = message.with_trigger(trigger.as_str());
        let route = self.route_for_source(&message.source)?;
        self.dispatch(&route, message).await
    }

    /// Dispatches one message through a named route.
    pub async fn dispatch_route(
        &self,
        route: &str,
        message: Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        let route = self.route_definition(route)?;
        self.dispatch(&route, message).await
    }

    async fn dispatch(
        &self,
        route: &RouteDefinition,
        message: Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        if route.policy.is_async {
            self.dispatch_async(route, message).await
        } else {
            let destinations = self.router.route(&message, route)?;
            self.deliver_set(route, &message, destinations.iter().map(|d| d.endpoint.as_str()))
                .await
        }
    }

    /// Async route: retries the whole resolve-and-deliver operation under the
    /// route's retry policy, then falls to the dead-letter queue. An open
    /// circuit is not a true call failure, so it skips straight to recovery
    /// instead of burning retries that cannot succeed.
    async fn dispatch_async(
        &self,
        route: &RouteDefinition,
        message: Message,
    ) -> Result<DispatchOutcome, DispatchError> {
        let attempts = route.policy.retry.max_retries.saturating_add(1);
        let mut last_error: Option<DispatchError> = None;

        for attempt in 1..=attempts {
            let result = async {
                let destinations = self.router.route(&message, route)?;
                self.deliver_set(
                    route,
                    &message,
                    destinations.iter().map(|d| d.endpoint.as_str()),
                )
                .await
            }
            .await;

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(err @ DispatchError::Routing(_)) => {
                    // Routing faults are config-shaped; retrying cannot help.
                    return Err(err);
                }
                Err(err) => {
                    let circuit_open = matches!(err, DispatchError::CircuitOpen(_));
                    last_error = Some(err);
                    if circuit_open {
                        break;
                    }
                    if attempt < attempts {
                        let delay = route.policy.retry.delay_for(attempt);
                        if sleep_with_shutdown(delay, &self.shutdown).await {
                            break;
                        }
                    }
                }
            }
        }

        let reason = last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "delivery failed".to_string());
        Ok(self.recover(route, &message, reason).await)
    }

    /// Dead-letters the message, or records the one fatal drop when no
    /// dead-letter queue is configured.
    async fn recover(
        &self,
        route: &RouteDefinition,
        message: &Message,
        reason: String,
    ) -> DispatchOutcome {
        if let Some(dead_letter) = &route.policy.dead_letter {
            match self.deliver_once(route, dead_letter, message).await {
                Ok(()) => {
                    metrics().record_dead_letter();
                    switchyard_event!(
                        warn,
                        "switchyard::gateway",
                        "dead_lettered",
                        route = route.name.as_str(),
                        endpoint = dead_letter.as_str(),
                        reason = reason,
                    );
                    self.events.publish(EngineEvent::DeadLetter {
                        route: route.name.clone(),
                        endpoint: dead_letter.clone(),
                        reason: reason.clone(),
                    });
                    return DispatchOutcome::DeadLettered {
                        endpoint: dead_letter.clone(),
                        reason,
                    };
                }
                Err(dlq_error) => {
                    // The dead-letter queue itself failed; fall through to the
                    // fatal drop path so the loss is still recorded once.
                    let reason = format!("{reason}; dead-letter delivery failed: {dlq_error}");
                    return self.fatal_drop(route, reason);
                }
            }
        }
        self.fatal_drop(route, reason)
    }

    fn fatal_drop(&self, route: &RouteDefinition, reason: String) -> DispatchOutcome {
        metrics().record_fatal_drop();
        switchyard_event!(
            error,
            "switchyard::gateway",
            "fatal_drop",
            route = route.name.as_str(),
            reason = reason,
        );
        DispatchOutcome::Dropped { reason }
    }

    /// Delivers to a resolved destination set. Failover routes walk the list
    /// and advance only past connectivity-class failures; every other kind
    /// requires all destinations to accept.
    async fn deliver_set<'a>(
        &self,
        route: &RouteDefinition,
        message: &Message,
        destinations: impl Iterator<Item = &'a str>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if route.kind == RoutingKind::Failover {
            let mut last_error: Option<DispatchError> = None;
            for endpoint in destinations {
                match self.deliver_once(route, endpoint, message).await {
                    Ok(()) => {
                        return Ok(DispatchOutcome::Delivered {
                            endpoints: vec![endpoint.to_string()],
                        })
                    }
                    Err(err) if advances_failover(&err) => {
                        last_error = Some(err);
                    }
                    Err(err) => return Err(err),
                }
            }
            return Err(last_error.unwrap_or(DispatchError::Routing(
                RoutingError::EmptyDestinationPool {
                    route: route.name.clone(),
                },
            )));
        }

        let mut delivered = Vec::new();
        for endpoint in destinations {
            self.deliver_once(route, endpoint, message).await?;
            delivered.push(endpoint.to_string());
        }
        Ok(DispatchOutcome::Delivered {
            endpoints: delivered,
        })
    }

    /// One guarded endpoint call: breaker admission, optional per-call
    /// timeout, breaker/counter bookkeeping on the result.
    async fn deliver_once(
        &self,
        route: &RouteDefinition,
        endpoint_name: &str,
        message: &Message,
    ) -> Result<(), DispatchError> {
        let endpoint = self.registry.lookup(endpoint_name)?;
        let breaker = self.breakers.breaker(endpoint_name);

        if let Err(open) = breaker.try_admit() {
            metrics().record_circuit_short_circuit();
            switchyard_event!(
                warn,
                "switchyard::gateway",
                "circuit_short_circuit",
                route = route.name.as_str(),
                endpoint = endpoint_name,
            );
            return Err(DispatchError::CircuitOpen(open));
        }

        let call = self.deliverer.deliver(&endpoint.descriptor, message);
        let result = match route.policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Connectivity {
                    reason: format!("timed out after {limit:?}"),
                }),
            },
            None => call.await,
        };

        let counters = self.registry.counters(endpoint_name)?;
        match result {
            Ok(()) => {
                breaker.on_success();
                counters.record_delivery();
                metrics().record_delivery_success();
                Ok(())
            }
            Err(err) => {
                breaker.on_failure();
                counters.record_failure();
                metrics().record_delivery_failure();
                Err(DispatchError::Delivery {
                    endpoint: endpoint_name.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Periodic trigger loop: fires the named route every `interval` with a
    /// fixed payload until shutdown.
    pub fn spawn_schedule(
        self: &Arc<Self>,
        route: String,
        interval: Duration,
        payload: JsonValue,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if sleep_with_shutdown(interval, &gateway.shutdown).await {
                    return;
                }
                let message = Message::json(format!("schedule:{route}"), &payload);
                match gateway.dispatch_route(&route, message.with_trigger("schedule")).await {
                    Ok(_) => {}
                    Err(err) => {
                        switchyard_event!(
                            warn,
                            "switchyard::gateway",
                            "schedule_dispatch_failed",
                            route = route.as_str(),
                            error = err,
                        );
                    }
                }
            }
        })
    }

    pub fn breakers(&self) -> &BreakerBoard {
        &self.breakers
    }
}

fn advances_failover(err: &DispatchError) -> bool {
    match err {
        // An open breaker means the target is known-bad; move on.
        DispatchError::CircuitOpen(_) => true,
        DispatchError::Delivery { reason, .. } => reason.starts_with("connectivity"),
        _ => false,
    }
}
