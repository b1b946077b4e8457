#![forbid(unsafe_code)]

use crate::codec::CodecError;
use crate::domain::Message;
use crate::events::{EngineEvent, EventBus};
use crate::metrics::metrics;
use crate::retry::RetryPolicy;
use crate::schema::resolve_path;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Where a condition reads its operand from. Header-based routes are limited
/// to `Metadata`/`Header` at registration so evaluating them never decodes
/// the body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionSource {
    Body,
    Metadata,
    Header,
}

impl ConditionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionSource::Body => "body",
            ConditionSource::Metadata => "metadata",
            ConditionSource::Header => "header",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "body" => Some(ConditionSource::Body),
            "metadata" => Some(ConditionSource::Metadata),
            "header" => Some(ConditionSource::Header),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    Exists,
}

impl ConditionOp {
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionOp::Eq => "eq",
            ConditionOp::Ne => "ne",
            ConditionOp::Gt => "gt",
            ConditionOp::Lt => "lt",
            ConditionOp::Contains => "contains",
            ConditionOp::Exists => "exists",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "eq" => Some(ConditionOp::Eq),
            "ne" => Some(ConditionOp::Ne),
            "gt" => Some(ConditionOp::Gt),
            "lt" => Some(ConditionOp::Lt),
            "contains" => Some(ConditionOp::Contains),
            "exists" => Some(ConditionOp::Exists),
            _ => None,
        }
    }
}

/// Predicate over one message field.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleCondition {
    pub source: ConditionSource,
    pub field: String,
    pub op: ConditionOp,
    pub value: JsonValue,
}

impl RuleCondition {
    fn operand<'a>(
        &self,
        message: &'a Message,
        body: &'a mut Option<JsonValue>,
    ) -> Result<Option<JsonValue>, CodecError> {
        match self.source {
            ConditionSource::Metadata => Ok(message
                .metadata_value(&self.field)
                .map(|value| JsonValue::String(value.to_string()))),
            ConditionSource::Header => Ok(message
                .header_value(&self.field)
                .map(|value| JsonValue::String(value.to_string()))),
            ConditionSource::Body => {
                if body.is_none() {
                    *body = Some(message.body_json()?);
                }
                let decoded = body.as_ref().expect("decoded body");
                Ok(resolve_path(decoded, &self.field).cloned())
            }
        }
    }

    /// Evaluates the predicate; `body` caches the decoded payload so a rule
    /// list decodes at most once.
    pub fn matches(
        &self,
        message: &Message,
        body: &mut Option<JsonValue>,
    ) -> Result<bool, CodecError> {
        let operand = self.operand(message, body)?;

        Ok(match self.op {
            ConditionOp::Exists => operand.is_some(),
            ConditionOp::Eq => operand.as_ref() == Some(&self.value),
            ConditionOp::Ne => operand.as_ref() != Some(&self.value),
            ConditionOp::Gt => compare_numbers(operand.as_ref(), &self.value)
                .map(|ordering| ordering.is_gt())
                .unwrap_or(false),
            ConditionOp::Lt => compare_numbers(operand.as_ref(), &self.value)
                .map(|ordering| ordering.is_lt())
                .unwrap_or(false),
            ConditionOp::Contains => match (&operand, &self.value) {
                (Some(JsonValue::String(haystack)), JsonValue::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Some(JsonValue::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
        })
    }
}

fn compare_numbers(lhs: Option<&JsonValue>, rhs: &JsonValue) -> Option<std::cmp::Ordering> {
    let lhs = lhs?.as_f64().or_else(|| lhs?.as_str()?.parse().ok())?;
    let rhs = rhs.as_f64()?;
    lhs.partial_cmp(&rhs)
}

/// Destination override applied when a rule wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleAction {
    Forward { endpoint: String },
    Split { endpoints: Vec<String> },
}

/// One entry of a route's ordered rule list. Lower `priority` values evaluate
/// first; equal priorities keep registration order.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutingRule {
    pub name: String,
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub priority: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingKind {
    Direct,
    ContentBased,
    HeaderBased,
    RoundRobin,
    Failover,
}

impl RoutingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingKind::Direct => "direct",
            RoutingKind::ContentBased => "content_based",
            RoutingKind::HeaderBased => "header_based",
            RoutingKind::RoundRobin => "round_robin",
            RoutingKind::Failover => "failover",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "direct" => Some(RoutingKind::Direct),
            "content_based" => Some(RoutingKind::ContentBased),
            "header_based" => Some(RoutingKind::HeaderBased),
            "round_robin" => Some(RoutingKind::RoundRobin),
            "failover" => Some(RoutingKind::Failover),
            _ => None,
        }
    }
}

/// Delivery policy for a route: retry budget, per-call timeout, dead letter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessingPolicy {
    pub is_async: bool,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub dead_letter: Option<String>,
}

/// A validated route. Owns its rule list; endpoints are referenced by name.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteDefinition {
    pub name: String,
    pub source_pattern: String,
    pub filter: Option<RuleCondition>,
    pub kind: RoutingKind,
    pub destination: Option<String>,
    pub destinations: Vec<String>,
    pub rules: Vec<RoutingRule>,
    pub policy: ProcessingPolicy,
}

impl RouteDefinition {
    /// Every endpoint name this route references.
    pub fn referenced_endpoints(&self) -> Vec<&str> {
        let mut endpoints: Vec<&str> = Vec::new();
        if let Some(destination) = &self.destination {
            endpoints.push(destination);
        }
        endpoints.extend(self.destinations.iter().map(String::as_str));
        for rule in &self.rules {
            match &rule.action {
                RuleAction::Forward { endpoint } => endpoints.push(endpoint),
                RuleAction::Split { endpoints: split } => {
                    endpoints.extend(split.iter().map(String::as_str))
                }
            }
        }
        if let Some(dead_letter) = &self.policy.dead_letter {
            endpoints.push(dead_letter);
        }
        endpoints.sort_unstable();
        endpoints.dedup();
        endpoints
    }

    /// Matches the message source against the route pattern (`*` suffix
    /// wildcard, otherwise exact).
    pub fn matches_source(&self, source: &str) -> bool {
        match self.source_pattern.strip_suffix('*') {
            Some(prefix) => source.starts_with(prefix),
            None => self.source_pattern == source,
        }
    }

    /// Rule indices in evaluation order: priority, then registration order.
    fn rule_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.rules.len()).collect();
        order.sort_by_key(|&index| self.rules[index].priority);
        order
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub endpoint: String,
    pub rule: Option<String>,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("route `{route}` matched no rule and declares no fallback destination")]
    NoRouteMatched { route: String },
    #[error("route `{route}` has an empty destination pool")]
    EmptyDestinationPool { route: String },
    #[error("route `{route}` filter rejected the message")]
    FilteredOut { route: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Evaluates routing rules and selects destinations. Holds one atomic cursor
/// per round-robin route so concurrent calls get distinct assignments.
pub struct Router {
    events: EventBus,
    cursors: Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl Router {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves the destination set for one message.
    ///
    /// For `failover` routes the full candidate list is returned in declared
    /// order; the gateway walks it and only advances past connectivity-class
    /// failures.
    pub fn route(
        &self,
        message: &Message,
        route: &RouteDefinition,
    ) -> Result<Vec<ResolvedDestination>, RoutingError> {
        let mut body = None;

        if let Some(filter) = &route.filter {
            if !filter.matches(message, &mut body)? {
                metrics().record_route_filtered(&route.name);
                return Err(RoutingError::FilteredOut {
                    route: route.name.clone(),
                });
            }
        }

        let (destinations, rule) = match route.kind {
            RoutingKind::Direct => (vec![self.fixed_destination(route)?], None),
            RoutingKind::ContentBased | RoutingKind::HeaderBased => {
                self.evaluate_rules(message, route, &mut body)?
            }
            RoutingKind::RoundRobin => (vec![self.next_round_robin(route)?], None),
            RoutingKind::Failover => {
                if route.destinations.is_empty() {
                    return Err(RoutingError::EmptyDestinationPool {
                        route: route.name.clone(),
                    });
                }
                let ordered = route
                    .destinations
                    .iter()
                    .map(|endpoint| ResolvedDestination {
                        endpoint: endpoint.clone(),
                        rule: None,
                    })
                    .collect();
                (ordered, None)
            }
        };

        metrics().record_route_decision(&route.name);
        self.events.publish(EngineEvent::RouteDecision {
            route: route.name.clone(),
            rule: rule.clone(),
            destinations: destinations
                .iter()
                .map(|destination| destination.endpoint.clone())
                .collect(),
        });

        Ok(destinations)
    }

    fn fixed_destination(&self, route: &RouteDefinition) -> Result<ResolvedDestination, RoutingError> {
        route
            .destination
            .as_ref()
            .map(|endpoint| ResolvedDestination {
                endpoint: endpoint.clone(),
                rule: None,
            })
            .ok_or_else(|| RoutingError::NoRouteMatched {
                route: route.name.clone(),
            })
    }

    fn evaluate_rules(
        &self,
        message: &Message,
        route: &RouteDefinition,
        body: &mut Option<JsonValue>,
    ) -> Result<(Vec<ResolvedDestination>, Option<String>), RoutingError> {
        for index in route.rule_order() {
            let rule = &route.rules[index];
            if !rule.condition.matches(message, body)? {
                continue;
            }

            let destinations = match &rule.action {
                RuleAction::Forward { endpoint } => vec![ResolvedDestination {
                    endpoint: endpoint.clone(),
                    rule: Some(rule.name.clone()),
                }],
                RuleAction::Split { endpoints } => endpoints
                    .iter()
                    .map(|endpoint| ResolvedDestination {
                        endpoint: endpoint.clone(),
                        rule: Some(rule.name.clone()),
                    })
                    .collect(),
            };
            return Ok((destinations, Some(rule.name.clone())));
        }

        // No rule matched; fall back to the route's own destination.
        match &route.destination {
            Some(endpoint) => Ok((
                vec![ResolvedDestination {
                    endpoint: endpoint.clone(),
                    rule: None,
                }],
                None,
            )),
            None => {
                metrics().record_route_no_match(&route.name);
                crate::switchyard_event!(
                    warn,
                    "switchyard::router",
                    "no_route_matched",
                    route = route.name.as_str(),
                );
                Err(RoutingError::NoRouteMatched {
                    route: route.name.clone(),
                })
            }
        }
    }

    fn next_round_robin(&self, route: &RouteDefinition) -> Result<ResolvedDestination, RoutingError> {
        if route.destinations.is_empty() {
            return Err(RoutingError::EmptyDestinationPool {
                route: route.name.clone(),
            });
        }

        let cursor = {
            let mut cursors = self.cursors.lock().expect("round robin cursors");
            Arc::clone(
                cursors
                    .entry(route.name.clone())
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0))),
            )
        };

        // Strictly serialized assignment: one fetch_add per call, wrap modulo
        // the pool size.
        let slot = cursor.fetch_add(1, Ordering::Relaxed) % route.destinations.len();
        Ok(ResolvedDestination {
            endpoint: route.destinations[slot].clone(),
            rule: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(priority: &str) -> Message {
        Message::json("orders", &json!({"priority": priority}))
    }

    fn content_route() -> RouteDefinition {
        RouteDefinition {
            name: "r1".to_string(),
            source_pattern: "orders".to_string(),
            filter: None,
            kind: RoutingKind::ContentBased,
            destination: Some("q1".to_string()),
            destinations: Vec::new(),
            rules: vec![RoutingRule {
                name: "urgent-to-q2".to_string(),
                condition: RuleCondition {
                    source: ConditionSource::Body,
                    field: "priority".to_string(),
                    op: ConditionOp::Eq,
                    value: json!("urgent"),
                },
                action: RuleAction::Forward {
                    endpoint: "q2".to_string(),
                },
                priority: 0,
            }],
            policy: ProcessingPolicy::default(),
        }
    }

    #[test]
    fn urgent_message_wins_the_rule() {
        let router = Router::new(EventBus::default());
        let resolved = router.route(&message("urgent"), &content_route()).expect("route");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].endpoint, "q2");
        assert_eq!(resolved[0].rule.as_deref(), Some("urgent-to-q2"));
    }

    #[test]
    fn normal_message_falls_back_to_default() {
        let router = Router::new(EventBus::default());
        let resolved = router.route(&message("normal"), &content_route()).expect("route");
        assert_eq!(resolved[0].endpoint, "q1");
        assert!(resolved[0].rule.is_none());
    }

    #[test]
    fn repeated_evaluation_is_deterministic() {
        let router = Router::new(EventBus::default());
        let route = content_route();
        let msg = message("urgent");
        let first = router.route(&msg, &route).expect("route");
        for _ in 0..20 {
            assert_eq!(router.route(&msg, &route).expect("route"), first);
        }
    }

    #[test]
    fn equal_priority_keeps_registration_order() {
        let mut route = content_route();
        route.rules.push(RoutingRule {
            name: "urgent-to-q3".to_string(),
            condition: RuleCondition {
                source: ConditionSource::Body,
                field: "priority".to_string(),
                op: ConditionOp::Eq,
                value: json!("urgent"),
            },
            action: RuleAction::Forward {
                endpoint: "q3".to_string(),
            },
            priority: 0,
        });

        let router = Router::new(EventBus::default());
        let resolved = router.route(&message("urgent"), &route).expect("route");
        assert_eq!(resolved[0].endpoint, "q2");
    }

    #[test]
    fn lower_priority_value_evaluates_first() {
        let mut route = content_route();
        route.rules.insert(
            0,
            RoutingRule {
                name: "late-rule".to_string(),
                condition: RuleCondition {
                    source: ConditionSource::Body,
                    field: "priority".to_string(),
                    op: ConditionOp::Exists,
                    value: JsonValue::Null,
                },
                action: RuleAction::Forward {
                    endpoint: "q9".to_string(),
                },
                priority: 10,
            },
        );

        let router = Router::new(EventBus::default());
        let resolved = router.route(&message("urgent"), &route).expect("route");
        assert_eq!(resolved[0].endpoint, "q2");
    }

    #[test]
    fn header_based_rules_never_decode_the_body() {
        let route = RouteDefinition {
            name: "hdr".to_string(),
            source_pattern: "*".to_string(),
            filter: None,
            kind: RoutingKind::HeaderBased,
            destination: Some("q1".to_string()),
            destinations: Vec::new(),
            rules: vec![RoutingRule {
                name: "tenant-a".to_string(),
                condition: RuleCondition {
                    source: ConditionSource::Metadata,
                    field: "tenant".to_string(),
                    op: ConditionOp::Eq,
                    value: json!("a"),
                },
                action: RuleAction::Forward {
                    endpoint: "qa".to_string(),
                },
                priority: 0,
            }],
            policy: ProcessingPolicy::default(),
        };

        // Body is intentionally invalid JSON; metadata routing must not touch it.
        let msg = Message::new("any", crate::domain::PayloadFormat::Json, b"{broken".to_vec())
            .with_metadata("tenant", "a");

        let router = Router::new(EventBus::default());
        let resolved = router.route(&msg, &route).expect("route");
        assert_eq!(resolved[0].endpoint, "qa");
    }

    #[test]
    fn round_robin_wraps_modulo_pool() {
        let route = RouteDefinition {
            name: "rr".to_string(),
            source_pattern: "*".to_string(),
            filter: None,
            kind: RoutingKind::RoundRobin,
            destination: None,
            destinations: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            rules: Vec::new(),
            policy: ProcessingPolicy::default(),
        };

        let router = Router::new(EventBus::default());
        let msg = message("normal");
        let picks: Vec<String> = (0..6)
            .map(|_| router.route(&msg, &route).expect("route")[0].endpoint.clone())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn split_action_fans_out() {
        let mut route = content_route();
        route.rules[0].action = RuleAction::Split {
            endpoints: vec!["q2".to_string(), "audit".to_string()],
        };

        let router = Router::new(EventBus::default());
        let resolved = router.route(&message("urgent"), &route).expect("route");
        let endpoints: Vec<&str> = resolved.iter().map(|d| d.endpoint.as_str()).collect();
        assert_eq!(endpoints, ["q2", "audit"]);
    }

    #[test]
    fn no_match_without_fallback_is_an_error() {
        let mut route = content_route();
        route.destination = None;
        let router = Router::new(EventBus::default());
        let err = router.route(&message("normal"), &route).expect_err("no fallback");
        assert!(matches!(err, RoutingError::NoRouteMatched { .. }));
    }
}
