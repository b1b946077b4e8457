use crate::endpoint::EndpointDescriptor;
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::router::{
    ConditionOp, ConditionSource, ProcessingPolicy, RouteDefinition, RoutingKind, RoutingRule,
    RuleAction, RuleCondition,
};
use humantime::parse_duration;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRoute {
    pub(crate) name: String,
    pub(crate) source: String,
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) destination: Option<String>,
    #[serde(default)]
    pub(crate) destinations: Vec<String>,
    #[serde(default)]
    pub(crate) filter: Option<RawCondition>,
    #[serde(default)]
    pub(crate) rules: Vec<RawRule>,
    #[serde(default)]
    pub(crate) policy: Option<RawPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawRule {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) priority: i32,
    pub(crate) condition: RawCondition,
    #[serde(default)]
    pub(crate) forward: Option<String>,
    #[serde(default)]
    pub(crate) split: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawCondition {
    pub(crate) source: String,
    pub(crate) field: String,
    pub(crate) op: String,
    #[serde(default)]
    pub(crate) value: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawPolicy {
    #[serde(default)]
    pub(crate) r#async: bool,
    #[serde(default)]
    pub(crate) retries: Option<u32>,
    #[serde(default)]
    pub(crate) backoff: Option<String>,
    #[serde(default)]
    pub(crate) delay: Option<String>,
    #[serde(default)]
    pub(crate) timeout: Option<String>,
    #[serde(default)]
    pub(crate) dead_letter: Option<String>,
}

pub(crate) fn parse_routes(
    raw_routes: Vec<RawRoute>,
    errors: &mut Vec<String>,
) -> Vec<RouteDefinition> {
    let mut routes = Vec::with_capacity(raw_routes.len());

    for raw in raw_routes {
        let kind = match RoutingKind::from_raw(&raw.kind) {
            Some(kind) => kind,
            None => {
                errors.push(format!(
                    "error[routes]: route `{}` has unknown kind `{}` (expected direct, content_based, header_based, round_robin, or failover)",
                    raw.name, raw.kind
                ));
                RoutingKind::Direct
            }
        };

        match kind {
            RoutingKind::Direct if raw.destination.is_none() => {
                errors.push(format!(
                    "error[routes]: direct route `{}` must declare a destination",
                    raw.name
                ));
            }
            RoutingKind::RoundRobin | RoutingKind::Failover if raw.destinations.is_empty() => {
                errors.push(format!(
                    "error[routes]: {} route `{}` must declare a destination pool",
                    kind.as_str(),
                    raw.name
                ));
            }
            _ => {}
        }

        let filter = raw
            .filter
            .and_then(|condition| parse_condition(&raw.name, "filter", condition, errors));

        let mut rules = Vec::with_capacity(raw.rules.len());
        for rule in raw.rules {
            let Some(condition) =
                parse_condition(&raw.name, &rule.name, rule.condition, errors)
            else {
                continue;
            };

            if kind == RoutingKind::HeaderBased && condition.source == ConditionSource::Body {
                errors.push(format!(
                    "error[routes]: header_based route `{}` rule `{}` must not read the message body",
                    raw.name, rule.name
                ));
            }

            let action = match (rule.forward, rule.split.is_empty()) {
                (Some(endpoint), true) => RuleAction::Forward { endpoint },
                (None, false) => RuleAction::Split {
                    endpoints: rule.split,
                },
                (Some(_), false) => {
                    errors.push(format!(
                        "error[routes]: route `{}` rule `{}` declares both forward and split",
                        raw.name, rule.name
                    ));
                    continue;
                }
                (None, true) => {
                    errors.push(format!(
                        "error[routes]: route `{}` rule `{}` must declare forward or split",
                        raw.name, rule.name
                    ));
                    continue;
                }
            };

            rules.push(RoutingRule {
                name: rule.name,
                condition,
                action,
                priority: rule.priority,
            });
        }

        let policy = parse_policy(&raw.name, raw.policy.unwrap_or_default(), errors);

        routes.push(RouteDefinition {
            name: raw.name,
            source_pattern: raw.source,
            filter,
            kind,
            destination: raw.destination,
            destinations: raw.destinations,
            rules,
            policy,
        });
    }

    routes
}

fn parse_condition(
    route: &str,
    context: &str,
    raw: RawCondition,
    errors: &mut Vec<String>,
) -> Option<RuleCondition> {
    let source = match ConditionSource::from_raw(&raw.source) {
        Some(source) => source,
        None => {
            errors.push(format!(
                "error[routes]: route `{route}` {context} has unknown condition source `{}` (expected body, metadata, or header)",
                raw.source
            ));
            return None;
        }
    };
    let op = match ConditionOp::from_raw(&raw.op) {
        Some(op) => op,
        None => {
            errors.push(format!(
                "error[routes]: route `{route}` {context} has unknown condition op `{}`",
                raw.op
            ));
            return None;
        }
    };

    if raw.value.is_none() && op != ConditionOp::Exists {
        errors.push(format!(
            "error[routes]: route `{route}` {context} op `{}` requires a value",
            op.as_str()
        ));
        return None;
    }

    Some(RuleCondition {
        source,
        field: raw.field,
        op,
        value: raw.value.unwrap_or(JsonValue::Null),
    })
}

fn parse_policy(route: &str, raw: RawPolicy, errors: &mut Vec<String>) -> ProcessingPolicy {
    let mut retry = RetryPolicy::default();

    if let Some(retries) = raw.retries {
        retry.max_retries = retries;
    }
    if let Some(backoff) = raw.backoff {
        match BackoffStrategy::from_raw(&backoff) {
            Some(backoff) => retry.backoff = backoff,
            None => errors.push(format!(
                "error[routes]: route `{route}` has unknown backoff `{backoff}` (expected fixed, linear, or exponential)"
            )),
        }
    }
    if let Some(delay) = raw.delay {
        match parse_duration(&delay) {
            Ok(delay) => retry.delay = delay,
            Err(err) => errors.push(format!(
                "error[routes]: route `{route}` has invalid retry delay `{delay}`: {err}"
            )),
        }
    }

    let timeout = raw.timeout.and_then(|timeout| match parse_duration(&timeout) {
        Ok(timeout) => Some(timeout),
        Err(err) => {
            errors.push(format!(
                "error[routes]: route `{route}` has invalid timeout `{timeout}`: {err}"
            ));
            None
        }
    });

    ProcessingPolicy {
        is_async: raw.r#async,
        retry,
        timeout,
        dead_letter: raw.dead_letter,
    }
}

pub(crate) fn validate_references(
    routes: &[RouteDefinition],
    endpoints: &[EndpointDescriptor],
    errors: &mut Vec<String>,
) {
    let known: HashSet<&str> = endpoints
        .iter()
        .map(|endpoint| endpoint.name.as_str())
        .collect();

    for route in routes {
        for endpoint in route.referenced_endpoints() {
            if !known.contains(endpoint) {
                errors.push(format!(
                    "error[routes]: route `{}` references unknown endpoint `{endpoint}`",
                    route.name
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(source: &str, op: &str, value: Option<JsonValue>) -> RawCondition {
        RawCondition {
            source: source.to_string(),
            field: "priority".to_string(),
            op: op.to_string(),
            value,
        }
    }

    #[test]
    fn header_based_route_rejects_body_conditions() {
        let mut errors = Vec::new();
        parse_routes(
            vec![RawRoute {
                name: "r".to_string(),
                source: "*".to_string(),
                kind: "header_based".to_string(),
                destination: Some("q".to_string()),
                destinations: Vec::new(),
                filter: None,
                rules: vec![RawRule {
                    name: "body_rule".to_string(),
                    priority: 0,
                    condition: condition("body", "eq", Some(JsonValue::from("urgent"))),
                    forward: Some("q".to_string()),
                    split: Vec::new(),
                }],
                policy: None,
            }],
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("must not read the message body"));
    }

    #[test]
    fn eq_without_value_is_rejected_but_exists_is_not() {
        let mut errors = Vec::new();
        assert!(parse_condition("r", "rule", condition("body", "eq", None), &mut errors).is_none());
        assert!(
            parse_condition("r", "rule", condition("body", "exists", None), &mut errors).is_some()
        );
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn round_robin_requires_a_pool() {
        let mut errors = Vec::new();
        parse_routes(
            vec![RawRoute {
                name: "rr".to_string(),
                source: "*".to_string(),
                kind: "round_robin".to_string(),
                destination: None,
                destinations: Vec::new(),
                filter: None,
                rules: Vec::new(),
                policy: None,
            }],
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("destination pool"));
    }
}
