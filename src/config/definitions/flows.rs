use crate::flow::{FlowConfiguration, FlowDefinition, FlowStep, OnError, StepAction};
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::router::RouteDefinition;
use crate::transform::TransformationDefinition;
use humantime::parse_duration;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawFlow {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) config: Option<RawFlowConfig>,
    #[serde(default)]
    pub(crate) steps: Vec<RawStep>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawFlowConfig {
    #[serde(default)]
    pub(crate) parallelism: Option<usize>,
    #[serde(default)]
    pub(crate) step_timeout: Option<String>,
    #[serde(default)]
    pub(crate) retries: Option<u32>,
    #[serde(default)]
    pub(crate) backoff: Option<String>,
    #[serde(default)]
    pub(crate) delay: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RawStep {
    pub(crate) name: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
    #[serde(default)]
    pub(crate) route: Option<String>,
    #[serde(default)]
    pub(crate) transformation: Option<String>,
    #[serde(default)]
    pub(crate) field: Option<String>,
    #[serde(default)]
    pub(crate) equals: Option<JsonValue>,
    #[serde(default)]
    pub(crate) depends_on: Vec<String>,
    #[serde(default)]
    pub(crate) on_error: Option<String>,
    #[serde(default)]
    pub(crate) fallback_step: Option<String>,
}

pub(crate) fn parse_flows(raw_flows: Vec<RawFlow>, errors: &mut Vec<String>) -> Vec<FlowDefinition> {
    let mut flows = Vec::with_capacity(raw_flows.len());

    for raw in raw_flows {
        let config = parse_flow_config(&raw.name, raw.config.unwrap_or_default(), errors);

        let mut steps = Vec::with_capacity(raw.steps.len());
        for step in raw.steps {
            let Some(action) = parse_action(&raw.name, &step, errors) else {
                continue;
            };
            let on_error = parse_on_error(&raw.name, &step, errors);
            steps.push(FlowStep {
                name: step.name,
                action,
                dependencies: step.depends_on,
                on_error,
            });
        }

        flows.push(FlowDefinition {
            name: raw.name,
            steps,
            config,
        });
    }

    flows
}

fn parse_flow_config(
    flow: &str,
    raw: RawFlowConfig,
    errors: &mut Vec<String>,
) -> FlowConfiguration {
    let mut retry = RetryPolicy::default();
    if let Some(retries) = raw.retries {
        retry.max_retries = retries;
    }
    if let Some(backoff) = raw.backoff {
        match BackoffStrategy::from_raw(&backoff) {
            Some(backoff) => retry.backoff = backoff,
            None => errors.push(format!(
                "error[flows]: flow `{flow}` has unknown backoff `{backoff}` (expected fixed, linear, or exponential)"
            )),
        }
    }
    if let Some(delay) = raw.delay {
        match parse_duration(&delay) {
            Ok(delay) => retry.delay = delay,
            Err(err) => errors.push(format!(
                "error[flows]: flow `{flow}` has invalid retry delay `{delay}`: {err}"
            )),
        }
    }

    let step_timeout = raw
        .step_timeout
        .and_then(|timeout| match parse_duration(&timeout) {
            Ok(timeout) => Some(timeout),
            Err(err) => {
                errors.push(format!(
                    "error[flows]: flow `{flow}` has invalid step_timeout `{timeout}`: {err}"
                ));
                None
            }
        });

    if raw.parallelism == Some(0) {
        errors.push(format!(
            "error[flows]: flow `{flow}` parallelism must be at least 1"
        ));
    }

    FlowConfiguration {
        parallelism: raw.parallelism.filter(|&limit| limit > 0),
        step_timeout,
        retry,
    }
}

fn parse_action(flow: &str, step: &RawStep, errors: &mut Vec<String>) -> Option<StepAction> {
    match step.kind.as_str() {
        "endpoint_call" => match &step.route {
            Some(route) => Some(StepAction::EndpointCall {
                route: route.clone(),
            }),
            None => {
                errors_push_missing(flow, &step.name, "route", errors);
                None
            }
        },
        kind @ ("transformation" | "validation" | "enrichment") => match &step.transformation {
            Some(transformation) => {
                let transformation = transformation.clone();
                Some(match kind {
                    "transformation" => StepAction::Transform { transformation },
                    "validation" => StepAction::Validate { transformation },
                    _ => StepAction::Enrich { transformation },
                })
            }
            None => {
                errors_push_missing(flow, &step.name, "transformation", errors);
                None
            }
        },
        "split" => Some(StepAction::Split),
        "join" => Some(StepAction::Join),
        "condition" => match &step.field {
            Some(field) => Some(StepAction::Condition {
                field: field.clone(),
                equals: step.equals.clone().unwrap_or(JsonValue::Bool(true)),
            }),
            None => {
                errors_push_missing(flow, &step.name, "field", errors);
                None
            }
        },
        other => {
            errors.push(format!(
                "error[flows]: flow `{flow}` step `{}` has unknown type `{other}`",
                step.name
            ));
            None
        }
    }
}

fn errors_push_missing(flow: &str, step: &str, field: &str, errors: &mut Vec<String>) {
    errors.push(format!(
        "error[flows]: flow `{flow}` step `{step}` requires `{field}`"
    ));
}

fn parse_on_error(flow: &str, step: &RawStep, errors: &mut Vec<String>) -> OnError {
    match step.on_error.as_deref() {
        None => OnError::default(),
        Some("stop") => OnError::Stop,
        Some("continue") => OnError::Continue,
        Some("retry") => OnError::Retry,
        Some("fallback") => match &step.fallback_step {
            Some(fallback) => OnError::Fallback {
                step: fallback.clone(),
            },
            None => {
                errors.push(format!(
                    "error[flows]: flow `{flow}` step `{}` uses on_error fallback without fallback_step",
                    step.name
                ));
                OnError::Stop
            }
        },
        Some(other) => {
            errors.push(format!(
                "error[flows]: flow `{flow}` step `{}` has unknown on_error `{other}` (expected stop, continue, retry, or fallback)",
                step.name
            ));
            OnError::Stop
        }
    }
}

pub(crate) fn validate_references(
    flows: &[FlowDefinition],
    routes: &[RouteDefinition],
    transformations: &[TransformationDefinition],
    errors: &mut Vec<String>,
) {
    let known_routes: HashSet<&str> = routes.iter().map(|route| route.name.as_str()).collect();
    let known_transformations: HashSet<&str> = transformations
        .iter()
        .map(|transformation| transformation.name.as_str())
        .collect();

    for flow in flows {
        for route in flow.referenced_routes() {
            if !known_routes.contains(route) {
                errors.push(format!(
                    "error[flows]: flow `{}` references unknown route `{route}`",
                    flow.name
                ));
            }
        }
        for transformation in flow.referenced_transformations() {
            if !known_transformations.contains(transformation) {
                errors.push(format!(
                    "error[flows]: flow `{}` references unknown transformation `{transformation}`",
                    flow.name
                ));
            }
        }
    }
}

/// Structural validation: dependency names, fallback targets, and the
/// acyclicity requirement.
pub(crate) fn validate_graphs(flows: &[FlowDefinition], errors: &mut Vec<String>) {
    for flow in flows {
        if let Err(err) = flow.validate() {
            errors.push(format!("error[flows]: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_step(name: &str, kind: &str) -> RawStep {
        RawStep {
            name: name.to_string(),
            kind: kind.to_string(),
            route: None,
            transformation: None,
            field: None,
            equals: None,
            depends_on: Vec::new(),
            on_error: None,
            fallback_step: None,
        }
    }

    #[test]
    fn step_requires_its_target_field() {
        let mut errors = Vec::new();
        let flows = parse_flows(
            vec![RawFlow {
                name: "f".to_string(),
                config: None,
                steps: vec![raw_step("send", "endpoint_call")],
            }],
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("requires `route`"));
        assert!(flows[0].steps.is_empty());
    }

    #[test]
    fn fallback_without_target_becomes_stop() {
        let mut errors = Vec::new();
        let mut step = raw_step("send", "join");
        step.on_error = Some("fallback".to_string());
        let flows = parse_flows(
            vec![RawFlow {
                name: "f".to_string(),
                config: None,
                steps: vec![step],
            }],
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(flows[0].steps[0].on_error, OnError::Stop);
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let mut errors = Vec::new();
        parse_flow_config(
            "f",
            RawFlowConfig {
                parallelism: Some(0),
                ..RawFlowConfig::default()
            },
            &mut errors,
        );
        assert_eq!(errors.len(), 1);
    }
}
