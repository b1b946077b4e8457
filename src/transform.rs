use crate::events::{EngineEvent, EventBus};
use crate::metrics::metrics;
use crate::schema::{Schema, SchemaSeverity, SchemaViolations};
use jaq_interpret::{
    Ctx as JaqCtx, FilterT, ParseCtx as JaqParseCtx, RcIter as JaqRcIter, Val as JaqVal,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(1);

/// A named, pure mapping from one JSON document to another.
///
/// The script is a jq expression evaluated against the input document only;
/// it cannot reach the clock, the filesystem, or any engine state, so the
/// same input always yields the same output.
#[derive(Clone, Debug)]
pub struct TransformationDefinition {
    pub name: String,
    pub script: String,
    pub input_schema: Option<SchemaCheck>,
    pub output_schema: Option<SchemaCheck>,
    pub timeout: Duration,
}

/// A schema plus what to do when a document violates it.
#[derive(Clone, Debug)]
pub struct SchemaCheck {
    pub schema: Schema,
    pub severity: SchemaSeverity,
}

impl TransformationDefinition {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            input_schema: None,
            output_schema: None,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn with_input_schema(mut self, schema: Schema, severity: SchemaSeverity) -> Self {
        self.input_schema = Some(SchemaCheck { schema, severity });
        self
    }

    pub fn with_output_schema(mut self, schema: Schema, severity: SchemaSeverity) -> Self {
        self.output_schema = Some(SchemaCheck { schema, severity });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Error)]
pub enum TransformationError {
    #[error("transformation `{name}` is already registered")]
    Duplicate { name: String },
    #[error("transformation `{name}` is not registered")]
    NotFound { name: String },
    #[error("transformation `{name}` has an invalid script: {reason}")]
    InvalidScript { name: String, reason: String },
    #[error("transformation `{name}` rejected its input: {source}")]
    InputRejected {
        name: String,
        #[source]
        source: SchemaViolations,
    },
    #[error("transformation `{name}` produced output violating its schema: {source}")]
    OutputRejected {
        name: String,
        #[source]
        source: SchemaViolations,
    },
    #[error("transformation `{name}` produced no result")]
    NoResult { name: String },
    #[error("transformation `{name}` produced multiple results")]
    MultipleResults { name: String },
    #[error("transformation `{name}` failed at runtime: {error}")]
    Runtime { name: String, error: String },
    #[error("transformation `{name}` exceeded its {timeout:?} budget")]
    Timeout { name: String, timeout: Duration },
}

/// Registry and runner for transformation scripts.
///
/// Scripts are compile-checked at registration so a malformed expression is
/// refused before any message can hit it. Execution happens on the blocking
/// pool under a per-definition deadline.
pub struct TransformationExecutor {
    definitions: Mutex<HashMap<String, Arc<TransformationDefinition>>>,
    events: EventBus,
}

impl TransformationExecutor {
    pub fn new(events: EventBus) -> Self {
        Self {
            definitions: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn register(&self, definition: TransformationDefinition) -> Result<(), TransformationError> {
        compile_check(&definition.name, &definition.script)?;

        let mut definitions = self.definitions.lock().expect("transformation registry");
        if definitions.contains_key(&definition.name) {
            return Err(TransformationError::Duplicate {
                name: definition.name,
            });
        }

        tracing::info!(
            target: "switchyard::transform",
            event = "transformation_registered",
            transformation = %definition.name,
        );
        definitions.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Result<Arc<TransformationDefinition>, TransformationError> {
        let definitions = self.definitions.lock().expect("transformation registry");
        definitions
            .get(name)
            .cloned()
            .ok_or_else(|| TransformationError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn list(&self) -> Vec<Arc<TransformationDefinition>> {
        let definitions = self.definitions.lock().expect("transformation registry");
        let mut all: Vec<_> = definitions.values().cloned().collect();
        all.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        all
    }

    /// Runs the named transformation against one document.
    pub async fn apply(
        &self,
        name: &str,
        input: &JsonValue,
    ) -> Result<JsonValue, TransformationError> {
        let definition = self.definition(name)?;

        if let Some(check) = &definition.input_schema {
            if let Err(violations) = check.schema.validate("input", input) {
                match check.severity {
                    SchemaSeverity::Error => {
                        self.report(&definition, false, Duration::ZERO);
                        return Err(TransformationError::InputRejected {
                            name: definition.name.clone(),
                            source: violations,
                        });
                    }
                    SchemaSeverity::Warning => {
                        tracing::warn!(
                            target: "switchyard::transform",
                            event = "input_schema_warning",
                            transformation = %definition.name,
                            violations = %violations,
                        );
                    }
                }
            }
        }

        let started = Instant::now();
        let script = definition.script.clone();
        let script_name = definition.name.clone();
        let document = input.clone();

        let outcome = tokio::time::timeout(
            definition.timeout,
            tokio::task::spawn_blocking(move || evaluate_script(&script_name, &script, document)),
        )
        .await;

        let elapsed = started.elapsed();
        let result = match outcome {
            Err(_) => Err(TransformationError::Timeout {
                name: definition.name.clone(),
                timeout: definition.timeout,
            }),
            Ok(Err(join_error)) => Err(TransformationError::Runtime {
                name: definition.name.clone(),
                error: join_error.to_string(),
            }),
            Ok(Ok(result)) => result,
        };

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                self.report(&definition, false, elapsed);
                return Err(err);
            }
        };

        if let Some(check) = &definition.output_schema {
            if let Err(violations) = check.schema.validate("output", &output) {
                match check.severity {
                    SchemaSeverity::Error => {
                        self.report(&definition, false, elapsed);
                        return Err(TransformationError::OutputRejected {
                            name: definition.name.clone(),
                            source: violations,
                        });
                    }
                    SchemaSeverity::Warning => {
                        tracing::warn!(
                            target: "switchyard::transform",
                            event = "output_schema_warning",
                            transformation = %definition.name,
                            violations = %violations,
                        );
                    }
                }
            }
        }

        self.report(&definition, true, elapsed);
        Ok(output)
    }

    fn report(&self, definition: &TransformationDefinition, success: bool, elapsed: Duration) {
        metrics().record_transformation(&definition.name, success, elapsed);
        self.events.publish(EngineEvent::TransformationResult {
            transformation: definition.name.clone(),
            success,
            duration_ms: elapsed.as_millis() as u64,
        });
    }
}

fn compile_check(name: &str, script: &str) -> Result<(), TransformationError> {
    let (parsed, parse_errors) = jaq_parse::parse(script, jaq_parse::main());

    if !parse_errors.is_empty() {
        let reason = parse_errors
            .into_iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(TransformationError::InvalidScript {
            name: name.to_string(),
            reason,
        });
    }

    let main = parsed.ok_or_else(|| TransformationError::InvalidScript {
        name: name.to_string(),
        reason: "script did not produce a filter".to_string(),
    })?;

    let mut ctx = JaqParseCtx::new(Vec::new());
    ctx.compile(main);
    if !ctx.errs.is_empty() {
        return Err(TransformationError::InvalidScript {
            name: name.to_string(),
            reason: "failed to compile script".to_string(),
        });
    }
    Ok(())
}

fn evaluate_script(
    name: &str,
    script: &str,
    input: JsonValue,
) -> Result<JsonValue, TransformationError> {
    let (parsed, parse_errors) = jaq_parse::parse(script, jaq_parse::main());

    if !parse_errors.is_empty() {
        let reason = parse_errors
            .into_iter()
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(TransformationError::InvalidScript {
            name: name.to_string(),
            reason,
        });
    }

    let main = parsed.ok_or_else(|| TransformationError::InvalidScript {
        name: name.to_string(),
        reason: "script did not produce a filter".to_string(),
    })?;

    let mut ctx = JaqParseCtx::new(Vec::new());
    let filter = ctx.compile(main);
    if !ctx.errs.is_empty() {
        return Err(TransformationError::InvalidScript {
            name: name.to_string(),
            reason: "failed to compile script".to_string(),
        });
    }

    let inputs = JaqRcIter::new(std::iter::empty::<Result<JaqVal, String>>());
    let mut results = filter.run((JaqCtx::new([], &inputs), JaqVal::from(input)));

    let first = results
        .next()
        .ok_or_else(|| TransformationError::NoResult {
            name: name.to_string(),
        })?
        .map_err(|err| TransformationError::Runtime {
            name: name.to_string(),
            error: err.to_string(),
        })?;

    if results.next().is_some() {
        return Err(TransformationError::MultipleResults {
            name: name.to_string(),
        });
    }

    Ok(JsonValue::from(first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, FieldSpec};
    use serde_json::json;

    fn executor() -> TransformationExecutor {
        TransformationExecutor::new(EventBus::default())
    }

    fn number_field(path: &str) -> FieldSpec {
        FieldSpec {
            path: path.to_string(),
            kind: FieldKind::Number,
            required: true,
        }
    }

    #[tokio::test]
    async fn identity_script_returns_the_input() {
        let executor = executor();
        executor
            .register(TransformationDefinition::new("identity", "."))
            .expect("register");

        let input = json!({"order": {"id": 7}});
        let output = executor.apply("identity", &input).await.expect("apply");
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn script_reshapes_the_document() {
        let executor = executor();
        executor
            .register(TransformationDefinition::new(
                "total",
                "{order_id: .id, total: (.net + .tax)}",
            ))
            .expect("register");

        let output = executor
            .apply("total", &json!({"id": 4, "net": 10, "tax": 2}))
            .await
            .expect("apply");
        assert_eq!(output, json!({"order_id": 4, "total": 12}));
    }

    #[tokio::test]
    async fn same_input_always_yields_same_output() {
        let executor = executor();
        executor
            .register(TransformationDefinition::new("shape", "{keys: keys}"))
            .expect("register");

        let input = json!({"b": 1, "a": 2});
        let first = executor.apply("shape", &input).await.expect("apply");
        let second = executor.apply("shape", &input).await.expect("apply");
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_script_is_refused_at_registration() {
        let executor = executor();
        let err = executor
            .register(TransformationDefinition::new("broken", ".foo |"))
            .expect_err("parse failure");
        assert!(matches!(err, TransformationError::InvalidScript { .. }));
        assert!(matches!(
            executor.definition("broken"),
            Err(TransformationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn input_schema_error_severity_rejects() {
        let executor = executor();
        let schema = Schema::new(vec![number_field("id")]);
        executor
            .register(
                TransformationDefinition::new("strict", ".")
                    .with_input_schema(schema, SchemaSeverity::Error),
            )
            .expect("register");

        let err = executor
            .apply("strict", &json!({"name": "no id"}))
            .await
            .expect_err("missing required field");
        assert!(matches!(err, TransformationError::InputRejected { .. }));
    }

    #[tokio::test]
    async fn input_schema_warning_severity_passes() {
        let executor = executor();
        let schema = Schema::new(vec![number_field("id")]);
        executor
            .register(
                TransformationDefinition::new("lenient", ".")
                    .with_input_schema(schema, SchemaSeverity::Warning),
            )
            .expect("register");

        executor
            .apply("lenient", &json!({"name": "no id"}))
            .await
            .expect("warning does not reject");
    }

    #[tokio::test]
    async fn output_schema_violation_rejects_the_result() {
        let executor = executor();
        let schema = Schema::new(vec![number_field("total")]);
        executor
            .register(
                TransformationDefinition::new("bad_output", "{total: \"not a number\"}")
                    .with_output_schema(schema, SchemaSeverity::Error),
            )
            .expect("register");

        let err = executor
            .apply("bad_output", &json!({}))
            .await
            .expect_err("output violates schema");
        assert!(matches!(err, TransformationError::OutputRejected { .. }));
    }

    #[tokio::test]
    async fn runtime_failure_is_reported() {
        let executor = executor();
        executor
            .register(TransformationDefinition::new("adds", ".a + .b"))
            .expect("register");

        let err = executor
            .apply("adds", &json!({"a": 1, "b": "two"}))
            .await
            .expect_err("number plus string");
        assert!(matches!(err, TransformationError::Runtime { .. }));
    }

    #[tokio::test]
    async fn multiple_results_are_refused() {
        let executor = executor();
        executor
            .register(TransformationDefinition::new("fanout", ".[]"))
            .expect("register");

        let err = executor
            .apply("fanout", &json!([1, 2]))
            .await
            .expect_err("two results");
        assert!(matches!(err, TransformationError::MultipleResults { .. }));
    }

    #[tokio::test]
    async fn result_event_carries_success_flag() {
        let bus = EventBus::default();
        let mut stream = bus.subscribe();
        let executor = TransformationExecutor::new(bus);
        executor
            .register(TransformationDefinition::new("identity", "."))
            .expect("register");

        executor.apply("identity", &json!(1)).await.expect("apply");

        match stream.try_recv().expect("result event") {
            EngineEvent::TransformationResult {
                transformation,
                success,
                ..
            } => {
                assert_eq!(transformation, "identity");
                assert!(success);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
