use crate::backpressure::ParallelismGate;
use crate::events::{EngineEvent, EventBus};
use crate::flow::execution::{ExecutionStatus, ExecutionStore, FlowExecution, StepStatus};
use crate::flow::{FlowDefinition, FlowStep, FlowValidationError, OnError, StepAction};
use crate::metrics::metrics;
use crate::retry::sleep_with_shutdown;
use crate::schema::resolve_path;
use crate::switchyard_event;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Seam between the orchestrator and the sub-capabilities a step dispatches
/// to. The engine wires this to the router/gateway and the transformation
/// executor; tests script it.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn call_route(&self, route: &str, document: JsonValue) -> Result<JsonValue, StepFault>;
    async fn transform(
        &self,
        transformation: &str,
        document: JsonValue,
    ) -> Result<JsonValue, StepFault>;
}

/// A failed sub-capability call, normalized to a reason string so the
/// orchestrator can apply error policy without caring which capability broke.
#[derive(Clone, Debug, Error)]
#[error("{reason}")]
pub struct StepFault {
    pub reason: String,
}

impl StepFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A step failure annotated with its flow position, recorded on the
/// execution snapshot.
#[derive(Clone, Debug, Error)]
#[error("step `{step}` failed after {attempt} attempt(s): {reason}")]
pub struct StepExecutionError {
    pub step: String,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum FlowExecutionError {
    #[error("flow `{flow}` is already registered")]
    Duplicate { flow: String },
    #[error(transparent)]
    Invalid(#[from] FlowValidationError),
    #[error("flow `{flow}` is not registered")]
    FlowNotFound { flow: String },
    #[error("flow execution `{execution}` is not known")]
    ExecutionNotFound { execution: Uuid },
}

/// Runs flow executions: topological scheduling under the flow's parallelism
/// bound, per-step timeouts, retry backoff, and error policy resolution.
pub struct FlowOrchestrator {
    flows: Mutex<HashMap<String, Arc<FlowDefinition>>>,
    executions: Arc<ExecutionStore>,
    dispatcher: Arc<dyn StepDispatcher>,
    events: EventBus,
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl FlowOrchestrator {
    pub fn new(
        dispatcher: Arc<dyn StepDispatcher>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            executions: Arc::new(ExecutionStore::default()),
            dispatcher,
            events,
            cancellations: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Registers a flow after full validation. Nothing is stored when any
    /// check fails.
    pub fn register(&self, definition: FlowDefinition) -> Result<(), FlowExecutionError> {
        definition.validate()?;

        let mut flows = self.flows.lock().expect("flow registry");
        if flows.contains_key(&definition.name) {
            return Err(FlowExecutionError::Duplicate {
                flow: definition.name,
            });
        }
        switchyard_event!(
            info,
            "switchyard::flow",
            "flow_registered",
            flow = definition.name.as_str(),
            steps = definition.steps.len(),
        );
        flows.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn flow(&self, name: &str) -> Result<Arc<FlowDefinition>, FlowExecutionError> {
        let flows = self.flows.lock().expect("flow registry");
        flows
            .get(name)
            .cloned()
            .ok_or_else(|| FlowExecutionError::FlowNotFound {
                flow: name.to_string(),
            })
    }

    pub fn list_flows(&self) -> Vec<Arc<FlowDefinition>> {
        let flows = self.flows.lock().expect("flow registry");
        let mut all: Vec<_> = flows.values().cloned().collect();
        all.sort_by(|lhs, rhs| lhs.name.cmp(&rhs.name));
        all
    }

    pub fn execution(&self, id: Uuid) -> Result<FlowExecution, FlowExecutionError> {
        self.executions
            .get(id)
            .ok_or(FlowExecutionError::ExecutionNotFound { execution: id })
    }

    pub fn list_executions(
        &self,
        flow: Option<&str>,
        status: Option<ExecutionStatus>,
    ) -> Vec<FlowExecution> {
        self.executions.list(flow, status)
    }

    /// Requests cooperative cancellation: in-flight steps finish, nothing new
    /// is admitted.
    pub fn cancel(&self, id: Uuid) -> Result<(), FlowExecutionError> {
        let cancellations = self.cancellations.lock().expect("cancellation registry");
        match cancellations.get(&id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => {
                // Already terminal executions accept cancel as a no-op.
                drop(cancellations);
                self.execution(id).map(|_| ())
            }
        }
    }

    /// Runs one execution to completion and returns its final snapshot.
    pub async fn run(
        &self,
        flow: &str,
        document: JsonValue,
    ) -> Result<FlowExecution, FlowExecutionError> {
        let definition = self.flow(flow)?;
        let execution = FlowExecution::new(
            &definition.name,
            definition.steps.iter().map(|step| step.name.clone()),
        );
        let id = execution.id;
        self.executions.insert(execution);
        self.run_execution(definition, id, document).await;
        self.execution(id)
    }

    /// Fires an execution in the background, returning its id immediately.
    pub fn start(
        self: &Arc<Self>,
        flow: &str,
        document: JsonValue,
    ) -> Result<Uuid, FlowExecutionError> {
        let definition = self.flow(flow)?;
        let execution = FlowExecution::new(
            &definition.name,
            definition.steps.iter().map(|step| step.name.clone()),
        );
        let id = execution.id;
        self.executions.insert(execution);

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_execution(definition, id, document).await;
        });
        Ok(id)
    }

    async fn run_execution(&self, definition: Arc<FlowDefinition>, id: Uuid, document: JsonValue) {
        let token = self.shutdown.child_token();
        {
            let mut cancellations = self.cancellations.lock().expect("cancellation registry");
            cancellations.insert(id, token.clone());
        }

        self.executions.update(id, |execution| {
            execution.status = ExecutionStatus::Running;
        });
        metrics().record_flow_started();
        switchyard_event!(
            info,
            "switchyard::flow",
            "execution_started",
            flow = definition.name.as_str(),
            execution = id,
        );

        let step_count = definition.steps.len();
        let fallback_targets = definition.fallback_targets();
        let dep_indices: Vec<Vec<usize>> = definition
            .steps
            .iter()
            .map(|step| {
                step.dependencies
                    .iter()
                    .filter_map(|dep| definition.step_index(dep))
                    .collect()
            })
            .collect();

        let gate = ParallelismGate::new(definition.config.parallelism);
        let mut statuses: Vec<StepStatus> = vec![StepStatus::Pending; step_count];
        let mut outputs: HashMap<usize, JsonValue> = HashMap::new();
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
        let mut flow_failed = false;
        let mut halted = false;
        let mut cancelled = false;

        loop {
            if token.is_cancelled() {
                cancelled = true;
            }

            // Cascade skips and admit every step whose dependencies are done.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for index in 0..step_count {
                    if statuses[index] != StepStatus::Pending || fallback_targets.contains(&index) {
                        continue;
                    }
                    if halted || cancelled {
                        statuses[index] = StepStatus::Cancelled;
                        self.finish_step(&definition, id, index, StepStatus::Cancelled, 0, None);
                        progressed = true;
                        continue;
                    }

                    let deps = &dep_indices[index];
                    if !deps.iter().all(|&dep| statuses[dep].is_terminal()) {
                        continue;
                    }
                    if deps.iter().any(|dep| !outputs.contains_key(dep)) {
                        statuses[index] = StepStatus::Skipped;
                        self.finish_step(&definition, id, index, StepStatus::Skipped, 0, None);
                        progressed = true;
                        continue;
                    }

                    let input = assemble_input(&definition, deps, &outputs, &document);
                    statuses[index] = StepStatus::Running;
                    self.executions.update(id, |execution| {
                        let name = &definition.steps[index].name;
                        if let Some(state) = execution.step_mut(name) {
                            state.status = StepStatus::Running;
                            state.started_at = Some(Utc::now());
                        }
                    });
                    join_set.spawn(execute_step(
                        Arc::clone(&self.dispatcher),
                        Arc::clone(&definition),
                        index,
                        input,
                        gate.clone(),
                        token.clone(),
                    ));
                    progressed = true;
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    tracing::error!(
                        target: "switchyard::flow",
                        event = "step_task_aborted",
                        flow = %definition.name,
                        error = %join_error,
                    );
                    flow_failed = true;
                    halted = true;
                    continue;
                }
            };

            let index = outcome.index;
            match outcome.resolution {
                StepResolution::Succeeded { output, attempt } => {
                    statuses[index] = StepStatus::Succeeded;
                    if let Some(output) = output {
                        outputs.insert(index, output);
                    }
                    self.finish_step(&definition, id, index, StepStatus::Succeeded, attempt, None);
                }
                StepResolution::Failed {
                    error,
                    attempt,
                    escalate,
                } => {
                    statuses[index] = StepStatus::Failed;
                    if escalate {
                        flow_failed = true;
                        halted = true;
                    }
                    self.finish_step(
                        &definition,
                        id,
                        index,
                        StepStatus::Failed,
                        attempt,
                        Some(error),
                    );
                }
                StepResolution::FallbackSucceeded {
                    output,
                    attempt,
                    fallback,
                    error,
                } => {
                    statuses[index] = StepStatus::Failed;
                    statuses[fallback] = StepStatus::Succeeded;
                    outputs.insert(index, output);
                    self.finish_step(
                        &definition,
                        id,
                        index,
                        StepStatus::Failed,
                        attempt,
                        Some(error),
                    );
                    self.finish_step(&definition, id, fallback, StepStatus::Succeeded, 1, None);
                }
                StepResolution::FallbackFailed {
                    error,
                    attempt,
                    fallback,
                    fallback_error,
                } => {
                    statuses[index] = StepStatus::Failed;
                    statuses[fallback] = StepStatus::Failed;
                    flow_failed = true;
                    halted = true;
                    self.finish_step(
                        &definition,
                        id,
                        index,
                        StepStatus::Failed,
                        attempt,
                        Some(error),
                    );
                    self.finish_step(
                        &definition,
                        id,
                        fallback,
                        StepStatus::Failed,
                        1,
                        Some(fallback_error),
                    );
                }
                StepResolution::Cancelled { attempt } => {
                    statuses[index] = StepStatus::Cancelled;
                    cancelled = true;
                    self.finish_step(&definition, id, index, StepStatus::Cancelled, attempt, None);
                }
            }
        }

        // Fallback steps that were never invoked.
        for index in 0..step_count {
            if fallback_targets.contains(&index) && statuses[index] == StepStatus::Pending {
                statuses[index] = StepStatus::Skipped;
                self.finish_step(&definition, id, index, StepStatus::Skipped, 0, None);
            }
        }

        let final_status = if flow_failed {
            ExecutionStatus::Failed
        } else if cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Succeeded
        };

        self.executions.update(id, |execution| {
            execution.status = final_status;
            execution.completed_at = Some(Utc::now());
        });
        match final_status {
            ExecutionStatus::Succeeded => metrics().record_flow_succeeded(),
            ExecutionStatus::Cancelled => metrics().record_flow_cancelled(),
            _ => metrics().record_flow_failed(),
        }
        switchyard_event!(
            info,
            "switchyard::flow",
            "execution_completed",
            flow = definition.name.as_str(),
            execution = id,
            status = final_status.as_str(),
        );
        self.events.publish(EngineEvent::FlowCompleted {
            flow: definition.name.clone(),
            execution: id,
            status: final_status,
        });

        let mut cancellations = self.cancellations.lock().expect("cancellation registry");
        cancellations.remove(&id);
    }

    fn finish_step(
        &self,
        definition: &FlowDefinition,
        id: Uuid,
        index: usize,
        status: StepStatus,
        attempt: u32,
        error: Option<String>,
    ) {
        let name = definition.steps[index].name.clone();
        let recorded_error = error.map(|reason| {
            StepExecutionError {
                step: name.clone(),
                attempt,
                reason,
            }
            .to_string()
        });

        self.executions.update(id, |execution| {
            if let Some(state) = execution.step_mut(&name) {
                state.status = status;
                state.attempt = attempt;
                state.completed_at = Some(Utc::now());
                state.error = recorded_error.clone();
            }
        });
        switchyard_event!(
            info,
            "switchyard::flow",
            "step_completed",
            flow = definition.name.as_str(),
            step = name.as_str(),
            kind = definition.steps[index].action.as_str(),
            status = status.as_str(),
            attempt = attempt,
        );
        self.events.publish(EngineEvent::StepCompleted {
            flow: definition.name.clone(),
            execution: id,
            step: name,
            status,
            attempt,
        });
    }
}

/// Input for a step: the trigger document for roots, a dependency's output
/// for single-parent steps, and a name-keyed object for joins.
fn assemble_input(
    definition: &FlowDefinition,
    deps: &[usize],
    outputs: &HashMap<usize, JsonValue>,
    document: &JsonValue,
) -> JsonValue {
    match deps {
        [] => document.clone(),
        [single] => outputs.get(single).cloned().unwrap_or(JsonValue::Null),
        many => {
            let mut joined = JsonMap::new();
            for &dep in many {
                joined.insert(
                    definition.steps[dep].name.clone(),
                    outputs.get(&dep).cloned().unwrap_or(JsonValue::Null),
                );
            }
            JsonValue::Object(joined)
        }
    }
}

struct StepOutcome {
    index: usize,
    resolution: StepResolution,
}

enum StepResolution {
    Succeeded {
        /// `None` means a condition gate evaluated false: the step is fine
        /// but its dependents must not run.
        output: Option<JsonValue>,
        attempt: u32,
    },
    Failed {
        error: String,
        attempt: u32,
        escalate: bool,
    },
    FallbackSucceeded {
        output: JsonValue,
        attempt: u32,
        fallback: usize,
        error: String,
    },
    FallbackFailed {
        error: String,
        attempt: u32,
        fallback: usize,
        fallback_error: String,
    },
    Cancelled {
        attempt: u32,
    },
}

async fn execute_step(
    dispatcher: Arc<dyn StepDispatcher>,
    definition: Arc<FlowDefinition>,
    index: usize,
    input: JsonValue,
    gate: ParallelismGate,
    token: CancellationToken,
) -> StepOutcome {
    let _permit = gate.acquire().await;
    let step = &definition.steps[index];

    let max_attempts = match step.on_error {
        OnError::Retry => definition.config.retry.max_retries.saturating_add(1),
        _ => 1,
    };

    let mut attempt = 0;
    let mut last_error = String::new();
    while attempt < max_attempts {
        if token.is_cancelled() {
            return StepOutcome {
                index,
                resolution: StepResolution::Cancelled { attempt },
            };
        }
        attempt += 1;

        match run_action(&dispatcher, &definition, step, input.clone()).await {
            Ok(output) => {
                return StepOutcome {
                    index,
                    resolution: StepResolution::Succeeded { output, attempt },
                }
            }
            Err(reason) => {
                last_error = reason;
                if attempt < max_attempts {
                    let delay = definition.config.retry.delay_for(attempt);
                    if sleep_with_shutdown(delay, &token).await {
                        return StepOutcome {
                            index,
                            resolution: StepResolution::Cancelled { attempt },
                        };
                    }
                }
            }
        }
    }

    let resolution = match &step.on_error {
        OnError::Continue => StepResolution::Failed {
            error: last_error,
            attempt,
            escalate: false,
        },
        OnError::Fallback { step: fallback } => match definition.step_index(fallback) {
            Some(fallback_index) => {
                let fallback_step = &definition.steps[fallback_index];
                match run_action(&dispatcher, &definition, fallback_step, input).await {
                    Ok(Some(output)) => StepResolution::FallbackSucceeded {
                        output,
                        attempt,
                        fallback: fallback_index,
                        error: last_error,
                    },
                    Ok(None) => StepResolution::FallbackFailed {
                        error: last_error,
                        attempt,
                        fallback: fallback_index,
                        fallback_error: "fallback condition gate closed".to_string(),
                    },
                    Err(fallback_error) => StepResolution::FallbackFailed {
                        error: last_error,
                        attempt,
                        fallback: fallback_index,
                        fallback_error,
                    },
                }
            }
            None => StepResolution::Failed {
                error: last_error,
                attempt,
                escalate: true,
            },
        },
        // `stop`, and `retry` once exhausted, both halt the flow.
        OnError::Stop | OnError::Retry => StepResolution::Failed {
            error: last_error,
            attempt,
            escalate: true,
        },
    };
    StepOutcome { index, resolution }
}

async fn run_action(
    dispatcher: &Arc<dyn StepDispatcher>,
    definition: &FlowDefinition,
    step: &FlowStep,
    input: JsonValue,
) -> Result<Option<JsonValue>, String> {
    let work = perform(dispatcher, &step.action, input);
    match definition.config.step_timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(format!("step exceeded its {limit:?} deadline")),
        },
        None => work.await,
    }
}

async fn perform(
    dispatcher: &Arc<dyn StepDispatcher>,
    action: &StepAction,
    input: JsonValue,
) -> Result<Option<JsonValue>, String> {
    match action {
        StepAction::EndpointCall { route } => dispatcher
            .call_route(route, input)
            .await
            .map(Some)
            .map_err(|fault| fault.to_string()),
        StepAction::Transform { transformation } => dispatcher
            .transform(transformation, input)
            .await
            .map(Some)
            .map_err(|fault| fault.to_string()),
        StepAction::Validate { transformation } => {
            dispatcher
                .transform(transformation, input.clone())
                .await
                .map_err(|fault| fault.to_string())?;
            Ok(Some(input))
        }
        StepAction::Enrich { transformation } => {
            let addition = dispatcher
                .transform(transformation, input.clone())
                .await
                .map_err(|fault| fault.to_string())?;
            Ok(Some(merge_documents(input, addition)))
        }
        StepAction::Split => {
            if input.is_array() {
                Ok(Some(input))
            } else {
                Err("split step requires an array document".to_string())
            }
        }
        StepAction::Join => Ok(Some(input)),
        StepAction::Condition { field, equals } => {
            let matched = resolve_path(&input, field).map_or(false, |value| value == equals);
            if matched {
                Ok(Some(input))
            } else {
                Ok(None)
            }
        }
    }
}

fn merge_documents(base: JsonValue, addition: JsonValue) -> JsonValue {
    match (base, addition) {
        (JsonValue::Object(mut base), JsonValue::Object(addition)) => {
            for (key, value) in addition {
                base.insert(key, value);
            }
            JsonValue::Object(base)
        }
        (_, addition) => addition,
    }
}
