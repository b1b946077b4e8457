pub mod execution;
pub mod orchestrator;

use crate::retry::RetryPolicy;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// A named DAG of steps. Dependencies are by step name; the graph is
/// validated at registration and a cyclic definition is refused outright.
#[derive(Clone, Debug)]
pub struct FlowDefinition {
    pub name: String,
    pub steps: Vec<FlowStep>,
    pub config: FlowConfiguration,
}

#[derive(Clone, Debug)]
pub struct FlowStep {
    pub name: String,
    pub action: StepAction,
    pub dependencies: Vec<String>,
    pub on_error: OnError,
}

#[derive(Clone, Debug)]
pub enum StepAction {
    /// Route the working document through the named route.
    EndpointCall { route: String },
    /// Replace the working document with the transformation output.
    Transform { transformation: String },
    /// Run the transformation for its schema checks; the document is unchanged.
    Validate { transformation: String },
    /// Merge the transformation output into the working document.
    Enrich { transformation: String },
    /// Assert the working document is an array before fanning out.
    Split,
    /// Combine the outputs of all dependencies.
    Join,
    /// Gate the branch: dependents run only when the field matches.
    Condition { field: String, equals: JsonValue },
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::EndpointCall { .. } => "endpoint_call",
            StepAction::Transform { .. } => "transformation",
            StepAction::Validate { .. } => "validation",
            StepAction::Enrich { .. } => "enrichment",
            StepAction::Split => "split",
            StepAction::Join => "join",
            StepAction::Condition { .. } => "condition",
        }
    }
}

/// What the orchestrator does when a step attempt fails.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OnError {
    #[default]
    Stop,
    Continue,
    Retry,
    Fallback {
        step: String,
    },
}

impl OnError {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnError::Stop => "stop",
            OnError::Continue => "continue",
            OnError::Retry => "retry",
            OnError::Fallback { .. } => "fallback",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FlowConfiguration {
    /// Upper bound on concurrently running steps within one execution.
    pub parallelism: Option<usize>,
    /// Per-step deadline, applied to every attempt.
    pub step_timeout: Option<Duration>,
    /// Retry policy used by steps with `on_error = retry`.
    pub retry: RetryPolicy,
}

#[derive(Debug, Error)]
#[error("flow `{flow}` has a dependency cycle through: {}", remaining.join(", "))]
pub struct FlowCycleError {
    pub flow: String,
    pub remaining: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FlowValidationError {
    #[error(transparent)]
    Cycle(#[from] FlowCycleError),
    #[error("flow `{flow}` declares no steps")]
    Empty { flow: String },
    #[error("flow `{flow}` declares step `{step}` more than once")]
    DuplicateStep { flow: String, step: String },
    #[error("flow `{flow}` step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency {
        flow: String,
        step: String,
        dependency: String,
    },
    #[error("flow `{flow}` step `{step}` falls back to unknown step `{fallback}`")]
    UnknownFallback {
        flow: String,
        step: String,
        fallback: String,
    },
    #[error("flow `{flow}` step `{step}` falls back to itself")]
    SelfFallback { flow: String, step: String },
    #[error(
        "flow `{flow}` step `{step}` depends on `{dependency}`, which only runs as a fallback"
    )]
    DependencyOnFallback {
        flow: String,
        step: String,
        dependency: String,
    },
}

impl FlowDefinition {
    /// Full registration-time validation. Nothing is accepted partially: any
    /// error leaves the registry untouched.
    pub fn validate(&self) -> Result<(), FlowValidationError> {
        if self.steps.is_empty() {
            return Err(FlowValidationError::Empty {
                flow: self.name.clone(),
            });
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(FlowValidationError::DuplicateStep {
                    flow: self.name.clone(),
                    step: step.name.clone(),
                });
            }
        }

        for step in &self.steps {
            for dependency in &step.dependencies {
                if !names.contains(dependency.as_str()) {
                    return Err(FlowValidationError::UnknownDependency {
                        flow: self.name.clone(),
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if let OnError::Fallback { step: fallback } = &step.on_error {
                if fallback == &step.name {
                    return Err(FlowValidationError::SelfFallback {
                        flow: self.name.clone(),
                        step: step.name.clone(),
                    });
                }
                if !names.contains(fallback.as_str()) {
                    return Err(FlowValidationError::UnknownFallback {
                        flow: self.name.clone(),
                        step: step.name.clone(),
                        fallback: fallback.clone(),
                    });
                }
            }
        }

        let fallback_names: HashSet<&str> = self
            .steps
            .iter()
            .filter_map(|step| match &step.on_error {
                OnError::Fallback { step: fallback } => Some(fallback.as_str()),
                _ => None,
            })
            .collect();
        for step in &self.steps {
            for dependency in &step.dependencies {
                if fallback_names.contains(dependency.as_str()) {
                    return Err(FlowValidationError::DependencyOnFallback {
                        flow: self.name.clone(),
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        self.topological_order()?;
        Ok(())
    }

    /// Stable Kahn ordering: among steps whose dependencies are satisfied,
    /// declaration order decides. A cycle reports every step still stuck in it.
    pub fn topological_order(&self) -> Result<Vec<usize>, FlowCycleError> {
        let index_of: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| (step.name.as_str(), index))
            .collect();

        let mut remaining_deps: Vec<usize> = self
            .steps
            .iter()
            .map(|step| step.dependencies.len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (index, step) in self.steps.iter().enumerate() {
            for dependency in &step.dependencies {
                if let Some(&dep_index) = index_of.get(dependency.as_str()) {
                    dependents[dep_index].push(index);
                }
            }
        }

        let mut order = Vec::with_capacity(self.steps.len());
        let mut placed = vec![false; self.steps.len()];
        while order.len() < self.steps.len() {
            let next = (0..self.steps.len())
                .find(|&index| !placed[index] && remaining_deps[index] == 0);
            let Some(next) = next else {
                let remaining = self
                    .steps
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !placed[*index])
                    .map(|(_, step)| step.name.clone())
                    .collect();
                return Err(FlowCycleError {
                    flow: self.name.clone(),
                    remaining,
                });
            };
            placed[next] = true;
            order.push(next);
            for &dependent in &dependents[next] {
                remaining_deps[dependent] -= 1;
            }
        }
        Ok(order)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name == name)
    }

    /// Steps that only run when invoked as a fallback target.
    pub fn fallback_targets(&self) -> HashSet<usize> {
        self.steps
            .iter()
            .filter_map(|step| match &step.on_error {
                OnError::Fallback { step: fallback } => self.step_index(fallback),
                _ => None,
            })
            .collect()
    }

    pub fn referenced_routes(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|step| match &step.action {
                StepAction::EndpointCall { route } => Some(route.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn referenced_transformations(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter_map(|step| match &step.action {
                StepAction::Transform { transformation }
                | StepAction::Validate { transformation }
                | StepAction::Enrich { transformation } => Some(transformation.as_str()),
                _ => None,
            })
            .collect()
    }
}
