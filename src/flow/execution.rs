use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Lifecycle of one flow run: `pending -> running -> {succeeded|failed|cancelled}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Per-step bookkeeping inside an execution snapshot.
#[derive(Clone, Debug)]
pub struct StepState {
    pub step: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepState {
    pub fn pending(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            status: StepStatus::Pending,
            attempt: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// One run of a flow. Mutated only by the orchestrator; everyone else sees
/// cloned snapshots.
#[derive(Clone, Debug)]
pub struct FlowExecution {
    pub id: Uuid,
    pub flow: String,
    pub status: ExecutionStatus,
    pub steps: Vec<StepState>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowExecution {
    pub fn new(flow: impl Into<String>, step_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow: flow.into(),
            status: ExecutionStatus::Pending,
            steps: step_names.into_iter().map(StepState::pending).collect(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|state| state.step == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|state| state.step == name)
    }
}

/// In-memory index of executions, newest first. Retention is a collaborator
/// concern; the store only grows within one process lifetime.
#[derive(Default)]
pub struct ExecutionStore {
    entries: Mutex<HashMap<Uuid, FlowExecution>>,
}

impl ExecutionStore {
    pub fn insert(&self, execution: FlowExecution) {
        let mut entries = self.entries.lock().expect("execution store");
        entries.insert(execution.id, execution);
    }

    pub fn update(&self, id: Uuid, apply: impl FnOnce(&mut FlowExecution)) {
        let mut entries = self.entries.lock().expect("execution store");
        if let Some(execution) = entries.get_mut(&id) {
            apply(execution);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<FlowExecution> {
        let entries = self.entries.lock().expect("execution store");
        entries.get(&id).cloned()
    }

    pub fn list(&self, flow: Option<&str>, status: Option<ExecutionStatus>) -> Vec<FlowExecution> {
        let entries = self.entries.lock().expect("execution store");
        let mut executions: Vec<FlowExecution> = entries
            .values()
            .filter(|execution| flow.map_or(true, |flow| execution.flow == flow))
            .filter(|execution| status.map_or(true, |status| execution.status == status))
            .cloned()
            .collect();
        executions.sort_by(|lhs, rhs| rhs.started_at.cmp(&lhs.started_at));
        executions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_execution_starts_pending_with_pending_steps() {
        let execution = FlowExecution::new("f", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution
            .steps
            .iter()
            .all(|state| state.status == StepStatus::Pending && state.attempt == 0));
    }

    #[test]
    fn store_filters_by_flow_and_status() {
        let store = ExecutionStore::default();
        let mut done = FlowExecution::new("orders", vec!["a".to_string()]);
        done.status = ExecutionStatus::Succeeded;
        let running = FlowExecution::new("orders", vec!["a".to_string()]);
        let other = FlowExecution::new("billing", vec!["a".to_string()]);
        store.insert(done.clone());
        store.insert(running);
        store.insert(other);

        assert_eq!(store.list(Some("orders"), None).len(), 2);
        let succeeded = store.list(Some("orders"), Some(ExecutionStatus::Succeeded));
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].id, done.id);
        assert_eq!(store.list(None, None).len(), 3);
    }
}
