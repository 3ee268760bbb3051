//! Dependency-graph workflows.
//!
//! A [`Workflow`] is a set of [`WorkflowStep`]s joined by dependency edges.
//! Each step is dispatched to one agent and completes when a matching
//! response envelope arrives in the orchestrator mailbox. Graphs are checked
//! for duplicate ids, dangling dependencies and cycles before they run.

mod builder;
mod engine;
pub mod template;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_common::config::is_valid_agent_name;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use builder::{OrchestrationStrategy, WorkflowBuilder};
pub use engine::{load_run, submit, WorkflowEngine, QUEUE_DIR, WORKFLOWS_DIR};

/// Run state and queue files are named after the workflow id.
pub(crate) fn check_id(id: &str) -> Result<(), WorkflowError> {
    if is_valid_agent_name(id) {
        Ok(())
    } else {
        Err(WorkflowError::InvalidId(id.to_string()))
    }
}

pub const DEFAULT_RESPONSE_TYPE: &str = "response";
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow id '{0}' is not a valid file name")]
    InvalidId(String),
    #[error("workflow '{0}' has no steps")]
    Empty(String),
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle through steps: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("workflow state I/O on {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Persist { .. } => "E_WORKFLOW_PERSIST",
            _ => "E_WORKFLOW_INVALID",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub agent_target: String,
    pub dispatch_template: String,
    #[serde(default = "default_response_type")]
    pub expected_response_type: String,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_count: u32,
}

fn default_response_type() -> String {
    DEFAULT_RESPONSE_TYPE.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

impl WorkflowStep {
    pub fn new(
        id: impl Into<String>,
        agent_target: impl Into<String>,
        dispatch_template: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_target: agent_target.into(),
            dispatch_template: dispatch_template.into(),
            expected_response_type: default_response_type(),
            dependencies: BTreeSet::new(),
            timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            max_retries: 0,
            retry_count: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn expect(mut self, response_type: impl Into<String>) -> Self {
        self.expected_response_type = response_type.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Values available to step templates as `{{key}}`.
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub steps: Vec<WorkflowStep>,
}

impl Workflow {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Check the graph and return its steps in a topological order.
    pub fn validate(&self) -> Result<Vec<String>, WorkflowError> {
        check_id(&self.id)?;
        if self.steps.is_empty() {
            return Err(WorkflowError::Empty(self.id.clone()));
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for step in &self.steps {
            if in_degree.insert(step.id.as_str(), 0).is_some() {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
        }

        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dependency in &step.dependencies {
                if !in_degree.contains_key(dependency.as_str()) {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
                outgoing.entry(dependency.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = self
            .steps
            .iter()
            .map(|step| step.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut ordered = Vec::with_capacity(self.steps.len());
        while let Some(next) = queue.pop_front() {
            ordered.push(next.to_string());
            for child in outgoing.get(next).into_iter().flatten() {
                if let Some(count) = in_degree.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if ordered.len() != self.steps.len() {
            let mut stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            stuck.sort();
            return Err(WorkflowError::Cycle(stuck));
        }
        Ok(ordered)
    }

    /// Every step that depends on `id`, directly or transitively.
    pub fn dependents_of(&self, id: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for step in &self.steps {
                if step.dependencies.contains(&current) && found.insert(step.id.clone()) {
                    frontier.push(step.id.clone());
                }
            }
        }
        found
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Dispatched,
    AwaitingResponse,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub status: StepStatus,
    /// Id of the most recent dispatch; responses may quote it as their
    /// `causation_id`.
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StepState {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            request_id: None,
            dispatched_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Persisted state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub workflow: Workflow,
    pub status: RunStatus,
    pub steps: BTreeMap<String, StepState>,
    /// Structured response data keyed by step id.
    pub workflow_data: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(workflow: Workflow) -> Self {
        let now = Utc::now();
        let steps = workflow
            .steps
            .iter()
            .map(|step| (step.id.clone(), StepState::pending()))
            .collect();
        Self {
            workflow,
            status: RunStatus::Running,
            steps,
            workflow_data: Map::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.steps.get(id).map(|state| state.status)
    }

    /// Pending and every dependency completed.
    pub fn is_ready(&self, step: &WorkflowStep) -> bool {
        self.status_of(&step.id) == Some(StepStatus::Pending)
            && step
                .dependencies
                .iter()
                .all(|dep| self.status_of(dep) == Some(StepStatus::Completed))
    }

    pub fn is_finished(&self) -> bool {
        self.steps.values().all(|state| state.status.is_finished())
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|state| state.status == status).count()
    }
}
