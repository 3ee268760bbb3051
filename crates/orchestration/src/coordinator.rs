//! Task lifecycle bridge: assignment, state updates, release.
//!
//! All task mutations go through here. Each one persists the task record
//! first and then emits a mailbox notification: assignments go to the
//! assignee, verification summaries and releases go to the supervisor.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use fleet_common::config::FleetConfig;
use fleet_common::envelope::{Envelope, MessageType};
use fleet_common::task::{OwnerRecord, Task, TaskState, TransitionError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::journal::Journal;
use crate::mailbox::{self, TransportError};
use crate::store::{StoreError, TaskStore};

pub const DEFAULT_ACCEPTANCE_CRITERIA: &[&str] = &[
    "Deliverable satisfies the stated intent",
    "No regressions in existing behaviour",
];
pub const DEFAULT_EVIDENCE_REQUIRED: &[&str] = &[
    "Summary of the change",
    "Verification output (tests, logs or screenshots)",
];

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("task '{0}' not found")]
    TaskNotFound(String),
    #[error("task '{task_id}': {source}")]
    InvalidTransition {
        task_id: String,
        #[source]
        source: TransitionError,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::TaskNotFound(_) => "E_TASK_NOT_FOUND",
            CoordinatorError::InvalidTransition { .. } => "E_INVALID_TRANSITION",
            CoordinatorError::InvalidRequest(_) => "E_INVALID_REQUEST",
            CoordinatorError::Store(err) => err.code(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub task_id: String,
    pub owner: String,
    pub workflow_id: Option<String>,
    pub message_id: String,
    /// False when the task was assigned but the mailbox drop failed.
    pub notified: bool,
}

/// Fields accepted by [`Coordinator::update`]; everything but `task_id` is
/// optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskUpdate {
    pub task_id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub evidence_required: Option<Vec<String>>,
    #[serde(default)]
    pub evidence: Option<Value>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl TaskUpdate {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn evidence(mut self, evidence: Value) -> Self {
        self.evidence = Some(evidence);
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

pub struct Coordinator {
    store: TaskStore,
    mailbox_root: PathBuf,
    identity: String,
    supervisor: String,
    journal: Option<Arc<Journal>>,
    assign_guard: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        store: TaskStore,
        mailbox_root: impl Into<PathBuf>,
        identity: impl Into<String>,
        supervisor: impl Into<String>,
    ) -> Self {
        Self {
            store,
            mailbox_root: mailbox_root.into(),
            identity: identity.into(),
            supervisor: supervisor.into(),
            journal: None,
            assign_guard: Mutex::new(()),
        }
    }

    pub fn from_config(config: &FleetConfig) -> Result<Self, CoordinatorError> {
        let store = TaskStore::open(&config.task_store_root)?;
        Ok(Self::new(
            store,
            &config.mailbox_root,
            &config.orchestrator,
            &config.supervisor,
        ))
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Insert a new queued task.
    pub fn seed(&self, task: Task) -> Result<(), CoordinatorError> {
        if !task.is_assignable() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "seeded task '{}' must be new or queued without an owner",
                task.id
            )));
        }
        self.store.insert(&task)?;
        self.journal_event(
            "SEED",
            &task.id,
            &self.identity,
            "-",
            json!({"repo": task.repo, "priority": task.priority}),
        );
        info!(task_id = %task.id, repo = %task.repo, "Task seeded");
        Ok(())
    }

    /// Assign every queued, unowned task to `targets` round-robin.
    ///
    /// Candidates are ordered by priority (highest first), then id. Duplicate
    /// targets are collapsed so each worker gets one slot in the rotation.
    pub fn assign_request(
        &self,
        targets: &[String],
        workflow_id: Option<&str>,
    ) -> Result<Vec<Assignment>, CoordinatorError> {
        let mut rotation: Vec<&str> = Vec::with_capacity(targets.len());
        for target in targets.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !rotation.contains(&target) {
                rotation.push(target);
            }
        }
        if rotation.is_empty() {
            return Err(CoordinatorError::InvalidRequest(
                "assign_request needs at least one target".into(),
            ));
        }

        let _serial = self.assign_guard.lock().unwrap_or_else(|e| e.into_inner());

        let mut candidates: Vec<Task> = self
            .store
            .list()?
            .into_iter()
            .filter(Task::is_assignable)
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let mut assignments = Vec::with_capacity(candidates.len());
        let mut slot = 0usize;
        for candidate in candidates {
            let owner = rotation[slot % rotation.len()];
            let now = Utc::now();

            let outcome = self.store.modify(&candidate.id, |task| {
                // Re-checked under the record lock: another writer may have
                // taken it since listing.
                if !task.is_assignable() {
                    return Err(());
                }
                task.owner = Some(owner.to_string());
                task.state = TaskState::Assigned;
                task.assigned_at = Some(now);
                if let Some(workflow_id) = workflow_id {
                    task.workflow_id = Some(workflow_id.to_string());
                }
                if task.acceptance_criteria.is_empty() {
                    task.acceptance_criteria =
                        DEFAULT_ACCEPTANCE_CRITERIA.iter().map(|s| s.to_string()).collect();
                }
                if task.evidence_required.is_empty() {
                    task.evidence_required =
                        DEFAULT_EVIDENCE_REQUIRED.iter().map(|s| s.to_string()).collect();
                }
                task.owner_history.push(OwnerRecord {
                    owner: owner.to_string(),
                    assigned_at: now,
                    workflow_id: task.workflow_id.clone(),
                });
                Ok(task.clone())
            })?;

            let Some(Ok(task)) = outcome else {
                debug!(task_id = %candidate.id, "Task no longer assignable; skipped");
                continue;
            };
            slot += 1;

            let envelope = Envelope::new(
                MessageType::Task,
                self.identity.clone(),
                owner,
                assignment_payload(&task),
            );
            let notified = self.notify(&envelope);
            self.journal_event(
                "ASSIGN",
                &task.id,
                &self.identity,
                owner,
                json!({
                    "workflow_id": task.workflow_id,
                    "attempt": task.attempt,
                    "notified": notified,
                }),
            );
            info!(task_id = %task.id, %owner, notified, "Task assigned");

            assignments.push(Assignment {
                task_id: task.id,
                owner: owner.to_string(),
                workflow_id: task.workflow_id,
                message_id: envelope.id,
                notified,
            });
        }

        Ok(assignments)
    }

    /// Apply a state/criteria/evidence update and send a verification summary
    /// to the supervisor.
    pub fn update(&self, update: TaskUpdate) -> Result<Task, CoordinatorError> {
        let task_id = update.task_id.trim().to_string();
        if task_id.is_empty() {
            return Err(CoordinatorError::InvalidRequest("task_id is required".into()));
        }
        let target = update
            .state
            .as_deref()
            .map(str::parse::<TaskState>)
            .transpose()
            .map_err(|source| CoordinatorError::InvalidTransition {
                task_id: task_id.clone(),
                source,
            })?;
        let now = Utc::now();
        let summary = update.summary.clone();

        let outcome = self.store.modify(&task_id, |task| {
            if let Some(to) = target {
                task.state.check_update(to)?;
                apply_state(task, to, summary.as_deref(), now);
            }
            if let Some(criteria) = update.acceptance_criteria {
                task.acceptance_criteria = criteria;
            }
            if let Some(required) = update.evidence_required {
                task.evidence_required = required;
            }
            if let Some(evidence) = update.evidence {
                task.evidence.extend(stamp_evidence(evidence, now));
            }
            Ok::<Task, TransitionError>(task.clone())
        })?;

        let task = match outcome {
            None => return Err(CoordinatorError::TaskNotFound(task_id)),
            Some(Err(source)) => {
                return Err(CoordinatorError::InvalidTransition { task_id, source });
            }
            Some(Ok(task)) => task,
        };

        let envelope = Envelope::new(
            MessageType::Verify,
            self.identity.clone(),
            self.supervisor.clone(),
            verification_payload(&task, summary.as_deref()),
        );
        let notified = self.notify(&envelope);
        self.journal_event(
            "UPDATE",
            &task.id,
            task.owner.as_deref().unwrap_or(&self.identity),
            &self.supervisor,
            json!({
                "state": task.state,
                "summary": summary,
                "evidence": task.evidence.len(),
                "notified": notified,
            }),
        );
        info!(task_id = %task.id, state = %task.state, "Task updated");
        Ok(task)
    }

    /// Return an assigned or running task to the queue.
    pub fn release(&self, task_id: &str, reason: &str) -> Result<Task, CoordinatorError> {
        let mut previous_owner = None;
        let outcome = self.store.modify(task_id, |task| {
            if !task.state.can_release() {
                return Err(TransitionError::NotAllowed {
                    from: task.state,
                    to: TaskState::Queued,
                });
            }
            previous_owner = task.owner.take();
            task.state = TaskState::Queued;
            task.assigned_at = None;
            task.started_at = None;
            task.blocked_reason = None;
            task.attempt += 1;
            Ok(task.clone())
        })?;

        let task = match outcome {
            None => return Err(CoordinatorError::TaskNotFound(task_id.to_string())),
            Some(Err(source)) => {
                return Err(CoordinatorError::InvalidTransition {
                    task_id: task_id.to_string(),
                    source,
                })
            }
            Some(Ok(task)) => task,
        };

        let envelope = Envelope::new(
            MessageType::Sync,
            self.identity.clone(),
            self.supervisor.clone(),
            json!({
                "action": "released",
                "task_id": task.id,
                "released_from": previous_owner,
                "reason": reason,
                "attempt": task.attempt,
            }),
        );
        let notified = self.notify(&envelope);
        self.journal_event(
            "RELEASE",
            &task.id,
            previous_owner.as_deref().unwrap_or("-"),
            &self.supervisor,
            json!({"reason": reason, "attempt": task.attempt, "notified": notified}),
        );
        warn!(task_id = %task.id, owner = ?previous_owner, %reason, "Task released back to queue");
        Ok(task)
    }

    /// Release every releasable task owned by `agent`. Per-task failures are
    /// logged and skipped.
    pub fn release_owned_by(
        &self,
        agent: &str,
        reason: &str,
    ) -> Result<Vec<String>, CoordinatorError> {
        let owned: Vec<Task> = self
            .store
            .list()?
            .into_iter()
            .filter(|task| task.owner.as_deref() == Some(agent) && task.state.can_release())
            .collect();

        let mut released = Vec::new();
        for task in owned {
            match self.release(&task.id, reason) {
                Ok(task) => released.push(task.id),
                Err(err) => warn!(
                    task_id = %task.id,
                    %agent,
                    code = err.code(),
                    "Release failed: {}",
                    err
                ),
            }
        }
        Ok(released)
    }

    fn notify(&self, envelope: &Envelope) -> bool {
        match mailbox::post(&self.mailbox_root, envelope) {
            Ok(_) => true,
            Err(err) => {
                log_transport_failure(envelope, &err);
                false
            }
        }
    }

    fn journal_event(&self, event: &str, id: &str, from: &str, to: &str, meta: Value) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(event, id, from, to, meta) {
                warn!(event, id, "Failed to append journal entry: {}", err);
            }
        }
    }
}

fn log_transport_failure(envelope: &Envelope, err: &TransportError) {
    warn!(
        msg_id = %envelope.id,
        to = %envelope.to,
        msg_type = %envelope.kind,
        code = err.code(),
        "Mailbox notification failed: {}",
        err
    );
}

fn apply_state(task: &mut Task, to: TaskState, summary: Option<&str>, now: DateTime<Utc>) {
    if to.is_running() && task.started_at.is_none() {
        task.started_at = Some(now);
    }
    if to.is_terminal() && task.completed_at.is_none() {
        task.completed_at = Some(now);
    }
    if to == TaskState::Blocked {
        task.blocked_reason = Some(summary.unwrap_or("blocked").to_string());
    } else if task.state == TaskState::Blocked {
        task.blocked_reason = None;
    }
    task.state = to;
}

/// Accepts a list or a single entry; objects without `ts`/`timestamp` get
/// one, scalars are wrapped as `{value, ts}`.
fn stamp_evidence(raw: Value, now: DateTime<Utc>) -> Vec<Value> {
    let stamp = Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true));
    let items = match raw {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(mut map) => {
                if !map.contains_key("ts") && !map.contains_key("timestamp") {
                    map.insert("ts".into(), stamp.clone());
                }
                Value::Object(map)
            }
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map.insert("ts".into(), stamp.clone());
                Value::Object(map)
            }
        })
        .collect()
}

fn assignment_payload(task: &Task) -> Value {
    json!({
        "task_id": task.id,
        "repo": task.repo,
        "intent": task.intent,
        "acceptance_criteria": task.acceptance_criteria,
        "evidence_required": task.evidence_required,
        "priority": task.priority,
        "labels": task.labels,
        "workflow_id": task.workflow_id,
        "attempt": task.attempt,
    })
}

fn verification_payload(task: &Task, summary: Option<&str>) -> Value {
    json!({
        "task_id": task.id,
        "repo": task.repo,
        "state": task.state,
        "owner": task.owner,
        "summary": summary,
        "acceptance_criteria": task.acceptance_criteria,
        "evidence_required": task.evidence_required,
        "evidence": task.evidence,
        "completed_at": task.completed_at,
    })
}
