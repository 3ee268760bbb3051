use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Queued,
    Assigned,
    InProgress,
    Executing,
    Blocked,
    Done,
    Completed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("unknown task state '{0}'")]
    UnknownState(String),
    #[error("transition {from} -> {to} is not allowed")]
    NotAllowed { from: TaskState, to: TaskState },
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Queued => "queued",
            TaskState::Assigned => "assigned",
            TaskState::InProgress => "in_progress",
            TaskState::Executing => "executing",
            TaskState::Blocked => "blocked",
            TaskState::Done => "done",
            TaskState::Completed => "completed",
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, TaskState::New | TaskState::Queued)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::InProgress | TaskState::Executing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Completed)
    }

    /// States in which a task may carry an owner.
    pub fn allows_owner(&self) -> bool {
        !self.is_queued()
    }

    /// Transitions reachable through a state update. Leaving the queue only
    /// happens through assignment and returning to it only through release,
    /// so neither appears here.
    pub fn update_targets(&self) -> &'static [TaskState] {
        use TaskState::*;
        match self {
            New | Queued => &[],
            Assigned => &[InProgress, Executing, Blocked, Done, Completed],
            InProgress | Executing => &[InProgress, Executing, Blocked, Done, Completed],
            Blocked => &[InProgress, Executing, Done, Completed],
            Done | Completed => &[],
        }
    }

    /// Check an update transition. Re-asserting the current state is a no-op
    /// and always accepted.
    pub fn check_update(self, to: TaskState) -> Result<(), TransitionError> {
        if self == to || self.update_targets().contains(&to) {
            Ok(())
        } else {
            Err(TransitionError::NotAllowed { from: self, to })
        }
    }

    pub fn can_release(&self) -> bool {
        matches!(
            self,
            TaskState::Assigned | TaskState::InProgress | TaskState::Executing | TaskState::Blocked
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = TransitionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(TaskState::New),
            "queued" => Ok(TaskState::Queued),
            "assigned" => Ok(TaskState::Assigned),
            "in_progress" | "in-progress" => Ok(TaskState::InProgress),
            "executing" => Ok(TaskState::Executing),
            "blocked" => Ok(TaskState::Blocked),
            "done" => Ok(TaskState::Done),
            "completed" => Ok(TaskState::Completed),
            other => Err(TransitionError::UnknownState(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OwnerRecord {
    pub owner: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

/// A unit of work tracked by the task store, one JSON file per task.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub repo: String,
    #[serde(default)]
    pub intent: String,
    pub state: TaskState,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub evidence_required: Vec<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_history: Vec<OwnerRecord>,
    #[serde(default)]
    pub evidence: Vec<Value>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub attempt: u32,
}

impl Task {
    pub fn queued(
        id: impl Into<String>,
        repo: impl Into<String>,
        intent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            repo: repo.into(),
            intent: intent.into(),
            state: TaskState::Queued,
            owner: None,
            acceptance_criteria: Vec::new(),
            evidence_required: Vec::new(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            owner_history: Vec::new(),
            evidence: Vec::new(),
            priority: 0,
            labels: Vec::new(),
            blocked_reason: None,
            workflow_id: None,
            attempt: 0,
        }
    }

    pub fn is_assignable(&self) -> bool {
        self.state.is_queued() && self.owner.is_none()
    }

    /// `owner != null` implies the state admits an owner.
    pub fn owner_invariant_holds(&self) -> bool {
        self.owner.is_none() || self.state.allows_owner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_state_aliases() {
        assert_eq!("in-progress".parse::<TaskState>().unwrap(), TaskState::InProgress);
        assert_eq!(" DONE ".parse::<TaskState>().unwrap(), TaskState::Done);
        assert!(matches!(
            "archived".parse::<TaskState>(),
            Err(TransitionError::UnknownState(_))
        ));
    }

    #[test]
    fn update_table_blocks_leaving_terminal_states() {
        assert!(TaskState::Done.check_update(TaskState::InProgress).is_err());
        assert!(TaskState::Completed.check_update(TaskState::Completed).is_ok());
        assert!(TaskState::Queued.check_update(TaskState::Done).is_err());
        assert!(TaskState::Assigned.check_update(TaskState::Done).is_ok());
        assert!(TaskState::Blocked.check_update(TaskState::Executing).is_ok());
        assert_eq!(
            TaskState::Blocked.check_update(TaskState::Assigned),
            Err(TransitionError::NotAllowed {
                from: TaskState::Blocked,
                to: TaskState::Assigned
            })
        );
    }

    #[test]
    fn seeded_task_deserializes_with_defaults() {
        let task: Task =
            serde_json::from_str(r#"{"id":"T1","repo":"r","state":"queued"}"#).unwrap();
        assert!(task.is_assignable());
        assert!(task.owner_history.is_empty());
        assert_eq!(task.attempt, 0);
        assert!(task.owner_invariant_holds());
    }
}
