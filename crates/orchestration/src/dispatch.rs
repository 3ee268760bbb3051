//! Delivery boundary towards workers.
//!
//! The coordination kernel never talks to a worker directly: it hands a
//! [`DispatchRequest`] to a [`Dispatcher`] and only looks at the success or
//! failure of the call. Actual actuation (UI automation, terminals, ...) lives
//! outside this crate.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::config::{is_valid_agent_name, DispatchMode, FleetConfig};
use fleet_common::fs::write_json_atomic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    Urgent,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Normal => "normal",
            Urgency::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    pub agent: String,
    pub content: String,
    pub urgency: Urgency,
    /// Ask the actuator to open a fresh interaction session before delivering.
    #[serde(default)]
    pub fresh_session: bool,
}

impl DispatchRequest {
    pub fn new(agent: impl Into<String>, content: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            agent: agent.into(),
            content: content.into(),
            urgency,
            fresh_session: false,
        }
    }

    pub fn with_fresh_session(mut self, fresh: bool) -> Self {
        self.fresh_session = fresh;
        self
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to drop request for {agent}: {source}")]
    Io {
        agent: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dispatch hook for {agent} exited with {status}: {stderr}")]
    HookFailed {
        agent: String,
        status: String,
        stderr: String,
    },
    #[error("dispatch hook for {agent} timed out after {secs}s")]
    Timeout { agent: String, secs: u64 },
    #[error("dispatch to {agent} rejected: {reason}")]
    Rejected { agent: String, reason: String },
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Timeout { .. } => "E_DISPATCH_TIMEOUT",
            DispatchError::Rejected { .. } => "E_DISPATCH_REJECTED",
            _ => "E_DISPATCH_FAILED",
        }
    }

    /// A rejected request will fail the same way every time.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DispatchError::Rejected { .. })
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError>;
}

#[derive(Serialize)]
struct DroppedRequest<'a> {
    id: String,
    created_at: DateTime<Utc>,
    #[serde(flatten)]
    request: &'a DispatchRequest,
}

/// Writes each request as a JSON file under `<root>/<agent>/` for an
/// external actuator to pick up.
pub struct FileDropDispatcher {
    root: PathBuf,
}

impl FileDropDispatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn agent_dir(&self, agent: &str) -> PathBuf {
        self.root.join(agent)
    }
}

#[async_trait]
impl Dispatcher for FileDropDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        if !is_valid_agent_name(&request.agent) {
            return Err(DispatchError::Rejected {
                agent: request.agent.clone(),
                reason: "agent name is not a valid directory name".to_string(),
            });
        }
        let created_at = Utc::now();
        let id = Uuid::new_v4().to_string();
        let path = self.agent_dir(&request.agent).join(format!(
            "{}Z_{}_{}.json",
            created_at.format("%Y%m%dT%H%M%S%.6f"),
            request.urgency.as_str(),
            id
        ));
        let record = DroppedRequest {
            id,
            created_at,
            request: &request,
        };

        write_json_atomic(&path, &record).map_err(|source| DispatchError::Io {
            agent: request.agent.clone(),
            source,
        })?;
        debug!(agent = %request.agent, path = %path.display(), "Dispatch request dropped");
        Ok(())
    }
}

/// Runs a shell command per request, with the request as JSON on stdin.
/// Exit status zero means delivered.
pub struct HookDispatcher {
    command: String,
    timeout: Duration,
}

impl HookDispatcher {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn build_command(&self) -> TokioCommand {
        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = TokioCommand::new("bash");
            cmd.arg("-lc").arg(&self.command);
            cmd
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = TokioCommand::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Dispatcher for HookDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        let agent = request.agent.clone();
        let io_err = |source| DispatchError::Io {
            agent: agent.clone(),
            source,
        };

        let payload = serde_json::to_vec(&request)
            .map_err(|err| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;

        let mut command = self.build_command();
        command
            .env("FLEET_DISPATCH_AGENT", &request.agent)
            .env("FLEET_DISPATCH_URGENCY", request.urgency.as_str())
            .env(
                "FLEET_DISPATCH_FRESH_SESSION",
                if request.fresh_session { "1" } else { "0" },
            );

        let mut child = command.spawn().map_err(io_err)?;
        if let Some(mut stdin) = child.stdin.take() {
            // Hooks are free to ignore stdin and exit early.
            if let Err(err) = stdin.write_all(&payload).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(io_err(err));
                }
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(io_err)?,
            Err(_) => {
                warn!(%agent, timeout_secs = self.timeout.as_secs(), "Dispatch hook timed out");
                return Err(DispatchError::Timeout {
                    agent,
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if output.status.success() {
            debug!(%agent, urgency = request.urgency.as_str(), "Dispatch hook delivered");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DispatchError::HookFailed {
                agent,
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(512).collect(),
            })
        }
    }
}

/// Build the dispatcher selected by `[dispatch]`.
pub fn dispatcher_from_config(config: &FleetConfig) -> Arc<dyn Dispatcher> {
    match config.dispatch.mode {
        DispatchMode::FileDrop => Arc::new(FileDropDispatcher::new(
            config.runtime_root.join("dispatch"),
        )),
        DispatchMode::Hook => Arc::new(HookDispatcher::new(
            config.dispatch.command.clone().unwrap_or_default(),
            Duration::from_secs(config.dispatch.timeout_secs),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_drop_writes_one_request_per_call() {
        let dir = TempDir::new().unwrap();
        let dispatcher = FileDropDispatcher::new(dir.path());

        dispatcher
            .dispatch(DispatchRequest::new("W1", "hello", Urgency::Normal))
            .await
            .unwrap();
        dispatcher
            .dispatch(DispatchRequest::new("W1", "again", Urgency::Urgent).with_fresh_session(true))
            .await
            .unwrap();

        let mut files: Vec<_> = std::fs::read_dir(dispatcher.agent_dir("W1"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        assert_eq!(files.len(), 2);

        let last: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&files[1]).unwrap()).unwrap();
        assert_eq!(last["content"], "again");
        assert_eq!(last["urgency"], "urgent");
        assert_eq!(last["fresh_session"], true);
    }

    #[tokio::test]
    async fn file_drop_rejects_path_like_agents() {
        let dir = TempDir::new().unwrap();
        let dispatcher = FileDropDispatcher::new(dir.path().join("drops"));
        let err = dispatcher
            .dispatch(DispatchRequest::new("../W1", "x", Urgency::Normal))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_DISPATCH_REJECTED");
        assert!(!dir.path().join("W1").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hook_reports_non_zero_exit_as_failure() {
        let ok = HookDispatcher::new("cat > /dev/null", Duration::from_secs(5));
        ok.dispatch(DispatchRequest::new("W1", "x", Urgency::Normal))
            .await
            .unwrap();

        let failing = HookDispatcher::new("echo nope >&2; exit 3", Duration::from_secs(5));
        let err = failing
            .dispatch(DispatchRequest::new("W1", "x", Urgency::Normal))
            .await
            .unwrap_err();
        match err {
            DispatchError::HookFailed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hook_times_out() {
        let slow = HookDispatcher::new("sleep 5", Duration::from_millis(100));
        let err = slow
            .dispatch(DispatchRequest::new("W1", "x", Urgency::Urgent))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E_DISPATCH_TIMEOUT");
    }
}
