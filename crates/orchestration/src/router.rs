//! Inbound message routing.
//!
//! The router is registered as the handler of every mailbox. Command
//! envelopes are executed against the coordinator and answered with a
//! `result` envelope in the sender's mailbox. Anything else addressed to the
//! orchestrator feeds the workflow engine; the rest is handed to the
//! dispatcher for delivery to the addressed agent.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_common::config::FleetConfig;
use fleet_common::envelope::{Envelope, MessageType};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, CoordinatorError, TaskUpdate};
use crate::dispatch::{DispatchError, DispatchRequest, Dispatcher, Urgency};
use crate::mailbox::{self, HandlerError, MessageHandler};
use crate::monitor::HEARTBEAT_FILE;

pub const RESULT_TYPE: &str = "result";

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("missing field `{0}` in payload")]
    MissingField(&'static str),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl RouterError {
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::MissingField(_) | RouterError::InvalidPayload(_) => "E_INVALID_REQUEST",
            RouterError::Coordinator(err) => err.code(),
            RouterError::Dispatch(err) => err.code(),
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, RouterError::Dispatch(err) if err.is_transient())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// A command ran; the body is the structured result sent back.
    Reply(Value),
    /// Handed to the workflow engine.
    Forwarded,
    /// Delivered to the addressed agent through the dispatcher.
    Delivered,
    /// Nothing to do with it (no workflow listening).
    Ignored,
}

pub struct CommandRouter {
    coordinator: Arc<Coordinator>,
    dispatcher: Arc<dyn Dispatcher>,
    mailbox_root: PathBuf,
    orchestrator: String,
    workflow_tx: Option<mpsc::UnboundedSender<Envelope>>,
}

impl CommandRouter {
    pub fn new(
        coordinator: Arc<Coordinator>,
        dispatcher: Arc<dyn Dispatcher>,
        mailbox_root: impl Into<PathBuf>,
        orchestrator: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            dispatcher,
            mailbox_root: mailbox_root.into(),
            orchestrator: orchestrator.into(),
            workflow_tx: None,
        }
    }

    pub fn from_config(
        config: &FleetConfig,
        coordinator: Arc<Coordinator>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self::new(coordinator, dispatcher, &config.mailbox_root, &config.orchestrator)
    }

    pub fn with_workflow_channel(mut self, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        self.workflow_tx = Some(tx);
        self
    }

    pub async fn route(&self, envelope: &Envelope) -> Result<RouteOutcome, RouterError> {
        if envelope.kind.is_command() {
            let body = match self.execute(envelope) {
                Ok(body) => body,
                Err(err) => {
                    warn!(
                        msg_id = %envelope.id,
                        msg_type = %envelope.kind,
                        from = %envelope.from,
                        code = err.code(),
                        "Command failed: {}",
                        err
                    );
                    json!({"ok": false, "error": {"code": err.code(), "message": err.to_string()}})
                }
            };
            return Ok(RouteOutcome::Reply(body));
        }

        if envelope.to == self.orchestrator {
            return Ok(self.forward_to_workflow(envelope));
        }

        let request = DispatchRequest::new(
            &envelope.to,
            render_for_agent(envelope),
            urgency_of(envelope),
        );
        self.dispatcher.dispatch(request).await?;
        debug!(
            msg_id = %envelope.id,
            to = %envelope.to,
            msg_type = %envelope.kind,
            "Delivered to agent"
        );
        Ok(RouteOutcome::Delivered)
    }

    fn execute(&self, envelope: &Envelope) -> Result<Value, RouterError> {
        let payload = &envelope.payload;
        match &envelope.kind {
            MessageType::Ping => {
                self.touch_heartbeat(&envelope.from);
                Ok(json!({"ok": true, "type": "pong", "payload": payload}))
            }
            MessageType::Resume | MessageType::Sync => {
                let agent = envelope.payload_str("agent").unwrap_or(&envelope.from);
                info!(%agent, action = %envelope.kind, "Agent control request acknowledged");
                Ok(json!({
                    "ok": true,
                    "agent": agent,
                    "action": envelope.kind.as_str(),
                    "status": "acknowledged",
                }))
            }
            MessageType::FsmRequest => {
                let targets = targets_of(payload)?;
                let workflow_id = envelope.payload_str("workflow_id");
                let assignments = self.coordinator.assign_request(&targets, workflow_id)?;
                Ok(json!({"ok": true, "assigned": assignments.len(), "assignments": assignments}))
            }
            MessageType::FsmUpdate => {
                let update: TaskUpdate = serde_json::from_value(payload.clone())
                    .map_err(|err| RouterError::InvalidPayload(err.to_string()))?;
                let task = self.coordinator.update(update)?;
                Ok(json!({"ok": true, "task": task}))
            }
            MessageType::Release => {
                let task_id = envelope
                    .payload_str("task_id")
                    .ok_or(RouterError::MissingField("task_id"))?;
                let default_reason = format!("released by {}", envelope.from);
                let reason = envelope.payload_str("reason").unwrap_or(&default_reason);
                let task = self.coordinator.release(task_id, reason)?;
                Ok(json!({"ok": true, "task": task}))
            }
            other => Err(RouterError::InvalidPayload(format!("'{other}' is not a command"))),
        }
    }

    fn forward_to_workflow(&self, envelope: &Envelope) -> RouteOutcome {
        match &self.workflow_tx {
            Some(tx) if tx.send(envelope.clone()).is_ok() => RouteOutcome::Forwarded,
            _ => {
                debug!(
                    msg_id = %envelope.id,
                    from = %envelope.from,
                    "No workflow listening; response dropped"
                );
                RouteOutcome::Ignored
            }
        }
    }

    /// A ping is proof of life; record it where the activity monitor looks.
    fn touch_heartbeat(&self, agent: &str) {
        let dir = self.mailbox_root.join(agent);
        let result = fs::create_dir_all(&dir)
            .and_then(|_| fs::write(dir.join(HEARTBEAT_FILE), Utc::now().to_rfc3339()));
        if let Err(err) = result {
            warn!(%agent, "Failed to record heartbeat: {}", err);
        }
    }
}

#[async_trait]
impl MessageHandler for CommandRouter {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let outcome = self.route(envelope).await.map_err(|err| {
            if err.is_transient() {
                HandlerError::retry(err)
            } else {
                HandlerError::failed(err)
            }
        })?;
        if let RouteOutcome::Reply(body) = outcome {
            let reply = envelope.reply(MessageType::Other(RESULT_TYPE.into()), body);
            mailbox::post(&self.mailbox_root, &reply).map_err(HandlerError::failed)?;
        }
        Ok(())
    }
}

/// `targets` as a list of names, or a single `target`.
fn targets_of(payload: &Value) -> Result<Vec<String>, RouterError> {
    if let Some(list) = payload.get("targets").and_then(Value::as_array) {
        return list
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| RouterError::InvalidPayload("targets must be strings".into()))
            })
            .collect();
    }
    payload
        .get("target")
        .and_then(Value::as_str)
        .map(|target| vec![target.to_string()])
        .ok_or(RouterError::MissingField("targets"))
}

fn urgency_of(envelope: &Envelope) -> Urgency {
    if envelope.payload.get("urgent").and_then(Value::as_bool) == Some(true) {
        Urgency::Urgent
    } else {
        Urgency::Normal
    }
}

/// Plain-text rendering handed to the actuator.
fn render_for_agent(envelope: &Envelope) -> String {
    let payload = &envelope.payload;
    if envelope.kind == MessageType::Task {
        let mut text = format!(
            "[fleet] Task {} ({})\n{}\n",
            payload["task_id"].as_str().unwrap_or("?"),
            payload["repo"].as_str().unwrap_or("-"),
            payload["intent"].as_str().unwrap_or_default(),
        );
        for (title, key) in [
            ("Acceptance criteria", "acceptance_criteria"),
            ("Evidence required", "evidence_required"),
        ] {
            let items: Vec<&str> = payload[key]
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if !items.is_empty() {
                text.push_str(&format!("{title}:\n"));
                for item in items {
                    text.push_str(&format!("- {item}\n"));
                }
            }
        }
        text.push_str("Report progress with an fsm_update message.");
        return text;
    }

    let body = match payload.get("text").or_else(|| payload.get("content")) {
        Some(Value::String(text)) => text.clone(),
        _ => payload.to_string(),
    };
    format!("[fleet] {} from {}: {}", envelope.kind, envelope.from, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::Mailbox;
    use crate::store::TaskStore;
    use fleet_common::task::{Task, TaskState};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeDispatcher {
        sent: Mutex<Vec<DispatchRequest>>,
        /// Number of leading calls that fail.
        failures: Mutex<usize>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Dispatcher for FakeDispatcher {
        async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
            *self.calls.lock().unwrap() += 1;
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(DispatchError::Timeout {
                    agent: request.agent,
                    secs: 1,
                });
            }
            self.sent.lock().unwrap().push(request);
            Ok(())
        }
    }

    fn router(dir: &TempDir) -> (CommandRouter, Arc<Coordinator>, Arc<FakeDispatcher>) {
        let store = TaskStore::open(dir.path().join("tasks")).unwrap();
        let coordinator = Arc::new(Coordinator::new(
            store,
            dir.path().join("mail"),
            "orchestrator",
            "captain",
        ));
        let dispatcher = Arc::new(FakeDispatcher::default());
        let router = CommandRouter::new(
            coordinator.clone(),
            dispatcher.clone(),
            dir.path().join("mail"),
            "orchestrator",
        );
        (router, coordinator, dispatcher)
    }

    fn reply_body(outcome: RouteOutcome) -> Value {
        match outcome {
            RouteOutcome::Reply(body) => body,
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_echoes_and_records_heartbeat() {
        let dir = TempDir::new().unwrap();
        let (router, _, _) = router(&dir);
        let ping = Envelope::new(MessageType::Ping, "W1", "orchestrator", json!({"n": 7}));

        let body = reply_body(router.route(&ping).await.unwrap());
        assert_eq!(body["ok"], true);
        assert_eq!(body["payload"]["n"], 7);
        assert!(dir.path().join("mail/W1/heartbeat").is_file());
    }

    #[tokio::test]
    async fn sync_and_resume_are_acknowledged() {
        let dir = TempDir::new().unwrap();
        let (router, _, _) = router(&dir);
        let sync = Envelope::new(
            MessageType::Resume,
            "captain",
            "orchestrator",
            json!({"agent": "W2"}),
        );

        let body = reply_body(router.route(&sync).await.unwrap());
        assert_eq!(
            body,
            json!({"ok": true, "agent": "W2", "action": "resume", "status": "acknowledged"})
        );
    }

    #[tokio::test]
    async fn fsm_commands_drive_the_coordinator() {
        let dir = TempDir::new().unwrap();
        let (router, coordinator, _) = router(&dir);
        coordinator.store().insert(&Task::queued("T1", "r", "x")).unwrap();

        let request = Envelope::new(
            MessageType::FsmRequest,
            "captain",
            "orchestrator",
            json!({"targets": ["W1"], "workflow_id": "wf-9"}),
        );
        let body = reply_body(router.route(&request).await.unwrap());
        assert_eq!(body["assigned"], 1);

        let update = Envelope::new(
            MessageType::FsmUpdate,
            "W1",
            "orchestrator",
            json!({"task_id": "T1", "state": "in_progress"}),
        );
        let body = reply_body(router.route(&update).await.unwrap());
        assert_eq!(body["task"]["state"], "in_progress");

        let release = Envelope::new(
            MessageType::Release,
            "captain",
            "orchestrator",
            json!({"task_id": "T1"}),
        );
        reply_body(router.route(&release).await.unwrap());
        assert_eq!(coordinator.store().get("T1").unwrap().unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn failures_come_back_as_structured_results() {
        let dir = TempDir::new().unwrap();
        let (router, _, _) = router(&dir);

        let unknown = Envelope::new(
            MessageType::FsmUpdate,
            "W1",
            "orchestrator",
            json!({"task_id": "nope", "state": "done"}),
        );
        let body = reply_body(router.route(&unknown).await.unwrap());
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["code"], "E_TASK_NOT_FOUND");

        let no_targets =
            Envelope::new(MessageType::FsmRequest, "captain", "orchestrator", json!({}));
        let body = reply_body(router.route(&no_targets).await.unwrap());
        assert_eq!(body["error"]["code"], "E_INVALID_REQUEST");
    }

    #[tokio::test]
    async fn non_commands_are_forwarded_or_delivered() {
        let dir = TempDir::new().unwrap();
        let (router, _, dispatcher) = router(&dir);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = router.with_workflow_channel(tx);

        let response = Envelope::new("analysis", "W1", "orchestrator", json!({"text": "ok"}));
        assert_eq!(router.route(&response).await.unwrap(), RouteOutcome::Forwarded);
        assert_eq!(rx.recv().await.unwrap().id, response.id);

        let note = Envelope::new(
            "note",
            "captain",
            "W2",
            json!({"text": "rebase first", "urgent": true}),
        );
        assert_eq!(router.route(&note).await.unwrap(), RouteOutcome::Delivered);
        let sent = dispatcher.sent.lock().unwrap();
        assert_eq!(sent[0].agent, "W2");
        assert_eq!(sent[0].urgency, Urgency::Urgent);
        assert_eq!(sent[0].content, "[fleet] note from captain: rebase first");
    }

    #[tokio::test]
    async fn handler_posts_reply_to_sender_mailbox() {
        let dir = TempDir::new().unwrap();
        let (router, _, _) = router(&dir);
        let ping = Envelope::new(MessageType::Ping, "W1", "orchestrator", json!({}));

        router.handle(&ping).await.unwrap();

        let inbox: Vec<_> = fs::read_dir(dir.path().join("mail/W1/inbox"))
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(inbox.len(), 1);
        let reply: Envelope = serde_json::from_slice(&fs::read(inbox[0].path()).unwrap()).unwrap();
        assert_eq!(reply.kind.as_str(), RESULT_TYPE);
        assert_eq!(reply.causation_id, ping.id);
    }

    #[tokio::test]
    async fn failed_task_delivery_is_retried_on_next_scan() {
        let dir = TempDir::new().unwrap();
        let (router, coordinator, dispatcher) = router(&dir);
        *dispatcher.failures.lock().unwrap() = 1;
        coordinator.seed(Task::queued("T1", "r", "x")).unwrap();
        coordinator.assign_request(&["W1".to_string()], None).unwrap();

        let mut w1 = Mailbox::open(dir.path().join("mail/W1"), "W1", 100).unwrap();
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![Arc::new(router)];

        let first = w1.deliver(&handlers).await;
        assert_eq!(first.deferred, 1);
        assert_eq!(first.delivered, 0);
        assert!(dispatcher.sent.lock().unwrap().is_empty());

        let second = w1.deliver(&handlers).await;
        assert_eq!(second.delivered, 1);
        assert_eq!(*dispatcher.calls.lock().unwrap(), 2);
        let sent = dispatcher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].content.contains("[fleet] Task T1"));

        let task = coordinator.store().get("T1").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Assigned);
        assert_eq!(task.owner.as_deref(), Some("W1"));
    }

    #[tokio::test]
    async fn rejected_delivery_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let (router, _, _) = router(&dir);
        let rejecting = CommandRouter::new(
            router.coordinator.clone(),
            Arc::new(crate::dispatch::FileDropDispatcher::new(dir.path().join("drop"))),
            dir.path().join("mail"),
            "orchestrator",
        );
        let note = Envelope::new("note", "captain", "../W1", json!({"text": "hi"}));

        let err = rejecting.handle(&note).await.unwrap_err();
        assert!(!err.is_retry());
    }
}
