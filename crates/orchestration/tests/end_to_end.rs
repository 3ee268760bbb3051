//! Full round trips through real mailbox directories: messages are posted as
//! files, picked up by the transport, routed, and their effects checked on
//! disk.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fleet_common::config::FleetConfig;
use fleet_common::envelope::{Envelope, MessageType};
use fleet_common::task::{Task, TaskState};
use fleet_orchestration::journal::{read_entries, JOURNAL_FILE};
use fleet_orchestration::mailbox::{self, INBOX_DIR};
use fleet_orchestration::workflow::load_run;
use fleet_orchestration::{
    CommandRouter, Coordinator, DispatchError, DispatchRequest, Dispatcher, Journal, Mailbox,
    MailboxTransport, MessageHandler, OrchestrationStrategy, RunStatus, StepStatus,
    WorkflowBuilder, WorkflowEngine,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn config(root: &Path) -> FleetConfig {
    let root = root.display();
    FleetConfig::from_toml_str(&format!(
        r#"
agents = ["W1", "W2"]
mailbox_root = "{root}/mail"
task_store_root = "{root}/tasks"
runtime_root = "{root}/runtime"
active_grace = 300
warn_threshold = 480
stall_threshold = 600
check_interval = 30
rescue_cooldown = 300

[mailbox]
poll_interval_ms = 10
"#
    ))
    .unwrap()
}

fn inbox(config: &FleetConfig, agent: &str) -> Vec<Envelope> {
    let Ok(read) = std::fs::read_dir(config.mailbox_dir(agent).join(INBOX_DIR)) else {
        return Vec::new();
    };
    let mut files: Vec<_> = read
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
        .iter()
        .map(|p| serde_json::from_slice(&std::fs::read(p).unwrap()).unwrap())
        .collect()
}

/// Records what reaches the actuator. When `reply_root` is set it also
/// answers workflow steps by posting a `response` to the orchestrator inbox,
/// quoting the request id from the dispatch footer.
struct Actuator {
    reply_root: Option<std::path::PathBuf>,
    seen: Mutex<Vec<(String, String)>>,
}

impl Actuator {
    fn new(reply_root: Option<&Path>) -> Self {
        Self {
            reply_root: reply_root.map(Path::to_path_buf),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<(String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

fn footer_field<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("| {key} ");
    let start = content.find(&marker)? + marker.len();
    let rest = &content[start..];
    Some(&rest[..rest.find(" |")?])
}

#[async_trait]
impl Dispatcher for Actuator {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        self.seen
            .lock()
            .unwrap()
            .push((request.agent.clone(), request.content.clone()));

        let (Some(root), Some(step), Some(request_id)) = (
            self.reply_root.as_deref(),
            footer_field(&request.content, "step"),
            footer_field(&request.content, "request"),
        ) else {
            return Ok(());
        };
        let mut reply = Envelope::new(
            "response",
            request.agent.clone(),
            "orchestrator",
            json!({"text": format!("{step} handled by {}", request.agent)}),
        );
        reply.causation_id = request_id.to_string();
        mailbox::post(root, &reply).map_err(|err| DispatchError::Io {
            agent: request.agent.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, err.to_string()),
        })?;
        Ok(())
    }
}

fn transport(config: &FleetConfig, router: Arc<dyn MessageHandler>) -> MailboxTransport {
    let mut transport = MailboxTransport::new(config.poll_interval());
    for owner in config.mailbox_owners() {
        transport.add_mailbox(Mailbox::open(config.mailbox_dir(owner), owner, 100).unwrap());
    }
    transport.register(router);
    transport
}

#[tokio::test]
async fn request_assign_update_verify() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config(dir.path());
    config.ensure_roots()?;

    let journal = Arc::new(Journal::open(config.runtime_root.join(JOURNAL_FILE))?);
    let coordinator = Arc::new(Coordinator::from_config(&config)?.with_journal(journal.clone()));
    let actuator = Arc::new(Actuator::new(None));
    let router = Arc::new(CommandRouter::from_config(
        &config,
        coordinator.clone(),
        actuator.clone(),
    ));
    let mut transport = transport(&config, router);

    let mut task = Task::queued("T1", "fleet", "fix the flaky test");
    task.evidence_required = vec!["note".into()];
    coordinator.seed(task)?;

    // W1 asks for work.
    let request = Envelope::new(
        MessageType::FsmRequest,
        "W1",
        &config.orchestrator,
        json!({"targets": ["W1"]}),
    );
    mailbox::post(&config.mailbox_root, &request)?;
    let report = transport.deliver_all().await;
    assert_eq!(report.delivered, 1);

    let stored = coordinator.store().get("T1")?.unwrap();
    assert_eq!(stored.owner.as_deref(), Some("W1"));
    assert_eq!(stored.state, TaskState::Assigned);

    // W1 was scanned before the orchestrator, so the task message and the
    // command result are still waiting in its inbox.
    let waiting = inbox(&config, "W1");
    let kinds: Vec<&str> = waiting.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains(&"task"));
    assert!(kinds.contains(&"result"));
    let result = waiting.iter().find(|e| e.kind.as_str() == "result").unwrap();
    assert_eq!(result.causation_id, request.id);
    assert_eq!(result.payload["assigned"], 1);

    transport.deliver_all().await;
    let seen = actuator.seen();
    assert!(seen
        .iter()
        .any(|(agent, text)| agent == "W1" && text.contains("[fleet] Task T1")));
    assert!(inbox(&config, "W1").is_empty());

    // W1 reports completion.
    let update = Envelope::new(
        MessageType::FsmUpdate,
        "W1",
        &config.orchestrator,
        json!({"task_id": "T1", "state": "done", "evidence": {"note": "x"}}),
    );
    mailbox::post(&config.mailbox_root, &update)?;
    transport.deliver_all().await;

    let done = coordinator.store().get("T1")?.unwrap();
    assert_eq!(done.state, TaskState::Done);
    assert!(done.completed_at.is_some());
    assert_eq!(done.evidence.last().unwrap()["note"], "x");

    let verify = inbox(&config, &config.supervisor);
    assert_eq!(verify.len(), 1);
    assert_eq!(verify[0].kind.as_str(), "verify");
    assert_eq!(verify[0].payload["task_id"], "T1");

    let events: Vec<String> = read_entries(journal.path())?.into_iter().map(|e| e.ev).collect();
    assert!(events.contains(&"ASSIGN".to_string()));
    assert!(events.contains(&"UPDATE".to_string()));
    Ok(())
}

#[tokio::test]
async fn redelivered_request_is_not_applied_twice() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config(dir.path());
    config.ensure_roots()?;

    let coordinator = Arc::new(Coordinator::from_config(&config)?);
    let actuator = Arc::new(Actuator::new(None));
    let router = Arc::new(CommandRouter::from_config(&config, coordinator.clone(), actuator));
    let mut transport = transport(&config, router);

    coordinator.seed(Task::queued("T1", "fleet", "a"))?;
    coordinator.seed(Task::queued("T2", "fleet", "b"))?;

    let request = Envelope::new(
        MessageType::FsmRequest,
        "W1",
        &config.orchestrator,
        json!({"target": "W1"}),
    );
    mailbox::post(&config.mailbox_root, &request)?;
    transport.deliver_all().await;
    let first = coordinator.store().list()?;
    assert!(first.iter().all(|t| t.owner.as_deref() == Some("W1")));

    // Same message id dropped again: archived without being handled.
    coordinator.release("T2", "operator reset")?;
    mailbox::post(&config.mailbox_root, &request)?;
    let report = transport.deliver_all().await;
    assert_eq!(report.duplicates, 1);
    assert_eq!(coordinator.store().get("T2")?.unwrap().state, TaskState::Queued);
    Ok(())
}

#[tokio::test]
async fn workflow_responses_flow_through_orchestrator_mailbox() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config(dir.path());
    config.ensure_roots()?;

    let coordinator = Arc::new(Coordinator::from_config(&config)?);
    let actuator = Arc::new(Actuator::new(Some(&config.mailbox_root)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let router = Arc::new(
        CommandRouter::from_config(&config, coordinator, actuator.clone())
            .with_workflow_channel(tx),
    );

    let cancel = CancellationToken::new();
    let scanning = tokio::spawn(transport(&config, router).run(cancel.clone()));

    let workers = vec!["W1".to_string(), "W2".to_string()];
    let workflow = WorkflowBuilder::new("review")
        .id("wf-review")
        .step_defaults(Duration::from_secs(5), 0)
        .orchestrate("review the parser", &workers, OrchestrationStrategy::Sequential)
        .build()?;

    let engine = WorkflowEngine::from_config(&config, actuator.clone())
        .with_poll_interval(Duration::from_millis(10));
    let run = tokio::time::timeout(
        Duration::from_secs(10),
        engine.run(workflow, &mut rx, &cancel),
    )
    .await??;
    cancel.cancel();
    scanning.await?;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.count(StepStatus::Completed), 2);
    assert_eq!(run.workflow_data["orch1_1"]["text"], Value::from("orch1_1 handled by W1"));

    // The second worker saw the first worker's result.
    let to_w2 = actuator
        .seen()
        .into_iter()
        .find(|(agent, _)| agent == "W2")
        .map(|(_, text)| text)
        .unwrap();
    assert!(to_w2.contains("orch1_1 handled by W1"));

    let persisted = load_run(&config.runtime_root, "wf-review")?.unwrap();
    assert_eq!(persisted.status, RunStatus::Completed);
    Ok(())
}
