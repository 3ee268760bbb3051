use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_common::config::FleetConfig;
use fleet_common::envelope::Envelope;
use fleet_common::fs::{read_json, write_json_atomic};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::template;
use super::{check_id, RunStatus, StepStatus, Workflow, WorkflowError, WorkflowRun};
use crate::dispatch::{DispatchRequest, Dispatcher, Urgency};
use crate::journal::Journal;

pub const WORKFLOWS_DIR: &str = "workflows";
pub const QUEUE_DIR: &str = "queue";
const DEFAULT_POLL: Duration = Duration::from_millis(250);

/// Queue a workflow definition for the daemon's engine loop.
pub fn submit(runtime_root: &Path, workflow: &Workflow) -> Result<PathBuf, WorkflowError> {
    workflow.validate()?;
    let path = runtime_root
        .join(WORKFLOWS_DIR)
        .join(QUEUE_DIR)
        .join(format!("{}_{}.json", Utc::now().format("%Y%m%dT%H%M%S%.6f"), workflow.id));
    write_json_atomic(&path, workflow).map_err(|source| WorkflowError::Persist {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

/// Last persisted state of run `workflow_id`.
pub fn load_run(
    runtime_root: &Path,
    workflow_id: &str,
) -> Result<Option<WorkflowRun>, WorkflowError> {
    check_id(workflow_id)?;
    let path = runtime_root.join(WORKFLOWS_DIR).join(format!("{workflow_id}.json"));
    read_json(&path).map_err(|source| WorkflowError::Persist { path, source })
}

pub struct WorkflowEngine {
    dispatcher: Arc<dyn Dispatcher>,
    state_dir: PathBuf,
    reply_to: String,
    journal: Option<Arc<Journal>>,
    poll_interval: Duration,
}

impl WorkflowEngine {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        runtime_root: &Path,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            state_dir: runtime_root.join(WORKFLOWS_DIR),
            reply_to: reply_to.into(),
            journal: None,
            poll_interval: DEFAULT_POLL,
        }
    }

    pub fn from_config(config: &FleetConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self::new(dispatcher, &config.runtime_root, &config.orchestrator)
            .with_poll_interval(config.poll_interval())
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.state_dir.join(QUEUE_DIR)
    }

    pub fn run_path(&self, workflow_id: &str) -> PathBuf {
        self.state_dir.join(format!("{workflow_id}.json"))
    }

    /// Drive `workflow` until every step is completed or failed, or until
    /// `cancel` fires. Responses are read from `responses`.
    pub async fn run(
        &self,
        workflow: Workflow,
        responses: &mut mpsc::UnboundedReceiver<Envelope>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowRun, WorkflowError> {
        workflow.validate()?;
        let mut run = WorkflowRun::new(workflow);
        let mut deadlines: HashMap<String, Instant> = HashMap::new();
        let mut arrived: VecDeque<Envelope> = VecDeque::new();
        let mut channel_open = true;

        info!(workflow_id = %run.workflow.id, steps = run.workflow.steps.len(), "Workflow started");
        self.persist(&mut run);

        loop {
            if cancel.is_cancelled() {
                run.status = RunStatus::Cancelled;
                break;
            }

            loop {
                match responses.try_recv() {
                    Ok(envelope) => arrived.push_back(envelope),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        channel_open = false;
                        break;
                    }
                }
            }
            while let Some(envelope) = arrived.pop_front() {
                self.accept_response(&mut run, &mut deadlines, envelope);
            }
            self.expire(&mut run, &mut deadlines, Instant::now());
            self.dispatch_ready(&mut run, &mut deadlines).await;

            if run.is_finished() {
                run.status = if run.count(StepStatus::Failed) > 0 {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                };
                break;
            }

            // Nothing ready: wait for a response, the nearest deadline or the
            // next poll, whichever comes first.
            let poll_at = Instant::now() + self.poll_interval;
            let wake_at = deadlines.values().copied().fold(poll_at, Instant::min);
            tokio::select! {
                _ = cancel.cancelled() => {}
                received = responses.recv(), if channel_open => match received {
                    Some(envelope) => arrived.push_back(envelope),
                    None => channel_open = false,
                },
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }

        self.persist(&mut run);
        self.journal_event(
            "WORKFLOW",
            &run.workflow.id,
            json!({
                "status": run.status,
                "completed": run.count(StepStatus::Completed),
                "failed": run.count(StepStatus::Failed),
            }),
        );
        info!(
            workflow_id = %run.workflow.id,
            status = ?run.status,
            completed = run.count(StepStatus::Completed),
            failed = run.count(StepStatus::Failed),
            "Workflow finished"
        );
        Ok(run)
    }

    async fn dispatch_ready(
        &self,
        run: &mut WorkflowRun,
        deadlines: &mut HashMap<String, Instant>,
    ) {
        let ready: Vec<usize> = run
            .workflow
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| run.is_ready(step))
            .map(|(index, _)| index)
            .collect();

        for index in ready {
            let step = run.workflow.steps[index].clone();
            let request_id = Uuid::new_v4().to_string();
            let rendered = template::render(
                &step.dispatch_template,
                &run.workflow.variables,
                &run.workflow_data,
            );
            let content = format!(
                "{rendered}\n\n[workflow {} | step {} | request {request_id} | reply '{}' to {}]",
                run.workflow.id, step.id, step.expected_response_type, self.reply_to
            );

            if let Some(state) = run.steps.get_mut(&step.id) {
                state.status = StepStatus::Dispatched;
                state.request_id = Some(request_id.clone());
                state.dispatched_at = Some(Utc::now());
            }
            self.persist(run);

            let request = DispatchRequest::new(&step.agent_target, content, Urgency::Normal);
            match self.dispatcher.dispatch(request).await {
                Ok(()) => {
                    if let Some(state) = run.steps.get_mut(&step.id) {
                        state.status = StepStatus::AwaitingResponse;
                    }
                    deadlines.insert(step.id.clone(), Instant::now() + step.timeout_duration());
                    debug!(
                        workflow_id = %run.workflow.id,
                        step = %step.id,
                        agent = %step.agent_target,
                        "Step dispatched"
                    );
                    self.journal_event(
                        "STEP",
                        &run.workflow.id,
                        json!({
                            "step": step.id,
                            "status": "awaiting_response",
                            "agent": step.agent_target,
                            "request_id": request_id,
                        }),
                    );
                    self.persist(run);
                }
                Err(err) => {
                    warn!(step = %step.id, code = err.code(), "Step dispatch failed: {}", err);
                    self.retry_or_fail(run, &step.id, format!("dispatch failed: {err}"));
                }
            }
        }
    }

    /// Match a response to an in-flight step: by `causation_id` first, then
    /// by sender and type against the oldest dispatch.
    fn accept_response(
        &self,
        run: &mut WorkflowRun,
        deadlines: &mut HashMap<String, Instant>,
        envelope: Envelope,
    ) {
        let awaiting = |id: &str| run.status_of(id) == Some(StepStatus::AwaitingResponse);

        let by_causation = run
            .steps
            .iter()
            .filter(|(id, _)| awaiting(id.as_str()))
            .find(|(_, state)| state.request_id.as_deref() == Some(envelope.causation_id.as_str()))
            .map(|(id, _)| id.clone());
        let matched = by_causation.or_else(|| {
            run.workflow
                .steps
                .iter()
                .filter(|step| awaiting(step.id.as_str()))
                .filter(|step| {
                    step.agent_target == envelope.from
                        && step.expected_response_type == envelope.kind.as_str()
                })
                .min_by_key(|step| run.steps.get(&step.id).and_then(|state| state.dispatched_at))
                .map(|step| step.id.clone())
        });

        let Some(step_id) = matched else {
            debug!(
                msg_id = %envelope.id,
                from = %envelope.from,
                msg_type = %envelope.kind,
                "Response matches no in-flight step"
            );
            return;
        };

        let data = match envelope.payload {
            Value::Object(map) => Value::Object(map),
            Value::String(text) => json!({"text": text}),
            other => json!({"value": other}),
        };
        run.workflow_data.insert(step_id.clone(), data);
        if let Some(state) = run.steps.get_mut(&step_id) {
            state.status = StepStatus::Completed;
            state.finished_at = Some(Utc::now());
            state.error = None;
        }
        deadlines.remove(&step_id);

        info!(
            workflow_id = %run.workflow.id,
            step = %step_id,
            msg_id = %envelope.id,
            "Step completed"
        );
        self.journal_event(
            "STEP",
            &run.workflow.id,
            json!({"step": step_id, "status": "completed", "msg_id": envelope.id}),
        );
        self.persist(run);
    }

    fn expire(
        &self,
        run: &mut WorkflowRun,
        deadlines: &mut HashMap<String, Instant>,
        now: Instant,
    ) {
        let expired: Vec<String> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for step_id in expired {
            deadlines.remove(&step_id);
            let timeout_ms = run
                .workflow
                .step(&step_id)
                .map(|step| step.timeout_ms)
                .unwrap_or_default();
            warn!(workflow_id = %run.workflow.id, step = %step_id, timeout_ms, "Step timed out");
            self.retry_or_fail(run, &step_id, format!("no response within {timeout_ms}ms"));
        }
    }

    fn retry_or_fail(&self, run: &mut WorkflowRun, step_id: &str, reason: String) {
        let retry = match run.workflow.steps.iter_mut().find(|step| step.id == step_id) {
            Some(step) if step.retry_count < step.max_retries => {
                step.retry_count += 1;
                Some(step.retry_count)
            }
            _ => None,
        };

        if let Some(attempt) = retry {
            if let Some(state) = run.steps.get_mut(step_id) {
                state.status = StepStatus::Pending;
                state.error = Some(reason);
            }
            info!(workflow_id = %run.workflow.id, step = %step_id, attempt, "Retrying step");
        } else {
            self.fail_with_dependents(run, step_id, reason);
        }
        self.persist(run);
    }

    /// Fail `step_id` and every step downstream of it so the run can finish.
    fn fail_with_dependents(&self, run: &mut WorkflowRun, step_id: &str, reason: String) {
        let now = Utc::now();
        if let Some(state) = run.steps.get_mut(step_id) {
            state.status = StepStatus::Failed;
            state.finished_at = Some(now);
            state.error = Some(reason.clone());
        }
        let dependents = run.workflow.dependents_of(step_id);
        for dependent in &dependents {
            if let Some(state) = run.steps.get_mut(dependent) {
                if !state.status.is_finished() {
                    state.status = StepStatus::Failed;
                    state.finished_at = Some(now);
                    state.error = Some(format!("dependency '{step_id}' failed"));
                }
            }
        }

        warn!(
            workflow_id = %run.workflow.id,
            step = %step_id,
            cascaded = dependents.len(),
            %reason,
            "Step failed"
        );
        self.journal_event(
            "STEP",
            &run.workflow.id,
            json!({"step": step_id, "status": "failed", "reason": reason, "cascaded": dependents}),
        );
    }

    fn persist(&self, run: &mut WorkflowRun) {
        run.updated_at = Utc::now();
        let path = self.run_path(&run.workflow.id);
        if let Err(err) = write_json_atomic(&path, run) {
            warn!(path = %path.display(), "Failed to persist workflow state: {}", err);
        }
    }

    fn journal_event(&self, event: &str, workflow_id: &str, meta: Value) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(event, workflow_id, "workflow", &self.reply_to, meta) {
                warn!(event, workflow_id, "Failed to append journal entry: {}", err);
            }
        }
    }

    /// Oldest valid definition in the queue. Unreadable or invalid ones are
    /// set aside with a `.rejected` suffix.
    fn next_queued(&self) -> Option<Workflow> {
        let queue = self.queue_dir();
        let mut entries: Vec<PathBuf> = fs::read_dir(&queue)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| !name.starts_with('.') && name.ends_with(".json"))
            })
            .collect();
        entries.sort();

        for path in entries {
            let parsed = read_json::<Workflow>(&path)
                .map_err(|err| err.to_string())
                .and_then(|workflow| {
                    let workflow = workflow.ok_or_else(|| "definition vanished".to_string())?;
                    workflow.validate().map_err(|err| err.to_string())?;
                    Ok(workflow)
                });
            match parsed {
                Ok(workflow) => {
                    if let Err(err) = fs::remove_file(&path) {
                        warn!(path = %path.display(), "Failed to dequeue workflow: {}", err);
                        continue;
                    }
                    return Some(workflow);
                }
                Err(reason) => {
                    warn!(path = %path.display(), %reason, "Rejecting queued workflow");
                    let mut rejected = path.clone().into_os_string();
                    rejected.push(".rejected");
                    if let Err(err) = fs::rename(&path, &rejected) {
                        warn!(
                            path = %path.display(),
                            "Failed to set rejected workflow aside: {}",
                            err
                        );
                    }
                }
            }
        }
        None
    }

    /// Run queued workflows one at a time until `cancel` fires. Responses
    /// that arrive while no workflow is running are dropped.
    pub async fn serve(
        self,
        mut responses: mpsc::UnboundedReceiver<Envelope>,
        cancel: CancellationToken,
    ) {
        if let Err(err) = fs::create_dir_all(self.queue_dir()) {
            warn!(path = %self.queue_dir().display(), "Failed to create workflow queue: {}", err);
        }
        info!(queue = %self.queue_dir().display(), "Workflow engine started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(workflow) = self.next_queued() else {
                        while let Ok(stray) = responses.try_recv() {
                            debug!(
                                msg_id = %stray.id,
                                from = %stray.from,
                                "No workflow running; response dropped"
                            );
                        }
                        continue;
                    };
                    let workflow_id = workflow.id.clone();
                    if let Err(err) = self.run(workflow, &mut responses, &cancel).await {
                        warn!(%workflow_id, code = err.code(), "Workflow could not run: {}", err);
                    }
                }
            }
        }
        info!("Workflow engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::workflow::{WorkflowBuilder, WorkflowStep};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn data_text(data: &Map<String, Value>, step_id: &str) -> Option<String> {
        data.get(step_id)?.get("text")?.as_str().map(str::to_string)
    }

    fn footer_field<'a>(content: &'a str, key: &str) -> &'a str {
        let marker = format!("| {key} ");
        let start = content.find(&marker).unwrap() + marker.len();
        let rest = &content[start..];
        &rest[..rest.find(" |").unwrap()]
    }

    /// Answers every dispatch immediately unless the agent is silent.
    struct Responder {
        tx: mpsc::UnboundedSender<Envelope>,
        silent: HashSet<String>,
        quote_request: bool,
        log: Mutex<Vec<String>>,
    }

    impl Responder {
        fn new(tx: mpsc::UnboundedSender<Envelope>, silent: &[&str]) -> Self {
            Self {
                tx,
                silent: silent.iter().map(|s| s.to_string()).collect(),
                quote_request: false,
                log: Mutex::new(Vec::new()),
            }
        }

        fn dispatched(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for Responder {
        async fn dispatch(&self, request: DispatchRequest) -> Result<(), DispatchError> {
            let step = footer_field(&request.content, "step").to_string();
            self.log.lock().unwrap().push(step.clone());
            if self.silent.contains(&request.agent) {
                return Ok(());
            }
            let mut reply = Envelope::new(
                "response",
                request.agent.clone(),
                "orchestrator",
                json!({"text": format!("{step} ok")}),
            );
            if self.quote_request {
                reply.causation_id = footer_field(&request.content, "request").to_string();
            }
            let _ = self.tx.send(reply);
            Ok(())
        }
    }

    fn diamond(timeout: Duration, retries: u32) -> Workflow {
        WorkflowBuilder::new("diamond")
            .id("wf-diamond")
            .step(WorkflowStep::new("A", "W1", "start").timeout(timeout).retries(retries))
            .step(
                WorkflowStep::new("B", "W2", "after {{A.text}}")
                    .depends_on(["A"])
                    .timeout(timeout)
                    .retries(retries),
            )
            .step(
                WorkflowStep::new("C", "W3", "c")
                    .depends_on(["A"])
                    .timeout(timeout)
                    .retries(retries),
            )
            .step(
                WorkflowStep::new("D", "W1", "d")
                    .depends_on(["B", "C"])
                    .timeout(timeout)
                    .retries(retries),
            )
            .build()
            .unwrap()
    }

    fn engine(dir: &TempDir, dispatcher: Arc<dyn Dispatcher>) -> WorkflowEngine {
        WorkflowEngine::new(dispatcher, dir.path(), "orchestrator")
            .with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn diamond_runs_in_dependency_order() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = Arc::new(Responder::new(tx, &[]));
        let engine = engine(&dir, responder.clone());

        let run = engine
            .run(diamond(Duration::from_secs(5), 0), &mut rx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        let order = responder.dispatched();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert_eq!(pos("A"), 0);
        assert_eq!(pos("D"), 3);
        assert_eq!(data_text(&run.workflow_data, "B").as_deref(), Some("B ok"));

        let persisted = load_run(dir.path(), "wf-diamond").unwrap().unwrap();
        assert_eq!(persisted.status, RunStatus::Completed);
        assert_eq!(persisted.count(StepStatus::Completed), 4);
    }

    #[tokio::test]
    async fn timeout_retries_then_cascades() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let responder = Arc::new(Responder::new(tx, &["W2"]));
        let engine = engine(&dir, responder.clone());

        let run = engine
            .run(diamond(Duration::from_millis(80), 1), &mut rx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.status_of("C"), Some(StepStatus::Completed));
        assert_eq!(run.status_of("B"), Some(StepStatus::Failed));
        assert_eq!(run.status_of("D"), Some(StepStatus::Failed));
        assert_eq!(run.steps["D"].error.as_deref(), Some("dependency 'B' failed"));
        assert_eq!(run.workflow.step("B").unwrap().retry_count, 1);

        let order = responder.dispatched();
        assert_eq!(order.iter().filter(|s| *s == "B").count(), 2);
        assert!(!order.contains(&"D".to_string()));
    }

    #[tokio::test]
    async fn causation_id_picks_the_right_step() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut responder = Responder::new(tx, &[]);
        responder.quote_request = true;
        let responder = Arc::new(responder);
        let engine = engine(&dir, responder.clone());

        let workflow = WorkflowBuilder::new("fan")
            .orchestrate(
                "same agent twice",
                &["W1".to_string(), "W1".to_string()],
                crate::workflow::OrchestrationStrategy::Parallel,
            )
            .build()
            .unwrap();
        let run = engine.run(workflow, &mut rx, &CancellationToken::new()).await.unwrap();

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(data_text(&run.workflow_data, "orch1_1").as_deref(), Some("orch1_1 ok"));
        assert_eq!(data_text(&run.workflow_data, "orch1_2").as_deref(), Some("orch1_2 ok"));
    }

    #[tokio::test]
    async fn cancellation_ends_run() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = engine(&dir, Arc::new(Responder::new(tx, &["W1", "W2", "W3"])));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = engine.run(diamond(Duration::from_secs(30), 0), &mut rx, &cancel).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.status_of("A"), Some(StepStatus::AwaitingResponse));
    }

    #[tokio::test]
    async fn serve_runs_queued_definitions_and_rejects_bad_ones() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = engine(&dir, Arc::new(Responder::new(tx, &[])));
        submit(dir.path(), &diamond(Duration::from_secs(5), 0)).unwrap();
        let bad = engine.queue_dir().join("0000_bad.json");
        fs::write(&bad, b"{\"id\": \"x\", \"steps\": []}").unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.serve(rx, cancel.clone()));
        let mut finished = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(run) = load_run(dir.path(), "wf-diamond").unwrap() {
                if run.status != RunStatus::Running {
                    finished = Some(run);
                    break;
                }
            }
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(finished.unwrap().status, RunStatus::Completed);
        assert!(dir.path().join("workflows/queue/0000_bad.json.rejected").is_file());
    }
}
