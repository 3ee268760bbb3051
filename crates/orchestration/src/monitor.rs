//! Per-agent activity watch with cooldown-gated escalation.
//!
//! Agents never acknowledge anything, so liveness is inferred from the
//! freshest side-channel signal (file modification times). Each tick
//! classifies every agent, nudges the ones drifting towards a stall, rescues
//! the stalled ones, and writes `activity.json`, `health.json` and
//! `metrics.json` under the runtime root.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_common::config::FleetConfig;
use fleet_common::fs::{read_json, write_json_atomic};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::dispatch::{DispatchRequest, Dispatcher, Urgency};
use crate::journal::Journal;

pub const ACTIVITY_FILE: &str = "activity.json";
pub const HEALTH_FILE: &str = "health.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const HEARTBEAT_FILE: &str = "heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub active_grace: Duration,
    pub warn: Duration,
    pub stall: Duration,
}

impl Thresholds {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            active_grace: config.active_grace(),
            warn: config.warn_threshold(),
            stall: config.stall_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Idle,
    Warning,
    Stalled,
}

/// Map the time since the last observed activity onto a status.
pub fn classify(age: Duration, thresholds: &Thresholds) -> AgentStatus {
    if age < thresholds.active_grace {
        AgentStatus::Active
    } else if age < thresholds.warn {
        AgentStatus::Idle
    } else if age < thresholds.stall {
        AgentStatus::Warning
    } else {
        AgentStatus::Stalled
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    Warn,
    Rescue,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::Warn => "warn",
            EscalationLevel::Rescue => "rescue",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub agent: String,
    pub last_activity_ts: DateTime<Utc>,
    #[serde(default)]
    pub last_rescue_ts: Option<DateTime<Utc>>,
    /// Rescues sent since the agent last produced a real signal.
    #[serde(default)]
    pub rescue_count: u32,
}

impl ActivityRecord {
    fn fresh(agent: &str, now: DateTime<Utc>) -> Self {
        Self {
            agent: agent.to_string(),
            last_activity_ts: now,
            last_rescue_ts: None,
            rescue_count: 0,
        }
    }
}

/// Where activity timestamps come from.
pub trait ActivitySource: Send + Sync {
    /// Most recent signal for `agent`, if any is observable.
    fn latest_signal(&self, agent: &str) -> Option<DateTime<Utc>>;
}

/// Freshest modification time among the configured per-agent artifacts and
/// `<mailbox_root>/<agent>/heartbeat`.
pub struct FileSignalSource {
    mailbox_root: PathBuf,
    paths: HashMap<String, Vec<PathBuf>>,
}

impl FileSignalSource {
    pub fn new(mailbox_root: impl Into<PathBuf>, paths: HashMap<String, Vec<PathBuf>>) -> Self {
        Self {
            mailbox_root: mailbox_root.into(),
            paths,
        }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(&config.mailbox_root, config.signals.clone())
    }

    pub fn heartbeat_path(&self, agent: &str) -> PathBuf {
        self.mailbox_root.join(agent).join(HEARTBEAT_FILE)
    }
}

impl ActivitySource for FileSignalSource {
    fn latest_signal(&self, agent: &str) -> Option<DateTime<Utc>> {
        let heartbeat = self.heartbeat_path(agent);
        self.paths
            .get(agent)
            .into_iter()
            .flatten()
            .map(PathBuf::as_path)
            .chain(std::iter::once(heartbeat.as_path()))
            .filter_map(modified_at)
            .max()
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
struct Counters {
    warn_sent: u64,
    rescue_sent: u64,
    dispatch_failures: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub statuses: BTreeMap<String, AgentStatus>,
    pub escalations: Vec<(String, EscalationLevel)>,
}

pub struct ActivityMonitor {
    agents: Vec<String>,
    thresholds: Thresholds,
    cooldown: Duration,
    check_interval: Duration,
    rescue_fresh_session: bool,
    release_after_rescues: Option<u32>,
    runtime_root: PathBuf,
    source: Arc<dyn ActivitySource>,
    dispatcher: Arc<dyn Dispatcher>,
    coordinator: Option<Arc<Coordinator>>,
    journal: Option<Arc<Journal>>,
    records: BTreeMap<String, ActivityRecord>,
    counters: BTreeMap<String, Counters>,
    ticks: u64,
}

impl ActivityMonitor {
    /// Build a monitor and restore persisted activity state. Agents without a
    /// persisted record start at "now" so a cold start never reads as stalled.
    pub fn new(
        config: &FleetConfig,
        source: Arc<dyn ActivitySource>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let mut monitor = Self {
            agents: config.agents.clone(),
            thresholds: Thresholds::from_config(config),
            cooldown: config.rescue_cooldown(),
            check_interval: config.check_interval(),
            rescue_fresh_session: config.monitor.rescue_fresh_session,
            release_after_rescues: config.monitor.release_after_rescues,
            runtime_root: config.runtime_root.clone(),
            source,
            dispatcher,
            coordinator: None,
            journal: None,
            records: BTreeMap::new(),
            counters: BTreeMap::new(),
            ticks: 0,
        };
        monitor.restore(Utc::now());
        monitor
    }

    pub fn with_coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn records(&self) -> &BTreeMap<String, ActivityRecord> {
        &self.records
    }

    pub fn record(&self, agent: &str) -> Option<&ActivityRecord> {
        self.records.get(agent)
    }

    pub fn activity_path(&self) -> PathBuf {
        self.runtime_root.join(ACTIVITY_FILE)
    }

    fn restore(&mut self, now: DateTime<Utc>) {
        let path = self.activity_path();
        let persisted: Vec<ActivityRecord> = match read_json(&path) {
            Ok(records) => records.unwrap_or_default(),
            Err(err) => {
                warn!(path = %path.display(), "Ignoring unreadable activity state: {}", err);
                Vec::new()
            }
        };
        let mut persisted: HashMap<String, ActivityRecord> = persisted
            .into_iter()
            .map(|record| (record.agent.clone(), record))
            .collect();

        for agent in &self.agents {
            let record = persisted
                .remove(agent)
                .unwrap_or_else(|| ActivityRecord::fresh(agent, now));
            self.records.insert(agent.clone(), record);
            self.counters.entry(agent.clone()).or_default();
        }
        debug!(agents = self.records.len(), "Activity state restored");
    }

    pub fn status_of(&self, agent: &str, now: DateTime<Utc>) -> Option<AgentStatus> {
        self.records
            .get(agent)
            .map(|record| classify(age_at(record.last_activity_ts, now), &self.thresholds))
    }

    pub async fn tick(&mut self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One monitoring pass as of `now`.
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickReport {
        self.ticks += 1;
        self.refresh_signals();

        let mut report = TickReport::default();
        for agent in self.agents.clone() {
            let Some(status) = self.status_of(&agent, now) else {
                continue;
            };
            let level = match status {
                AgentStatus::Stalled => Some(EscalationLevel::Rescue),
                AgentStatus::Warning => Some(EscalationLevel::Warn),
                AgentStatus::Active | AgentStatus::Idle => None,
            };
            if let Some(level) = level {
                if self.escalate(&agent, level, now).await {
                    report.escalations.push((agent.clone(), level));
                }
            }
            // Re-read: a rescue moves the activity timestamp.
            let status = self.status_of(&agent, now).unwrap_or(status);
            report.statuses.insert(agent, status);
        }

        self.write_snapshots(&report, now);
        self.persist();
        report
    }

    fn refresh_signals(&mut self) {
        for (agent, record) in self.records.iter_mut() {
            let Some(signal) = self.source.latest_signal(agent) else {
                continue;
            };
            if signal > record.last_activity_ts {
                record.last_activity_ts = signal;
            }
            let answered = record.last_rescue_ts.map_or(true, |rescue| signal > rescue);
            if answered && record.rescue_count > 0 {
                debug!(%agent, "Agent signalled after rescue; counter reset");
                record.rescue_count = 0;
            }
        }
    }

    /// Send a recovery message unless the agent is still inside its cooldown
    /// window. Returns whether a message went out.
    pub async fn escalate(
        &mut self,
        agent: &str,
        level: EscalationLevel,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(record) = self.records.get(agent) else {
            return false;
        };
        if let Some(last) = record.last_rescue_ts {
            if age_at(last, now) < self.cooldown {
                debug!(%agent, level = level.as_str(), "Escalation suppressed by cooldown");
                return false;
            }
        }

        let age_secs = age_at(record.last_activity_ts, now).as_secs();
        let request = match level {
            EscalationLevel::Warn => DispatchRequest::new(
                agent,
                format!(
                    "[fleet] {agent}: no activity seen for {age_secs}s. \
                     Post a short progress update when you can."
                ),
                Urgency::Normal,
            ),
            EscalationLevel::Rescue => DispatchRequest::new(
                agent,
                format!(
                    "[fleet] RESCUE {agent}: no activity seen for {age_secs}s. \
                     Reply with your status now: current task id, state, blockers, next step."
                ),
                Urgency::Urgent,
            )
            .with_fresh_session(self.rescue_fresh_session),
        };

        let counters = self.counters.entry(agent.to_string()).or_default();
        if let Err(err) = self.dispatcher.dispatch(request).await {
            counters.dispatch_failures += 1;
            warn!(
                %agent,
                level = level.as_str(),
                code = err.code(),
                "Escalation dispatch failed; will retry on a later tick: {}",
                err
            );
            return false;
        }

        let rescue_count = {
            let Some(record) = self.records.get_mut(agent) else {
                return false;
            };
            record.last_rescue_ts = Some(now);
            match level {
                EscalationLevel::Warn => counters.warn_sent += 1,
                EscalationLevel::Rescue => {
                    counters.rescue_sent += 1;
                    record.last_activity_ts = now;
                    record.rescue_count += 1;
                }
            }
            record.rescue_count
        };

        info!(%agent, level = level.as_str(), age_secs, rescue_count, "Escalation sent");
        if let Some(journal) = &self.journal {
            let meta = json!({"level": level, "age_secs": age_secs, "rescue_count": rescue_count});
            if let Err(err) = journal.append("ESCALATE", agent, "monitor", agent, meta) {
                warn!(%agent, "Failed to journal escalation: {}", err);
            }
        }

        if level == EscalationLevel::Rescue {
            self.maybe_release(agent, rescue_count);
        }
        true
    }

    fn maybe_release(&mut self, agent: &str, rescue_count: u32) {
        let (Some(limit), Some(coordinator)) = (self.release_after_rescues, &self.coordinator)
        else {
            return;
        };
        if limit == 0 || rescue_count < limit {
            return;
        }
        let reason = format!("no response after {rescue_count} rescues");
        match coordinator.release_owned_by(agent, &reason) {
            Ok(released) => {
                if !released.is_empty() {
                    warn!(%agent, tasks = ?released, "Released tasks of unresponsive agent");
                }
                if let Some(record) = self.records.get_mut(agent) {
                    record.rescue_count = 0;
                }
            }
            Err(err) => warn!(%agent, code = err.code(), "Failed to release tasks: {}", err),
        }
    }

    fn persist(&self) {
        let records: Vec<&ActivityRecord> = self.records.values().collect();
        let path = self.activity_path();
        if let Err(err) = write_json_atomic(&path, &records) {
            warn!(path = %path.display(), "Failed to persist activity state: {}", err);
        }
    }

    fn write_snapshots(&self, report: &TickReport, now: DateTime<Utc>) {
        let mut summary: BTreeMap<&str, usize> = ["active", "idle", "warning", "stalled"]
            .into_iter()
            .map(|name| (name, 0))
            .collect();
        let mut health_agents = serde_json::Map::new();
        let mut metric_agents = serde_json::Map::new();

        for (agent, status) in &report.statuses {
            let Some(record) = self.records.get(agent) else {
                continue;
            };
            let age_secs = age_at(record.last_activity_ts, now).as_secs();
            let status_name = status_name(*status);
            *summary.entry(status_name).or_default() += 1;

            health_agents.insert(
                agent.clone(),
                json!({
                    "status": status,
                    "age_secs": age_secs,
                    "last_activity": record.last_activity_ts,
                    "last_rescue": record.last_rescue_ts,
                }),
            );
            let counters = self.counters.get(agent).cloned().unwrap_or_default();
            metric_agents.insert(
                agent.clone(),
                json!({
                    "status": status,
                    "age_secs": age_secs,
                    "warn_sent": counters.warn_sent,
                    "rescue_sent": counters.rescue_sent,
                    "dispatch_failures": counters.dispatch_failures,
                    "rescue_count": record.rescue_count,
                }),
            );
        }

        let health = json!({
            "generated_at": now,
            "agents": health_agents,
            "summary": summary,
        });
        let metrics = json!({
            "generated_at": now,
            "ticks": self.ticks,
            "agents": metric_agents,
        });
        for (name, value) in [(HEALTH_FILE, health), (METRICS_FILE, metrics)] {
            let path = self.runtime_root.join(name);
            if let Err(err) = write_json_atomic(&path, &value) {
                warn!(path = %path.display(), "Failed to write snapshot: {}", err);
            }
        }
    }

    /// Tick every `check_interval` until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            agents = self.agents.len(),
            check_interval_secs = self.check_interval.as_secs(),
            cooldown_secs = self.cooldown.as_secs(),
            "Activity monitor started"
        );
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if !report.escalations.is_empty() {
                        debug!(escalations = report.escalations.len(), "Monitor tick complete");
                    }
                }
            }
        }
        self.persist();
        info!("Activity monitor stopped");
    }
}

fn status_name(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Active => "active",
        AgentStatus::Idle => "idle",
        AgentStatus::Warning => "warning",
        AgentStatus::Stalled => "stalled",
    }
}

/// Non-negative elapsed time; clock skew into the future reads as zero.
fn age_at(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
