//! Fleet configuration (`fleet.toml`).
//!
//! A single [`FleetConfig`] is parsed once at startup and handed to every
//! component constructor. Nothing in the workspace reads a global working
//! directory: all roots come from here.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "FLEET_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "fleet.toml";
pub const DEFAULT_SUPERVISOR: &str = "captain";
pub const DEFAULT_ORCHESTRATOR: &str = "orchestrator";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_INDEX_CAPACITY: usize = 10_000;
pub const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no agents configured; `agents` must list at least one worker")]
    NoAgents,
    #[error("agent '{0}' is listed more than once")]
    DuplicateAgent(String),
    #[error("agent name '{0}' is not usable as a mailbox directory")]
    InvalidAgentName(String),
    #[error(
        "thresholds must satisfy active_grace < warn_threshold < stall_threshold \
         (got {active_grace} / {warn_threshold} / {stall_threshold})"
    )]
    ThresholdOrder {
        active_grace: u64,
        warn_threshold: u64,
        stall_threshold: u64,
    },
    #[error("`{0}` must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("dispatch mode `hook` requires `dispatch.command`")]
    MissingHookCommand,
    #[error("storage root {path} is not usable: {source}")]
    StorageRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "E_CONFIG_READ",
            ConfigError::Parse { .. } => "E_CONFIG_PARSE",
            ConfigError::NoAgents => "E_NO_AGENTS",
            ConfigError::DuplicateAgent(_) | ConfigError::InvalidAgentName(_) => "E_AGENT_NAME",
            ConfigError::ThresholdOrder { .. } => "E_THRESHOLDS",
            ConfigError::ZeroInterval(_) => "E_INTERVAL",
            ConfigError::MissingHookCommand => "E_DISPATCH_CONFIG",
            ConfigError::StorageRoot { .. } => "E_STORAGE_ROOT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub agents: Vec<String>,
    #[serde(default = "default_supervisor")]
    pub supervisor: String,
    #[serde(default = "default_orchestrator")]
    pub orchestrator: String,
    pub mailbox_root: PathBuf,
    pub task_store_root: PathBuf,
    pub runtime_root: PathBuf,
    /// Seconds.
    pub active_grace: u64,
    pub warn_threshold: u64,
    pub stall_threshold: u64,
    pub check_interval: u64,
    pub rescue_cooldown: u64,
    #[serde(default)]
    pub monitor: MonitorCfg,
    #[serde(default)]
    pub mailbox: MailboxCfg,
    #[serde(default)]
    pub dispatch: DispatchCfg,
    /// Extra activity artifacts per agent, on top of the mailbox heartbeat file.
    #[serde(default)]
    pub signals: HashMap<String, Vec<PathBuf>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorCfg {
    #[serde(default)]
    pub rescue_fresh_session: bool,
    #[serde(default)]
    pub release_after_rescues: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxCfg {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Processed ids remembered per mailbox. Replays of ids pruned past this
    /// bound are delivered again.
    #[serde(default = "default_index_capacity")]
    pub index_capacity: usize,
}

impl Default for MailboxCfg {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            index_capacity: DEFAULT_INDEX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    #[default]
    FileDrop,
    Hook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCfg {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DispatchCfg {
    fn default() -> Self {
        Self {
            mode: DispatchMode::FileDrop,
            command: None,
            timeout_secs: DEFAULT_DISPATCH_TIMEOUT_SECS,
        }
    }
}

fn default_supervisor() -> String {
    DEFAULT_SUPERVISOR.to_string()
}

fn default_orchestrator() -> String {
    DEFAULT_ORCHESTRATOR.to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_index_capacity() -> usize {
    DEFAULT_INDEX_CAPACITY
}

fn default_dispatch_timeout_secs() -> u64 {
    DEFAULT_DISPATCH_TIMEOUT_SECS
}

/// Resolve which config file to use: explicit flag, then `FLEET_CONFIG`,
/// then `./fleet.toml` when it exists.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .or_else(|| {
            let candidate = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
            if candidate.is_file() {
                Some(candidate)
            } else {
                None
            }
        })
}

impl FleetConfig {
    /// Read, parse and validate a config file. Relative roots are resolved
    /// against the directory holding the file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: FleetConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(base) = path.parent() {
            config.resolve_relative_roots(base);
        }
        config.validate()?;
        info!(
            agents = config.agents.len(),
            "Loaded fleet configuration from {}",
            path.display()
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative_roots(&mut self, base: &Path) {
        for root in [
            &mut self.mailbox_root,
            &mut self.task_store_root,
            &mut self.runtime_root,
        ] {
            if root.is_relative() {
                *root = base.join(&*root);
            }
        }
        for paths in self.signals.values_mut() {
            for path in paths.iter_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }

        let mut seen = HashSet::new();
        for agent in self
            .agents
            .iter()
            .chain([&self.supervisor, &self.orchestrator])
        {
            if !is_valid_agent_name(agent) {
                return Err(ConfigError::InvalidAgentName(agent.clone()));
            }
        }
        for agent in &self.agents {
            if !seen.insert(agent.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.clone()));
            }
        }

        if !(self.active_grace < self.warn_threshold && self.warn_threshold < self.stall_threshold)
        {
            return Err(ConfigError::ThresholdOrder {
                active_grace: self.active_grace,
                warn_threshold: self.warn_threshold,
                stall_threshold: self.stall_threshold,
            });
        }
        if self.check_interval == 0 {
            return Err(ConfigError::ZeroInterval("check_interval"));
        }
        if self.mailbox.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("mailbox.poll_interval_ms"));
        }
        if self.dispatch.mode == DispatchMode::Hook
            && self
                .dispatch
                .command
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(ConfigError::MissingHookCommand);
        }
        Ok(())
    }

    /// Create every storage root and prove it is writable. Failures here are
    /// fatal at startup.
    pub fn ensure_roots(&self) -> Result<(), ConfigError> {
        let mut roots = vec![
            self.mailbox_root.clone(),
            self.task_store_root.clone(),
            self.runtime_root.clone(),
        ];
        roots.extend(self.mailbox_owners().map(|agent| self.mailbox_dir(agent)));

        for root in roots {
            fs::create_dir_all(&root).map_err(|source| ConfigError::StorageRoot {
                path: root.clone(),
                source,
            })?;
            let probe = root.join(".fleet-probe");
            fs::write(&probe, b"ok")
                .and_then(|_| fs::remove_file(&probe))
                .map_err(|source| ConfigError::StorageRoot {
                    path: root.clone(),
                    source,
                })?;
            debug!(root = %root.display(), "Storage root ready");
        }
        Ok(())
    }

    /// Every identity that owns a mailbox: workers, supervisor, orchestrator.
    pub fn mailbox_owners(&self) -> impl Iterator<Item = &str> {
        let mut owners: Vec<&str> = self.agents.iter().map(String::as_str).collect();
        for extra in [self.supervisor.as_str(), self.orchestrator.as_str()] {
            if !owners.contains(&extra) {
                owners.push(extra);
            }
        }
        owners.into_iter()
    }

    pub fn mailbox_dir(&self, agent: &str) -> PathBuf {
        self.mailbox_root.join(agent)
    }

    pub fn active_grace(&self) -> Duration {
        Duration::from_secs(self.active_grace)
    }

    pub fn warn_threshold(&self) -> Duration {
        Duration::from_secs(self.warn_threshold)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn rescue_cooldown(&self) -> Duration {
        Duration::from_secs(self.rescue_cooldown)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.mailbox.poll_interval_ms)
    }
}

/// Agent names double as directory names under the mailbox root.
pub fn is_valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
