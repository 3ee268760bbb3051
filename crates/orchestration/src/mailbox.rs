//! File-drop mailboxes.
//!
//! Layout per owner: `<root>/<owner>/{inbox,processing,processed}/` plus
//! `processed_index.json`. A message is claimed by renaming it from `inbox/`
//! to `processing/`; the filesystem guarantees only one scanner wins that
//! rename. The idempotency index is persisted after every mark so that a
//! crash between claim and mark only ever causes a guarded re-delivery.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::envelope::Envelope;
use fleet_common::fs::{read_json, write_json_atomic};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const INBOX_DIR: &str = "inbox";
pub const PROCESSING_DIR: &str = "processing";
pub const PROCESSED_DIR: &str = "processed";
pub const INDEX_FILE: &str = "processed_index.json";
const REJECTED_SUFFIX: &str = "rejected";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mailbox I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed message {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl TransportError {
    fn io(path: &Path, source: io::Error) -> Self {
        TransportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Io { .. } => "E_TRANSPORT_IO",
            TransportError::Malformed { .. } => "E_MALFORMED_MESSAGE",
        }
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a handler did not finish with a message.
///
/// `Retry` leaves the message unmarked and back in the inbox, so the next
/// scan delivers it again to every handler. `Failed` consumes it.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("retry later: {0}")]
    Retry(BoxError),
    #[error("{0}")]
    Failed(BoxError),
}

impl HandlerError {
    pub fn retry(err: impl Into<BoxError>) -> Self {
        HandlerError::Retry(err.into())
    }

    pub fn failed(err: impl Into<BoxError>) -> Self {
        HandlerError::Failed(err.into())
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, HandlerError::Retry(_))
    }
}

/// Consumer of delivered envelopes. Every registered handler sees every
/// newly delivered message once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Persisted `message_id -> processed_at` map, holding at most `capacity`
/// ids. Once an id is pruned, a replay of it is delivered again.
#[derive(Debug)]
pub struct IdempotencyIndex {
    path: PathBuf,
    entries: HashMap<String, DateTime<Utc>>,
    capacity: usize,
}

impl IdempotencyIndex {
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, TransportError> {
        let path = path.into();
        let entries = read_json::<HashMap<String, DateTime<Utc>>>(&path)
            .map_err(|err| TransportError::io(&path, err))?
            .unwrap_or_default();
        Ok(Self {
            path,
            entries,
            capacity: capacity.max(1),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `id` and persist the index immediately.
    pub fn mark(&mut self, id: &str, at: DateTime<Utc>) -> Result<(), TransportError> {
        self.entries.insert(id.to_string(), at);
        self.prune();
        write_json_atomic(&self.path, &self.entries)
            .map_err(|err| TransportError::io(&self.path, err))
    }

    fn prune(&mut self) {
        if self.entries.len() <= self.capacity {
            return;
        }
        let mut by_age: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|(id, at)| (id.clone(), *at))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        let excess = self.entries.len() - self.capacity;
        for (id, at) in by_age.into_iter().take(excess) {
            debug!(msg_id = %id, processed_at = %at, "Forgetting processed id past index capacity");
            self.entries.remove(&id);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub duplicates: usize,
    /// Left in the inbox for the next scan after a handler asked to retry.
    pub deferred: usize,
    pub rejected: usize,
    pub handler_errors: usize,
    pub transport_errors: usize,
}

impl DeliveryReport {
    pub fn is_empty(&self) -> bool {
        *self == DeliveryReport::default()
    }
}

impl AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
        self.rejected += other.rejected;
        self.handler_errors += other.handler_errors;
        self.transport_errors += other.transport_errors;
    }
}

/// Drop `envelope` into `<mailbox_root>/<envelope.to>/inbox/`.
///
/// The file is written under a dotted temporary name and renamed into place,
/// so scanners never pick up a partial message.
pub fn post(mailbox_root: &Path, envelope: &Envelope) -> Result<PathBuf, TransportError> {
    let inbox = mailbox_root.join(&envelope.to).join(INBOX_DIR);
    fs::create_dir_all(&inbox).map_err(|err| TransportError::io(&inbox, err))?;

    let final_path = inbox.join(envelope.file_name());
    let temp_path = inbox.join(format!(".{}.tmp", envelope.file_name()));
    let body = serde_json::to_vec_pretty(envelope).map_err(|err| TransportError::Malformed {
        path: final_path.clone(),
        reason: err.to_string(),
    })?;
    fs::write(&temp_path, body).map_err(|err| TransportError::io(&temp_path, err))?;
    fs::rename(&temp_path, &final_path).map_err(|err| TransportError::io(&final_path, err))?;

    debug!(
        to = %envelope.to,
        msg_type = %envelope.kind,
        msg_id = %envelope.id,
        "Posted message"
    );
    Ok(final_path)
}

/// One owner's mailbox directory.
pub struct Mailbox {
    owner: String,
    dir: PathBuf,
    index: IdempotencyIndex,
}

impl Mailbox {
    pub fn open(
        dir: impl Into<PathBuf>,
        owner: impl Into<String>,
        index_capacity: usize,
    ) -> Result<Self, TransportError> {
        let dir = dir.into();
        for sub in [INBOX_DIR, PROCESSING_DIR, PROCESSED_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|err| TransportError::io(&path, err))?;
        }
        let index = IdempotencyIndex::load(dir.join(INDEX_FILE), index_capacity)?;
        Ok(Self {
            owner: owner.into(),
            dir,
            index,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.dir.join(INBOX_DIR)
    }

    pub fn processing_dir(&self) -> PathBuf {
        self.dir.join(PROCESSING_DIR)
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.dir.join(PROCESSED_DIR)
    }

    pub fn index(&self) -> &IdempotencyIndex {
        &self.index
    }

    /// Return messages stranded in `processing/` by a crash to the inbox.
    pub fn recover(&self) -> Result<usize, TransportError> {
        let stranded = list_messages(&self.processing_dir())?;
        for path in &stranded {
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = self.inbox_dir().join(name);
            fs::rename(path, &target).map_err(|err| TransportError::io(path, err))?;
        }
        if !stranded.is_empty() {
            info!(
                owner = %self.owner,
                count = stranded.len(),
                "Recovered stranded messages for re-delivery"
            );
        }
        Ok(stranded.len())
    }

    /// Scan the inbox once and deliver every new message to `handlers`.
    pub async fn deliver(&mut self, handlers: &[Arc<dyn MessageHandler>]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let inbox = self.inbox_dir();
        let entries = match list_messages(&inbox) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(owner = %self.owner, "Inbox scan failed: {}", err);
                report.transport_errors += 1;
                return report;
            }
        };

        for path in entries {
            let Some(name) = path.file_name().map(|n| n.to_os_string()) else {
                continue;
            };
            let claimed = self.processing_dir().join(&name);
            match fs::rename(&path, &claimed) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(owner = %self.owner, file = ?name, "Message claimed by another scanner");
                    continue;
                }
                Err(err) => {
                    warn!(owner = %self.owner, file = ?name, "Failed to claim message: {}", err);
                    report.transport_errors += 1;
                    continue;
                }
            }

            let envelope = match parse_message(&claimed) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(owner = %self.owner, code = err.code(), "Rejecting message: {}", err);
                    let mut rejected_name = name.clone();
                    rejected_name.push(format!(".{REJECTED_SUFFIX}"));
                    self.finish(&claimed, &self.processed_dir().join(rejected_name), &mut report);
                    report.rejected += 1;
                    continue;
                }
            };

            if self.index.contains(&envelope.id) {
                debug!(owner = %self.owner, msg_id = %envelope.id, "Duplicate message skipped");
                self.finish(&claimed, &self.processed_dir().join(&name), &mut report);
                report.duplicates += 1;
                continue;
            }

            let mut retry = false;
            for handler in handlers {
                if let Err(err) = handler.handle(&envelope).await {
                    warn!(
                        owner = %self.owner,
                        msg_id = %envelope.id,
                        msg_type = %envelope.kind,
                        retry = err.is_retry(),
                        "Handler failed: {}",
                        err
                    );
                    report.handler_errors += 1;
                    retry |= err.is_retry();
                }
            }

            if retry {
                self.finish(&claimed, &inbox.join(&name), &mut report);
                report.deferred += 1;
                continue;
            }

            if let Err(err) = self.index.mark(&envelope.id, Utc::now()) {
                error!(
                    owner = %self.owner,
                    msg_id = %envelope.id,
                    "Failed to persist index: {}",
                    err
                );
                report.transport_errors += 1;
            }
            self.finish(&claimed, &self.processed_dir().join(&name), &mut report);
            report.delivered += 1;
        }

        report
    }

    fn finish(&self, from: &Path, to: &Path, report: &mut DeliveryReport) {
        if let Err(err) = fs::rename(from, to) {
            warn!(
                owner = %self.owner,
                file = %from.display(),
                "Failed to archive message: {}",
                err
            );
            report.transport_errors += 1;
        }
    }
}

fn parse_message(path: &Path) -> Result<Envelope, TransportError> {
    let raw = fs::read(path).map_err(|err| TransportError::io(path, err))?;
    serde_json::from_slice(&raw).map_err(|err| TransportError::Malformed {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// `*.json` entries of `dir`, excluding dotfiles, sorted by name.
fn list_messages(dir: &Path) -> Result<Vec<PathBuf>, TransportError> {
    let read = fs::read_dir(dir).map_err(|err| TransportError::io(dir, err))?;
    let mut paths: Vec<PathBuf> = read
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"))
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// All mailboxes of the daemon plus their handlers, scanned by one loop.
pub struct MailboxTransport {
    mailboxes: Vec<Mailbox>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    poll_interval: Duration,
}

impl MailboxTransport {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            mailboxes: Vec::new(),
            handlers: Vec::new(),
            poll_interval,
        }
    }

    pub fn add_mailbox(&mut self, mailbox: Mailbox) {
        self.mailboxes.push(mailbox);
    }

    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    pub fn recover_all(&self) -> usize {
        self.mailboxes
            .iter()
            .map(|mailbox| match mailbox.recover() {
                Ok(count) => count,
                Err(err) => {
                    warn!(owner = %mailbox.owner(), "Recovery failed: {}", err);
                    0
                }
            })
            .sum()
    }

    pub async fn deliver_all(&mut self) -> DeliveryReport {
        let mut total = DeliveryReport::default();
        for mailbox in &mut self.mailboxes {
            total += mailbox.deliver(&self.handlers).await;
        }
        total
    }

    /// Scan until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let recovered = self.recover_all();
        info!(
            mailboxes = self.mailboxes.len(),
            recovered,
            poll_ms = self.poll_interval.as_millis() as u64,
            "Mailbox transport started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.deliver_all().await;
                    if !report.is_empty() {
                        debug!(?report, "Mailbox scan complete");
                    }
                }
            }
        }
        info!("Mailbox transport stopped");
    }
}
