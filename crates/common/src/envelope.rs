use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const SCHEMA_VERSION: &str = "1.0";

/// Kind of a mailbox message. Unknown kinds are kept verbatim as free-form
/// notes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Task,
    Sync,
    Resume,
    Verify,
    Ping,
    FsmRequest,
    FsmUpdate,
    Release,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Task => "task",
            MessageType::Sync => "sync",
            MessageType::Resume => "resume",
            MessageType::Verify => "verify",
            MessageType::Ping => "ping",
            MessageType::FsmRequest => "fsm_request",
            MessageType::FsmUpdate => "fsm_update",
            MessageType::Release => "release",
            MessageType::Other(raw) => raw.as_str(),
        }
    }

    /// Command types are handled by the router itself; everything else is
    /// content meant for a worker.
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            MessageType::Ping
                | MessageType::Sync
                | MessageType::Resume
                | MessageType::FsmRequest
                | MessageType::FsmUpdate
                | MessageType::Release
        )
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "task" => MessageType::Task,
            "sync" => MessageType::Sync,
            "resume" => MessageType::Resume,
            "verify" => MessageType::Verify,
            "ping" => MessageType::Ping,
            "fsm_request" => MessageType::FsmRequest,
            "fsm_update" => MessageType::FsmUpdate,
            "release" => MessageType::Release,
            _ => MessageType::Other(value),
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        MessageType::from(value.to_string())
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable message exchanged through mailboxes.
///
/// Missing `id` gets a fresh UUID; missing `correlation_id`/`causation_id`
/// fall back to `id`, so the first message of an exchange roots its own
/// causal chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEnvelope")]
pub struct Envelope {
    pub id: String,
    pub correlation_id: String,
    pub causation_id: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    pub to: String,
    pub payload: Value,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    causation_id: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    schema_version: Option<String>,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    payload: Value,
}

impl From<RawEnvelope> for Envelope {
    fn from(raw: RawEnvelope) -> Self {
        let id = raw
            .id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = raw
            .correlation_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        let causation_id = raw
            .causation_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| id.clone());

        Envelope {
            id,
            correlation_id,
            causation_id,
            created_at: raw.created_at.unwrap_or_else(Utc::now),
            schema_version: raw
                .schema_version
                .unwrap_or_else(|| SCHEMA_VERSION.to_string()),
            kind: raw.kind,
            from: raw.from,
            to: raw.to,
            payload: raw.payload,
        }
    }
}

impl Envelope {
    pub fn new(
        kind: impl Into<MessageType>,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: Value,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            correlation_id: id.clone(),
            causation_id: id.clone(),
            id,
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
            kind: kind.into(),
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    /// Build a response to this message: same correlation, caused by this
    /// message, addressed back to its sender.
    pub fn reply(&self, kind: impl Into<MessageType>, payload: Value) -> Self {
        let mut reply = Envelope::new(kind, self.to.clone(), self.from.clone(), payload);
        reply.correlation_id = self.correlation_id.clone();
        reply.causation_id = self.id.clone();
        reply
    }

    /// Continue an existing causal chain from `cause` without swapping
    /// sender and recipient.
    pub fn caused_by(mut self, cause: &Envelope) -> Self {
        self.correlation_id = cause.correlation_id.clone();
        self.causation_id = cause.id.clone();
        self
    }

    /// File name that sorts lexically by creation time.
    pub fn file_name(&self) -> String {
        format!(
            "{}Z_{}_{}.json",
            self.created_at.format("%Y%m%dT%H%M%S%.6f"),
            sanitize(self.kind.as_str()),
            sanitize(&self.id)
        )
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_ids_default_to_fresh_id() {
        let env: Envelope = serde_json::from_value(json!({
            "type": "ping",
            "from": "W1",
            "to": "orchestrator",
            "payload": {"n": 1}
        }))
        .unwrap();

        assert!(!env.id.is_empty());
        assert_eq!(env.correlation_id, env.id);
        assert_eq!(env.causation_id, env.id);
        assert_eq!(env.kind, MessageType::Ping);
        assert_eq!(env.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn explicit_ids_are_preserved() {
        let env: Envelope = serde_json::from_value(json!({
            "id": "m-2",
            "correlation_id": "m-1",
            "causation_id": "m-1",
            "type": "note",
            "from": "W1",
            "to": "W2",
        }))
        .unwrap();

        assert_eq!(env.id, "m-2");
        assert_eq!(env.correlation_id, "m-1");
        assert_eq!(env.kind, MessageType::Other("note".into()));
        assert!(!env.kind.is_command());
        assert_eq!(env.payload, Value::Null);
    }

    #[test]
    fn reply_links_causal_chain() {
        let request = Envelope::new(MessageType::FsmRequest, "W1", "orchestrator", json!({}));
        let reply = request.reply("fsm_result", json!({"ok": true}));

        assert_eq!(reply.from, "orchestrator");
        assert_eq!(reply.to, "W1");
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.causation_id, request.id);
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn serialized_type_field_round_trips_known_kinds() {
        let env = Envelope::new(MessageType::FsmUpdate, "a", "b", json!({}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "fsm_update");
    }

    #[test]
    fn file_names_sort_by_creation_time() {
        let mut first = Envelope::new(MessageType::Task, "o", "W1", json!({}));
        let mut second = first.clone();
        first.created_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 1_000).unwrap();
        second.created_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 2_000).unwrap();
        second.id = "a/../b".into();

        assert!(first.file_name() < second.file_name());
        assert!(second.file_name().ends_with("_task_a____b.json"));
    }
}
