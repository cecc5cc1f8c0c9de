//! Inbound and outbound values of the session pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::{HistoryEntry, QueuedMessage, SenderProfile};

/// One inbound chat message, as delivered by the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub tenant_id: String,
    pub contact_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub sender: SenderProfile,
    /// Persistent record carried by the channel, used when the cache tier is empty.
    #[serde(default)]
    pub external_record: Option<serde_json::Value>,
    #[serde(default)]
    pub recent_history: Vec<HistoryEntry>,
}

impl InboundMessage {
    pub fn to_queued(&self) -> QueuedMessage {
        let id = self
            .message_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        QueuedMessage::new(id, self.content.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    /// The message was queued behind a running cycle.
    Processing,
    Replied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleOutcome {
    pub status: HandleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl HandleOutcome {
    pub fn processing() -> Self {
        Self {
            status: HandleStatus::Processing,
            reply: None,
        }
    }

    pub fn replied(reply: impl Into<String>) -> Self {
        Self {
            status: HandleStatus::Replied,
            reply: Some(reply.into()),
        }
    }
}

/// Where an inbound message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    LockAttempt,
    Queued,
    Running,
    Draining,
    Persisting,
    Released,
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::LockAttempt => "lock_attempt",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Persisting => "persisting",
            Self::Released => "released",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_parses_minimal_payload() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"tenant_id":"74274","contact_id":"12345","conversation_id":"c1","content":"hi"}"#,
        )
        .unwrap();
        assert!(msg.message_id.is_none());
        assert!(msg.recent_history.is_empty());
        assert!(msg.external_record.is_none());
        let queued = msg.to_queued();
        assert_eq!(queued.content, "hi");
        assert!(!queued.message_id.is_empty());
    }

    #[test]
    fn outcome_serializes_status_and_omits_empty_reply() {
        let json = serde_json::to_value(HandleOutcome::processing()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "processing"}));
        let json = serde_json::to_value(HandleOutcome::replied("ok")).unwrap();
        assert_eq!(json["status"], "replied");
        assert_eq!(json["reply"], "ok");
    }

    #[test]
    fn phases_display_in_snake_case() {
        assert_eq!(CyclePhase::LockAttempt.to_string(), "lock_attempt");
        assert_eq!(CyclePhase::Released.to_string(), "released");
    }
}
