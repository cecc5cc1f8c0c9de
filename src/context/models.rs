//! The three context tiers and the values that move between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::config::TenantConfig;

/// Ids that would make one session's keys overlap another's.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidSessionKey {
    #[error("tenant_id and contact_id are required")]
    Empty,
    #[error("tenant id '{0}' must not contain '_' or ':'")]
    Tenant(String),
    #[error("contact id '{0}' must not contain ':'")]
    Contact(String),
}

/// Composite key identifying one conversational session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub tenant_id: String,
    pub contact_id: String,
}

impl SessionKey {
    pub fn new(tenant_id: impl Into<String>, contact_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            contact_id: contact_id.into(),
        }
    }

    /// Like [`SessionKey::new`], for ids from outside the process. The tenant
    /// id may hold neither separator; the contact id may not hold `:`.
    pub fn parse(
        tenant_id: impl Into<String>,
        contact_id: impl Into<String>,
    ) -> Result<Self, InvalidSessionKey> {
        let key = Self::new(tenant_id, contact_id);
        if key.tenant_id.trim().is_empty() || key.contact_id.trim().is_empty() {
            return Err(InvalidSessionKey::Empty);
        }
        if key.tenant_id.contains(['_', ':']) {
            return Err(InvalidSessionKey::Tenant(key.tenant_id));
        }
        if key.contact_id.contains(':') {
            return Err(InvalidSessionKey::Contact(key.contact_id));
        }
        Ok(key)
    }

    /// `{tenant}_{contact}`, the prefix shared by every tier key.
    pub fn base(&self) -> String {
        format!("{}_{}", self.tenant_id, self.contact_id)
    }

    pub fn active_key(&self) -> String {
        format!("{}:active_context", self.base())
    }

    pub fn persistent_key(&self) -> String {
        format!("{}:persistent_context", self.base())
    }

    pub fn lock_key(&self) -> String {
        format!("{}:session_lock", self.base())
    }

    pub fn queue_key(&self) -> String {
        format!("{}:message_queue", self.base())
    }

    pub fn marker_key(&self) -> String {
        format!("{}:new_messages", self.base())
    }

    /// Prefix matching every key of this session and no other.
    pub fn key_prefix(&self) -> String {
        format!("{}:", self.base())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.tenant_id, self.contact_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Scheduled,
    Completed,
    Cancelled,
}

/// Durable customer record, cached for 30 days and mirrored to the system of record.
///
/// Unknown fields are rejected so a drifted record never silently loses data on
/// the next save; the loader treats that rejection as a degraded load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistentContext {
    pub preferred_name: Option<String>,
    pub preferred_phone: Option<String>,
    pub preferred_email: Option<String>,

    pub dependent_name: Option<String>,
    /// YYYY-MM-DD
    pub dependent_dob: Option<String>,
    /// YYYY-MM-DD
    pub preferred_start_date: Option<String>,

    pub crm_person_id: Option<u64>,
    pub crm_deal_id: Option<u64>,

    pub booking_activity_id: Option<u64>,
    pub booking_date: Option<String>,
    pub booking_time: Option<String>,
    pub booking_booked_at: Option<DateTime<Utc>>,
    pub booking_status: Option<BookingStatus>,

    pub callback_requested: bool,
    pub callback_preference: Option<String>,
    pub callback_date: Option<String>,
    pub callback_requested_at: Option<DateTime<Utc>>,
    pub callback_activity_id: Option<u64>,
}

impl PersistentContext {
    /// True when nothing is known about the customer yet.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Contact details the messaging channel knows about the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
    System,
}

/// One entry of the conversation history supplied with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
    /// Unix seconds.
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// Per-cycle snapshot built from inbound data. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContext {
    pub conversation_id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub sender: SenderProfile,
    pub tenant: TenantConfig,
    pub history: String,
    pub processing_started_at: DateTime<Utc>,
    pub is_returning_customer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Booking,
    Callback,
    Reschedule,
    Faq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    CollectingInfo,
    Processing,
    Completed,
}

/// One thought/action/observation step recorded by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReasoningStep {
    pub cycle: u32,
    pub step: u32,
    pub thought: String,
    pub action: String,
    pub observation: String,
    pub timestamp: DateTime<Utc>,
}

/// A message that arrived while the session was locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueuedMessage {
    pub message_id: String,
    pub content: String,
    pub enqueued_at: DateTime<Utc>,
    /// Engine faults this message has been part of.
    #[serde(default)]
    pub attempts: u32,
}

impl QueuedMessage {
    pub fn new(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            content: content.into(),
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }
}

/// Short-lived multi-step task state, kept for one hour after the last write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActiveTaskContext {
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub task_status: Option<TaskStatus>,
    #[serde(default)]
    pub task_data: BTreeMap<String, String>,
    #[serde(default)]
    pub trace: Vec<ReasoningStep>,
    /// Messages folded into the session but not yet consumed by the engine.
    #[serde(default)]
    pub pending: Vec<QueuedMessage>,
    pub session_started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub cycles_completed: u32,
}

impl ActiveTaskContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            task_type: None,
            task_status: None,
            task_data: BTreeMap::new(),
            trace: Vec::new(),
            pending: Vec::new(),
            session_started_at: now,
            last_activity_at: now,
            cycles_completed: 0,
        }
    }

    /// A resolved task has nothing left to remember and is deleted instead of saved.
    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
            && (self.task_status == Some(TaskStatus::Completed) || self.task_type.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_keys_share_base() {
        let key = SessionKey::new("74274", "12345");
        assert_eq!(key.base(), "74274_12345");
        assert_eq!(key.active_key(), "74274_12345:active_context");
        assert_eq!(key.persistent_key(), "74274_12345:persistent_context");
        assert_eq!(key.lock_key(), "74274_12345:session_lock");
        assert_eq!(key.queue_key(), "74274_12345:message_queue");
        assert_eq!(key.marker_key(), "74274_12345:new_messages");
        assert!(key.lock_key().starts_with(&key.key_prefix()));
        assert_eq!(key.to_string(), key.base());
    }

    #[test]
    fn parse_rejects_ids_that_overlap_other_sessions() {
        assert!(SessionKey::parse("74274", "12345").is_ok());
        assert!(SessionKey::parse("74274", "ana_b").is_ok());
        assert_eq!(SessionKey::parse("74274", " "), Err(InvalidSessionKey::Empty));
        assert_eq!(
            SessionKey::parse("7_4", "1"),
            Err(InvalidSessionKey::Tenant("7_4".into()))
        );
        assert_eq!(
            SessionKey::parse("74274", "1:x"),
            Err(InvalidSessionKey::Contact("1:x".into()))
        );

        // "1:x" would otherwise sit under the key prefix of contact "1".
        let neighbour = SessionKey::new("74274", "1:x");
        assert!(neighbour
            .active_key()
            .starts_with(&SessionKey::new("74274", "1").key_prefix()));
    }

    #[test]
    fn persistent_rejects_unknown_fields() {
        let ok: PersistentContext =
            serde_json::from_str(r#"{"preferred_name":"Ana","crm_deal_id":42}"#).unwrap();
        assert_eq!(ok.preferred_name.as_deref(), Some("Ana"));
        assert_eq!(ok.crm_deal_id, Some(42));
        assert!(!ok.callback_requested);

        let err = serde_json::from_str::<PersistentContext>(r#"{"favourite_colour":"red"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn active_rejects_unknown_fields() {
        let now = Utc::now();
        let mut json = serde_json::to_value(ActiveTaskContext::new(now)).unwrap();
        assert!(serde_json::from_value::<ActiveTaskContext>(json.clone()).is_ok());

        json["mood"] = serde_json::json!("impatient");
        assert!(serde_json::from_value::<ActiveTaskContext>(json).is_err());
    }

    #[test]
    fn queued_message_without_attempts_starts_at_zero() {
        let msg: QueuedMessage = serde_json::from_str(
            r#"{"message_id":"m1","content":"hi","enqueued_at":"2026-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(msg.attempts, 0);
        assert!(serde_json::from_str::<QueuedMessage>(
            r#"{"message_id":"m1","content":"hi","enqueued_at":"2026-03-01T10:00:00Z","channel":"sms"}"#
        )
        .is_err());
    }

    #[test]
    fn booking_status_uses_snake_case() {
        let ctx = PersistentContext {
            booking_status: Some(BookingStatus::Cancelled),
            ..PersistentContext::default()
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["booking_status"], "cancelled");
    }

    #[test]
    fn resolution_rules() {
        let now = Utc::now();
        let mut active = ActiveTaskContext::new(now);
        assert!(active.is_resolved());

        active.task_type = Some(TaskType::Booking);
        active.task_status = Some(TaskStatus::CollectingInfo);
        assert!(!active.is_resolved());

        active.task_status = Some(TaskStatus::Completed);
        assert!(active.is_resolved());

        active.pending.push(QueuedMessage::new("m1", "still there?"));
        assert!(!active.is_resolved());
    }
}
