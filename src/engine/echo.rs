//! Deterministic engine that acknowledges what it was sent.

use async_trait::async_trait;
use chrono::Utc;

use super::traits::{ReasoningEngine, ReasoningInput, ReasoningOutcome};
use crate::context::{ReasoningStep, TaskStatus};

/// Finishes every cycle in one step with an acknowledgment that quotes each
/// new message. Useful for wiring checks and as the default engine.
pub struct EchoEngine;

#[async_trait]
impl ReasoningEngine for EchoEngine {
    async fn reason(&self, input: ReasoningInput) -> anyhow::Result<ReasoningOutcome> {
        let ReasoningInput {
            persistent,
            runtime,
            mut active,
            new_messages,
            cycle,
            step,
        } = input;

        let name = persistent
            .preferred_name
            .or(runtime.sender.display_name)
            .map(|n| format!(" {n}"))
            .unwrap_or_default();
        let reply = if new_messages.is_empty() {
            None
        } else {
            let quoted: Vec<String> = new_messages
                .iter()
                .map(|m| format!("\"{}\"", m.content.trim()))
                .collect();
            Some(format!(
                "Hi{name}, thanks for reaching {}. We received: {}",
                if runtime.tenant.name.is_empty() {
                    "us"
                } else {
                    runtime.tenant.name.as_str()
                },
                quoted.join(", ")
            ))
        };

        let now = Utc::now();
        active.trace.push(ReasoningStep {
            cycle,
            step,
            thought: format!("{} new message(s)", new_messages.len()),
            action: "acknowledge".into(),
            observation: String::new(),
            timestamp: now,
        });
        if active.task_type.is_some() {
            active.task_status = Some(TaskStatus::Completed);
        }
        active.last_activity_at = now;

        Ok(ReasoningOutcome {
            active,
            reply,
            persistent_edits: Vec::new(),
            tool_calls: Vec::new(),
            done: true,
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;
    use crate::context::{
        ActiveTaskContext, PersistentContext, QueuedMessage, RuntimeContext, SenderProfile,
    };

    fn input(messages: Vec<QueuedMessage>) -> ReasoningInput {
        let now = Utc::now();
        ReasoningInput {
            persistent: PersistentContext::default(),
            runtime: RuntimeContext {
                conversation_id: "c1".into(),
                tenant_id: "t".into(),
                contact_id: "c".into(),
                sender: SenderProfile {
                    display_name: Some("Ana".into()),
                    phone: None,
                },
                tenant: TenantConfig {
                    name: "Harbour".into(),
                    ..TenantConfig::default()
                },
                history: String::new(),
                processing_started_at: now,
                is_returning_customer: false,
            },
            active: ActiveTaskContext::new(now),
            new_messages: messages,
            cycle: 1,
            step: 1,
        }
    }

    #[tokio::test]
    async fn quotes_every_new_message() {
        let out = EchoEngine
            .reason(input(vec![
                QueuedMessage::new("1", "What are your hours?"),
                QueuedMessage::new("2", "Do you have space in Sept?"),
            ]))
            .await
            .unwrap();
        let reply = out.reply.unwrap();
        assert!(reply.starts_with("Hi Ana, thanks for reaching Harbour."));
        assert!(reply.contains("\"What are your hours?\", \"Do you have space in Sept?\""));
        assert!(out.done);
        assert_eq!(out.active.trace.len(), 1);
    }

    #[tokio::test]
    async fn no_messages_no_reply() {
        let out = EchoEngine.reason(input(Vec::new())).await.unwrap();
        assert!(out.reply.is_none());
        assert!(out.done);
    }
}
