//! Reasoning engine boundary: value objects in, value objects out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{
    ActiveTaskContext, PersistentContext, PersistentEdit, QueuedMessage, RuntimeContext,
};

/// Everything the engine sees for one reasoning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningInput {
    pub persistent: PersistentContext,
    pub runtime: RuntimeContext,
    pub active: ActiveTaskContext,
    /// Messages not yet shown to the engine, oldest first.
    pub new_messages: Vec<QueuedMessage>,
    /// 1-based cycle and step numbers within this invocation.
    pub cycle: u32,
    pub step: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Engine answers with unknown fields are rejected and count as a fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReasoningOutcome {
    /// Replacement active task state.
    pub active: ActiveTaskContext,
    #[serde(default)]
    pub reply: Option<String>,
    #[serde(default)]
    pub persistent_edits: Vec<PersistentEdit>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// No further step is needed for this cycle.
    #[serde(default)]
    pub done: bool,
}

/// Produces the next active state from the current one. Never touches storage.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn reason(&self, input: ReasoningInput) -> anyhow::Result<ReasoningOutcome>;

    /// The name of this engine.
    fn name(&self) -> &str;
}
