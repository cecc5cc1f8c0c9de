//! Three-tier session context: persistent customer record, per-cycle runtime
//! snapshot and short-lived active task state, all keyed by `{tenant}_{contact}`.

pub mod edits;
pub mod history;
pub mod models;
pub mod store;

pub use edits::{EditError, PersistentEdit};
pub use history::format_history;
pub use models::{
    ActiveTaskContext, BookingStatus, HistoryEntry, HistoryRole, InvalidSessionKey,
    PersistentContext, QueuedMessage, ReasoningStep, RuntimeContext, SenderProfile, SessionKey,
    TaskStatus, TaskType,
};
pub use store::{
    sync_payload, ContextStore, PersistentLoad, PersistentSource, RuntimeSource, SessionSummary,
};
