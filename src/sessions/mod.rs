//! Session cycles: one lock holder per `{tenant}_{contact}`, everything else queues.

pub mod error;
pub mod orchestrator;
pub mod traits;


pub use error::{SessionError, SessionResult};
pub use orchestrator::{
    SessionOrchestrator, BUSY_REPLY, CONFIG_ISSUE_REPLY, DEGRADED_REPLY, FALLBACK_REPLY,
};
pub use traits::{CyclePhase, HandleOutcome, HandleStatus, InboundMessage};
