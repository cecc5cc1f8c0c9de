use thiserror::Error;

use crate::kv::StoreError;

/// Failures of a session cycle. A busy lock is not an error: see
/// [`crate::lock::LockOutcome::Busy`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// A fenced write or lock refresh found another holder (or no holder).
    #[error("session lock lost for {session}")]
    LockLost { session: String },

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("system of record unavailable: {0}")]
    ExternalRecordUnavailable(String),

    /// The reasoning engine errored, panicked or overran its step deadline.
    #[error("reasoning engine fault: {0}")]
    EngineFault(String),

    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),
}

impl SessionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LockLost { .. } => "lock_lost",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::ExternalRecordUnavailable(_) => "external_record_unavailable",
            Self::EngineFault(_) => "engine_fault",
            Self::UnknownTenant(_) => "unknown_tenant",
        }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
