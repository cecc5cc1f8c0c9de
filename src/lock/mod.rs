//! Exclusive, expiring per-session lock with token fencing.
//!
//! The lock is a single key holding the holder's token. Acquire is
//! set-if-absent with a TTL; extend and release are compare-and-refresh and
//! compare-and-delete on that token, so a holder whose lock expired and was
//! taken over can never touch the new holder's lock.

use std::sync::Arc;
use std::time::Duration;

use crate::context::SessionKey;
use crate::kv::{Fence, KvStore, StoreResult};

/// Proof of lock ownership for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    key: SessionKey,
    lock_key: String,
    token: String,
}

impl HeldLock {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Guard for writes that must only land while this lock is still held.
    pub fn fence(&self) -> Fence {
        Fence {
            key: self.lock_key.clone(),
            token: self.token.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(HeldLock),
    Busy,
}

pub struct SessionLockManager {
    kv: Arc<dyn KvStore>,
    node: String,
}

impl SessionLockManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        let node = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "turnstile".to_string());
        Self { kv, node }
    }

    /// A fresh token per attempt: `{hostname}-{uuid}`.
    fn new_token(&self) -> String {
        format!("{}-{}", self.node, uuid::Uuid::new_v4())
    }

    /// Try once to take the lock. Never blocks or retries.
    pub async fn acquire(&self, key: &SessionKey, ttl: Duration) -> StoreResult<LockOutcome> {
        let lock_key = key.lock_key();
        let token = self.new_token();
        if self
            .kv
            .set_if_absent_with_ttl(&lock_key, token.as_bytes(), ttl)
            .await?
        {
            tracing::debug!(session = %key, token = %token, "session lock acquired");
            Ok(LockOutcome::Acquired(HeldLock {
                key: key.clone(),
                lock_key,
                token,
            }))
        } else {
            tracing::debug!(session = %key, "session lock busy");
            Ok(LockOutcome::Busy)
        }
    }

    /// Refresh the TTL. `false` means the lock expired or changed hands.
    pub async fn extend(&self, held: &HeldLock, ttl: Duration) -> StoreResult<bool> {
        self.kv
            .expire_if_equals(&held.lock_key, held.token.as_bytes(), ttl)
            .await
    }

    /// Release if still ours. A foreign or missing lock is left untouched.
    pub async fn release(&self, held: &HeldLock) -> StoreResult<bool> {
        let released = self
            .kv
            .delete_if_equals(&held.lock_key, held.token.as_bytes())
            .await?;
        if released {
            tracing::debug!(session = %held.key, token = %held.token, "session lock released");
        } else {
            tracing::debug!(
                session = %held.key,
                token = %held.token,
                "session lock no longer ours; release skipped"
            );
        }
        Ok(released)
    }

    /// Current holder token and its remaining TTL, if locked.
    pub async fn holder(&self, key: &SessionKey) -> StoreResult<Option<(String, Duration)>> {
        let lock_key = key.lock_key();
        let Some(token) = self.kv.get(&lock_key).await? else {
            return Ok(None);
        };
        let ttl = self.kv.ttl(&lock_key).await?.unwrap_or_default();
        Ok(Some((String::from_utf8_lossy(&token).into_owned(), ttl)))
    }
}
