//! Load, save and TTL policy for the three context tiers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::history::format_history;
use super::models::{
    ActiveTaskContext, HistoryEntry, PersistentContext, RuntimeContext, SenderProfile, SessionKey,
};
use crate::config::TenantConfig;
use crate::kv::{self, KvStore, RetryPolicy, StoreError, StoreResult};
use crate::lock::HeldLock;
use crate::record::RecordSync;
use crate::sessions::{SessionError, SessionResult};

/// Where a persistent context came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistentSource {
    Cache,
    Supplied,
    Fetched,
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistentLoad {
    pub context: PersistentContext,
    pub source: PersistentSource,
    /// The record could not be read or parsed and `context` is a stand-in default.
    pub degraded: bool,
}

/// Inbound data a runtime context is built from.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSource<'a> {
    pub conversation_id: &'a str,
    pub sender: &'a SenderProfile,
    pub tenant: &'a TenantConfig,
    pub history: &'a [HistoryEntry],
    pub returning_customer: bool,
    pub now: DateTime<Utc>,
}

/// Read-only view of everything stored for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: String,
    pub persistent: Option<PersistentContext>,
    pub persistent_ttl_secs: Option<u64>,
    pub active: Option<ActiveTaskContext>,
    pub active_ttl_secs: Option<u64>,
    pub lock_holder: Option<String>,
    pub lock_ttl_secs: Option<u64>,
    pub queued_messages: usize,
    pub pending_marker: bool,
}

/// The sole writer of the context tiers.
pub struct ContextStore {
    kv: Arc<dyn KvStore>,
    records: Arc<dyn RecordSync>,
    retry: RetryPolicy,
    persistent_ttl: Duration,
    history_limit: usize,
}

impl ContextStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        records: Arc<dyn RecordSync>,
        retry: RetryPolicy,
        persistent_ttl: Duration,
        history_limit: usize,
    ) -> Self {
        Self {
            kv,
            records,
            retry,
            persistent_ttl,
            history_limit,
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let kv = self.kv.as_ref();
        self.retry.run(key, || kv::get_json::<T>(kv, key)).await
    }

    /// Cache tier, then the record supplied with the inbound call, then the
    /// system of record. A successfully read record is cached with the full TTL
    /// unless something is cached already. Unreadable records degrade to the
    /// default context and are never cached.
    pub async fn load_persistent(
        &self,
        key: &SessionKey,
        supplied: Option<&serde_json::Value>,
    ) -> StoreResult<PersistentLoad> {
        let cache_key = key.persistent_key();
        let mut degraded = false;

        match self.read_json::<PersistentContext>(&cache_key).await {
            Ok(Some(context)) => {
                tracing::debug!(session = %key, "persistent context loaded from cache");
                return Ok(PersistentLoad {
                    context,
                    source: PersistentSource::Cache,
                    degraded: false,
                });
            }
            Ok(None) => {}
            Err(StoreError::Corrupt { reason, .. }) => {
                tracing::warn!(session = %key, "cached persistent context rejected: {reason}");
                degraded = true;
            }
            Err(e) => return Err(e),
        }

        let (context, source) = match supplied.filter(|v| !v.is_null()) {
            Some(value) => match serde_json::from_value::<PersistentContext>(value.clone()) {
                Ok(context) => (context, PersistentSource::Supplied),
                Err(e) => {
                    tracing::warn!(session = %key, "supplied persistent record rejected: {e}");
                    degraded = true;
                    (PersistentContext::default(), PersistentSource::Default)
                }
            },
            None => match self
                .records
                .fetch_record(&key.tenant_id, &key.contact_id)
                .await
            {
                Ok(Some(context)) => (context, PersistentSource::Fetched),
                Ok(None) => (PersistentContext::default(), PersistentSource::Default),
                Err(e) => {
                    let err = SessionError::ExternalRecordUnavailable(e.to_string());
                    tracing::warn!(session = %key, "{err}; using default persistent context");
                    degraded = true;
                    (PersistentContext::default(), PersistentSource::Default)
                }
            },
        };

        if !degraded {
            let bytes = serde_json::to_vec(&context).map_err(|e| StoreError::Corrupt {
                key: cache_key.clone(),
                reason: e.to_string(),
            })?;
            self.kv
                .set_if_absent_with_ttl(&cache_key, &bytes, self.persistent_ttl)
                .await?;
        }

        Ok(PersistentLoad {
            context,
            source,
            degraded,
        })
    }

    /// Build the per-cycle runtime snapshot. Touches no storage.
    pub fn load_runtime(&self, key: &SessionKey, source: RuntimeSource<'_>) -> RuntimeContext {
        RuntimeContext {
            conversation_id: source.conversation_id.to_string(),
            tenant_id: key.tenant_id.clone(),
            contact_id: key.contact_id.clone(),
            sender: source.sender.clone(),
            tenant: source.tenant.clone(),
            history: format_history(source.history, self.history_limit, true),
            processing_started_at: source.now,
            is_returning_customer: source.returning_customer,
        }
    }

    /// Existing active task state, or a fresh one. Undecodable state is replaced.
    pub async fn load_or_create_active(&self, key: &SessionKey) -> StoreResult<ActiveTaskContext> {
        match self.read_json::<ActiveTaskContext>(&key.active_key()).await {
            Ok(Some(active)) => Ok(active),
            Ok(None) => {
                tracing::debug!(session = %key, "creating active task context");
                Ok(ActiveTaskContext::new(Utc::now()))
            }
            Err(StoreError::Corrupt { reason, .. }) => {
                tracing::warn!(session = %key, "active context rejected, starting fresh: {reason}");
                Ok(ActiveTaskContext::new(Utc::now()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save_active(
        &self,
        lock: &HeldLock,
        state: &ActiveTaskContext,
        ttl: Duration,
    ) -> SessionResult<()> {
        let key = lock.key();
        if !kv::set_json_fenced(self.kv.as_ref(), &lock.fence(), &key.active_key(), state, ttl)
            .await?
        {
            return Err(lock_lost(key));
        }
        Ok(())
    }

    /// Fenced save of the persistent tier, then a background push to the
    /// system of record whose failure is only logged.
    pub async fn save_persistent(
        &self,
        lock: &HeldLock,
        context: &PersistentContext,
        ttl: Duration,
    ) -> SessionResult<()> {
        let key = lock.key();
        if !kv::set_json_fenced(
            self.kv.as_ref(),
            &lock.fence(),
            &key.persistent_key(),
            context,
            ttl,
        )
        .await?
        {
            return Err(lock_lost(key));
        }

        let records = Arc::clone(&self.records);
        let key = key.clone();
        let context = context.clone();
        tokio::spawn(async move {
            if let Err(e) = records
                .push_record(&key.tenant_id, &key.contact_id, &context)
                .await
            {
                tracing::warn!(session = %key, "record push failed: {e}");
            }
        });
        Ok(())
    }

    pub async fn delete_active(&self, lock: &HeldLock) -> SessionResult<()> {
        let key = lock.key();
        if !self
            .kv
            .delete_fenced(&lock.fence(), &key.active_key())
            .await?
        {
            return Err(lock_lost(key));
        }
        Ok(())
    }

    /// Operator reset: every key of the session, lock and queue included.
    pub async fn delete_all(&self, key: &SessionKey) -> StoreResult<usize> {
        let removed = self.kv.delete_prefix(&key.key_prefix()).await?;
        tracing::info!(session = %key, removed, "session context cleared");
        Ok(removed)
    }

    pub async fn summary(&self, key: &SessionKey) -> StoreResult<SessionSummary> {
        let secs = |d: Option<Duration>| d.map(|d| d.as_secs());
        let lock_holder = self
            .kv
            .get(&key.lock_key())
            .await?
            .map(|t| String::from_utf8_lossy(&t).into_owned());

        Ok(SessionSummary {
            session: key.to_string(),
            persistent: self.read_json(&key.persistent_key()).await?,
            persistent_ttl_secs: secs(self.kv.ttl(&key.persistent_key()).await?),
            active: self.read_json(&key.active_key()).await?,
            active_ttl_secs: secs(self.kv.ttl(&key.active_key()).await?),
            lock_holder,
            lock_ttl_secs: secs(self.kv.ttl(&key.lock_key()).await?),
            queued_messages: self.kv.list_len(&key.queue_key()).await?,
            pending_marker: self.kv.get(&key.marker_key()).await?.is_some(),
        })
    }
}

fn lock_lost(key: &SessionKey) -> SessionError {
    SessionError::LockLost {
        session: key.to_string(),
    }
}

/// JSON object of the non-null persistent fields, as mirrored to the system of record.
pub fn sync_payload(context: &PersistentContext) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::to_value(context) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
        _ => serde_json::Map::new(),
    }
}
