//! Shared key-value store: the only coordination medium between handlers.

pub mod in_memory;
pub mod retry;
pub mod sqlite;
pub mod traits;

pub use in_memory::InMemoryKvStore;
pub use retry::RetryPolicy;
pub use sqlite::SqliteKvStore;
pub use traits::{Fence, Flag, KvStore, StoreError, StoreResult};

use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StoreConfig;

/// Factory: create the configured store backend.
pub fn create_kv_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryKvStore::new())),
        "sqlite" => {
            let path = PathBuf::from(shellexpand::tilde(&config.path).into_owned());
            let store =
                SqliteKvStore::open(&path, Duration::from_millis(config.busy_timeout_ms))?;
            Ok(Arc::new(store))
        }
        other if other.trim().is_empty() => {
            anyhow::bail!("store.backend cannot be empty. Supported values: memory, sqlite")
        }
        other => anyhow::bail!("Unknown store backend '{other}'. Supported values: memory, sqlite"),
    }
}

/// Read and decode a JSON value. Undecodable bytes are reported as [`StoreError::Corrupt`].
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        None => Ok(None),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

pub async fn set_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> StoreResult<()> {
    let bytes = encode(key, value)?;
    store.set_with_ttl(key, &bytes, ttl).await
}

/// Fenced variant of [`set_json`]. Returns `false` when the fence no longer holds.
pub async fn set_json_fenced<T: Serialize + Sync>(
    store: &dyn KvStore,
    fence: &Fence,
    key: &str,
    value: &T,
    ttl: Duration,
) -> StoreResult<bool> {
    let bytes = encode(key, value)?;
    store.set_if_equals(fence, key, &bytes, ttl).await
}

fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
