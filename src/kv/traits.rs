//! Key-value storage traits shared by the lock, queue and context layers.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the backing store.
///
/// Reads may be retried (see [`super::retry`]); writes surface to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value at key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A guard key and the value it must hold for a fenced write to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub key: String,
    pub token: String,
}

/// A string key written in the same atomic step as a list push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag<'a> {
    pub key: &'a str,
    pub value: &'a [u8],
    pub ttl: Duration,
}

/// Remote string/list store with per-key expiration.
///
/// Every method is a single atomic operation at the store level. Callers in
/// different processes rely on that: `set_if_absent_with_ttl`, the `*_if_equals`
/// family and `drain_list` are the primitives the session protocol is built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a string value. Expired keys read as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Unconditionally write a value with an expiration.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Write only if the key is absent or expired. Returns whether the write happened.
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Write `key` only while `fence.key` still holds `fence.token`.
    async fn set_if_equals(
        &self,
        fence: &Fence,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Reset the expiration of `key` only if it currently holds `expected`.
    async fn expire_if_equals(&self, key: &str, expected: &[u8], ttl: Duration)
        -> StoreResult<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Delete `key` only while `fence.key` still holds `fence.token`.
    async fn delete_fenced(&self, fence: &Fence, key: &str) -> StoreResult<bool>;

    /// Delete a key of any kind. Returns whether something was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Append to a list, refreshing the list expiration, and set `flag` in the
    /// same step. Returns the new length.
    async fn push_back(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        flag: Option<Flag<'_>>,
    ) -> StoreResult<usize>;

    /// Insert `values` at the head of a list so that `values[0]` becomes the
    /// first entry, refreshing the list expiration and setting `flag` in the
    /// same step. Returns the new length.
    async fn push_front(
        &self,
        key: &str,
        values: &[Vec<u8>],
        ttl: Duration,
        flag: Option<Flag<'_>>,
    ) -> StoreResult<usize>;

    /// Read and clear a list in one step, deleting `also_delete` in the same step.
    async fn drain_list(&self, key: &str, also_delete: &[&str]) -> StoreResult<Vec<Vec<u8>>>;

    /// Number of entries in a list (0 when absent).
    async fn list_len(&self, key: &str) -> StoreResult<usize>;

    /// Remaining time to live, `None` when the key is absent.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Delete every key starting with `prefix`. Returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize>;

    /// The name of this store implementation.
    fn name(&self) -> &str;
}
