//! In-process key-value store with per-key expiration.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use super::traits::{Fence, Flag, KvStore, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// A store backed by a mutex-protected hash map.
///
/// Every trait call takes the lock exactly once, which makes each operation
/// atomic with respect to all other callers sharing the same `Arc`. Expiry uses
/// `tokio::time::Instant` so paused-clock tests can step through TTLs.
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn holds(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        expected: &[u8],
        now: Instant,
    ) -> bool {
        matches!(
            Self::live(entries, key, now).map(|e| &e.value),
            Some(Value::Str(v)) if v.as_slice() == expected
        )
    }
}

impl InMemoryKvStore {
    /// Apply `edit` to the live list at `key` (created when absent or not a
    /// list) and move its expiration to `expires_at`. Returns the new length.
    fn live_list(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        expires_at: Instant,
        now: Instant,
        edit: impl FnOnce(&mut VecDeque<Vec<u8>>),
    ) -> usize {
        if !matches!(
            Self::live(entries, key, now).map(|e| &e.value),
            Some(Value::List(_))
        ) {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(VecDeque::new()),
                    expires_at,
                },
            );
        }
        match entries.get_mut(key) {
            Some(Entry {
                value: Value::List(list),
                expires_at: exp,
            }) => {
                edit(list);
                *exp = expires_at;
                list.len()
            }
            _ => 0,
        }
    }

    fn raise(entries: &mut HashMap<String, Entry>, flag: Option<Flag<'_>>, now: Instant) {
        if let Some(flag) = flag {
            entries.insert(
                flag.key.to_string(),
                Entry {
                    value: Value::Str(flag.value.to_vec()),
                    expires_at: now + flag.ttl,
                },
            );
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(match Self::live(&mut entries, key, now).map(|e| &e.value) {
            Some(Value::Str(v)) => Some(v.clone()),
            _ => None,
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_vec()),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_vec()),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn set_if_equals(
        &self,
        fence: &Fence,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !Self::holds(&mut entries, &fence.key, fence.token.as_bytes(), now) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_vec()),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !Self::holds(&mut entries, key, expected, now) {
            return Ok(false);
        }
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = now + ttl;
        }
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !Self::holds(&mut entries, key, expected, now) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn delete_fenced(&self, fence: &Fence, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if !Self::holds(&mut entries, &fence.key, fence.token.as_bytes(), now) {
            return Ok(false);
        }
        entries.remove(key);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let existed = Self::live(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn push_back(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        flag: Option<Flag<'_>>,
    ) -> StoreResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let len = Self::live_list(&mut entries, key, now + ttl, now, |list| {
            list.push_back(value.to_vec());
        });
        Self::raise(&mut entries, flag, now);
        Ok(len)
    }

    async fn push_front(
        &self,
        key: &str,
        values: &[Vec<u8>],
        ttl: Duration,
        flag: Option<Flag<'_>>,
    ) -> StoreResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let len = Self::live_list(&mut entries, key, now + ttl, now, |list| {
            for value in values.iter().rev() {
                list.push_front(value.clone());
            }
        });
        Self::raise(&mut entries, flag, now);
        Ok(len)
    }

    async fn drain_list(&self, key: &str, also_delete: &[&str]) -> StoreResult<Vec<Vec<u8>>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let drained: Vec<Vec<u8>> = match Self::live(&mut entries, key, now).map(|e| &e.value) {
            Some(Value::List(list)) => list.iter().cloned().collect(),
            _ => Vec::new(),
        };
        entries.remove(key);
        for extra in also_delete {
            entries.remove(*extra);
        }
        Ok(drained)
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(match Self::live(&mut entries, key, now).map(|e| &e.value) {
            Some(Value::List(list)) => list.len(),
            _ => 0,
        })
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key, now).map(|e| e.expires_at - now))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let store = InMemoryKvStore::new();
        store
            .set_with_ttl("k", b"v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_keys_read_as_absent() {
        let store = InMemoryKvStore::new();
        store
            .set_with_ttl("k", b"v", Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.ttl("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_succeeds_after_expiry() {
        let store = InMemoryKvStore::new();
        assert!(store
            .set_if_absent_with_ttl("lock", b"a", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent_with_ttl("lock", b"b", Duration::from_secs(1))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(store
            .set_if_absent_with_ttl("lock", b"b", Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some(&b"b"[..]));
    }

    #[tokio::test]
    async fn conditional_ops_check_current_value() {
        let store = InMemoryKvStore::new();
        store
            .set_with_ttl("lock", b"owner", Duration::from_secs(30))
            .await
            .unwrap();

        assert!(!store.delete_if_equals("lock", b"intruder").await.unwrap());
        assert!(!store
            .expire_if_equals("lock", b"intruder", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store
            .expire_if_equals("lock", b"owner", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store.ttl("lock").await.unwrap().unwrap() > Duration::from_secs(30));
        assert!(store.delete_if_equals("lock", b"owner").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fenced_writes_require_guard_value() {
        let store = InMemoryKvStore::new();
        let fence = Fence {
            key: "lock".into(),
            token: "t1".into(),
        };
        let ttl = Duration::from_secs(30);

        assert!(!store.set_if_equals(&fence, "data", b"x", ttl).await.unwrap());
        store.set_with_ttl("lock", b"t1", ttl).await.unwrap();
        assert!(store.set_if_equals(&fence, "data", b"x", ttl).await.unwrap());

        store.set_with_ttl("lock", b"t2", ttl).await.unwrap();
        assert!(!store.delete_fenced(&fence, "data").await.unwrap());
        assert!(store.get("data").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn drain_list_clears_list_and_companions() {
        let store = InMemoryKvStore::new();
        let ttl = Duration::from_secs(30);
        store.push_back("q", b"one", ttl, None).await.unwrap();
        assert_eq!(store.push_back("q", b"two", ttl, None).await.unwrap(), 2);
        store.set_with_ttl("flag", b"1", ttl).await.unwrap();

        let drained = store.drain_list("q", &["flag"]).await.unwrap();
        assert_eq!(drained, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(store.list_len("q").await.unwrap(), 0);
        assert!(store.get("flag").await.unwrap().is_none());
        assert!(store.drain_list("q", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn push_sets_flag_in_the_same_step() {
        let store = InMemoryKvStore::new();
        let ttl = Duration::from_secs(30);
        let flag = Flag {
            key: "flag",
            value: b"1",
            ttl: Duration::from_secs(5),
        };
        store.push_back("q", b"one", ttl, Some(flag)).await.unwrap();
        assert_eq!(store.get("flag").await.unwrap().as_deref(), Some(&b"1"[..]));
        assert!(store.ttl("flag").await.unwrap().unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn push_front_keeps_batch_order_ahead_of_existing_entries() {
        let store = InMemoryKvStore::new();
        let ttl = Duration::from_secs(30);
        store.push_back("q", b"later", ttl, None).await.unwrap();
        let len = store
            .push_front("q", &[b"first".to_vec(), b"second".to_vec()], ttl, None)
            .await
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(
            store.drain_list("q", &[]).await.unwrap(),
            vec![b"first".to_vec(), b"second".to_vec(), b"later".to_vec()]
        );

        assert_eq!(store.push_front("empty", &[b"x".to_vec()], ttl, None).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_list_is_replaced_on_push() {
        let store = InMemoryKvStore::new();
        store
            .push_back("q", b"stale", Duration::from_secs(1), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            store
                .push_back("q", b"fresh", Duration::from_secs(30), None)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_matching_keys() {
        let store = InMemoryKvStore::new();
        let ttl = Duration::from_secs(30);
        store.set_with_ttl("1_a:x", b"1", ttl).await.unwrap();
        store.push_back("1_a:y", b"1", ttl, None).await.unwrap();
        store.set_with_ttl("1_b:x", b"1", ttl).await.unwrap();

        assert_eq!(store.delete_prefix("1_a:").await.unwrap(), 2);
        assert!(store.get("1_b:x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_has_single_winner() {
        let store = Arc::new(InMemoryKvStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let token = format!("t{i}");
                store
                    .set_if_absent_with_ttl("lock", token.as_bytes(), Duration::from_secs(30))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
