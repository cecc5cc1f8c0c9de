//! SQLite-backed key-value store shared by every process on one host.
//!
//! Each trait call runs inside a single `BEGIN IMMEDIATE` transaction (or a single
//! statement), so conditional operations are atomic across connections and
//! processes opening the same database file.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use super::traits::{Fence, Flag, KvStore, StoreError, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_strings (
    key        TEXT PRIMARY KEY,
    value      BLOB NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS kv_list_items (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    key   TEXT NOT NULL,
    value BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kv_list_items_key ON kv_list_items(key, id);
CREATE TABLE IF NOT EXISTS kv_lists (
    key        TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL
);
";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: &Path, busy_timeout: Duration) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, busy_timeout)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?, Duration::from_secs(5))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> StoreResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, i64) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx, now_ms())?;
        tx.commit()?;
        Ok(out)
    }

    fn live_string(tx: &Transaction<'_>, key: &str, now: i64) -> rusqlite::Result<Option<Vec<u8>>> {
        tx.query_row(
            "SELECT value FROM kv_strings WHERE key = ?1 AND expires_at > ?2",
            params![key, now],
            |row| row.get(0),
        )
        .optional()
    }

    fn holds(tx: &Transaction<'_>, key: &str, expected: &[u8], now: i64) -> rusqlite::Result<bool> {
        Ok(Self::live_string(tx, key, now)?.is_some_and(|v| v == expected))
    }

    fn upsert(tx: &Transaction<'_>, key: &str, value: &[u8], expires_at: i64) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO kv_strings (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    fn list_is_live(tx: &Transaction<'_>, key: &str, now: i64) -> rusqlite::Result<bool> {
        let expires_at: Option<i64> = tx
            .query_row(
                "SELECT expires_at FROM kv_lists WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires_at.is_some_and(|exp| exp > now))
    }

    fn remove_list(tx: &Transaction<'_>, key: &str) -> rusqlite::Result<usize> {
        tx.execute("DELETE FROM kv_list_items WHERE key = ?1", params![key])?;
        tx.execute("DELETE FROM kv_lists WHERE key = ?1", params![key])
    }

    fn remove_any(tx: &Transaction<'_>, key: &str) -> rusqlite::Result<usize> {
        let strings = tx.execute("DELETE FROM kv_strings WHERE key = ?1", params![key])?;
        Ok(strings + Self::remove_list(tx, key)?)
    }

    /// Drop an expired list and (re)set the list expiration.
    fn revive_list(tx: &Transaction<'_>, key: &str, now: i64, ttl: Duration) -> rusqlite::Result<()> {
        if !Self::list_is_live(tx, key, now)? {
            Self::remove_list(tx, key)?;
        }
        tx.execute(
            "INSERT INTO kv_lists (key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
            params![key, deadline(now, ttl)],
        )?;
        Ok(())
    }

    fn count(tx: &Transaction<'_>, key: &str) -> rusqlite::Result<usize> {
        let len: i64 = tx.query_row(
            "SELECT COUNT(*) FROM kv_list_items WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(len).unwrap_or(0))
    }

    fn raise(tx: &Transaction<'_>, flag: Option<Flag<'_>>, now: i64) -> rusqlite::Result<()> {
        match flag {
            Some(flag) => Self::upsert(tx, flag.key, flag.value, deadline(now, flag.ttl)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.with_tx(|tx, now| Self::live_string(tx, key, now))
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        self.with_tx(|tx, now| Self::upsert(tx, key, value, deadline(now, ttl)))
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.with_tx(|tx, now| {
            tx.execute(
                "DELETE FROM kv_strings WHERE key = ?1 AND expires_at <= ?2",
                params![key, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO kv_strings (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, deadline(now, ttl)],
            )?;
            Ok(inserted == 1)
        })
    }

    async fn set_if_equals(
        &self,
        fence: &Fence,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.with_tx(|tx, now| {
            if !Self::holds(tx, &fence.key, fence.token.as_bytes(), now)? {
                return Ok(false);
            }
            Self::upsert(tx, key, value, deadline(now, ttl))?;
            Ok(true)
        })
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.with_tx(|tx, now| {
            let updated = tx.execute(
                "UPDATE kv_strings SET expires_at = ?1
                 WHERE key = ?2 AND value = ?3 AND expires_at > ?4",
                params![deadline(now, ttl), key, expected, now],
            )?;
            Ok(updated == 1)
        })
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.with_tx(|tx, now| {
            let deleted = tx.execute(
                "DELETE FROM kv_strings WHERE key = ?1 AND value = ?2 AND expires_at > ?3",
                params![key, expected, now],
            )?;
            Ok(deleted == 1)
        })
    }

    async fn delete_fenced(&self, fence: &Fence, key: &str) -> StoreResult<bool> {
        self.with_tx(|tx, now| {
            if !Self::holds(tx, &fence.key, fence.token.as_bytes(), now)? {
                return Ok(false);
            }
            Self::remove_any(tx, key)?;
            Ok(true)
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.with_tx(|tx, _| Ok(Self::remove_any(tx, key)? > 0))
    }

    async fn push_back(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        flag: Option<Flag<'_>>,
    ) -> StoreResult<usize> {
        self.with_tx(|tx, now| {
            Self::revive_list(tx, key, now, ttl)?;
            tx.execute(
                "INSERT INTO kv_list_items (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Self::raise(tx, flag, now)?;
            Self::count(tx, key)
        })
    }

    async fn push_front(
        &self,
        key: &str,
        values: &[Vec<u8>],
        ttl: Duration,
        flag: Option<Flag<'_>>,
    ) -> StoreResult<usize> {
        self.with_tx(|tx, now| {
            Self::revive_list(tx, key, now, ttl)?;
            // Head entries take ids below every existing row; reads order by id.
            let lowest: i64 = tx.query_row(
                "SELECT COALESCE(MIN(id), 1) FROM kv_list_items",
                [],
                |row| row.get(0),
            )?;
            let n = i64::try_from(values.len()).unwrap_or(i64::MAX);
            for (offset, value) in (0_i64..).zip(values) {
                tx.execute(
                    "INSERT INTO kv_list_items (id, key, value) VALUES (?1, ?2, ?3)",
                    params![lowest - n + offset, key, value],
                )?;
            }
            Self::raise(tx, flag, now)?;
            Self::count(tx, key)
        })
    }

    async fn drain_list(&self, key: &str, also_delete: &[&str]) -> StoreResult<Vec<Vec<u8>>> {
        self.with_tx(|tx, now| {
            let mut drained = Vec::new();
            if Self::list_is_live(tx, key, now)? {
                let mut stmt =
                    tx.prepare("SELECT value FROM kv_list_items WHERE key = ?1 ORDER BY id ASC")?;
                let rows = stmt.query_map(params![key], |row| row.get::<_, Vec<u8>>(0))?;
                for row in rows {
                    drained.push(row?);
                }
            }
            Self::remove_list(tx, key)?;
            for extra in also_delete {
                Self::remove_any(tx, extra)?;
            }
            Ok(drained)
        })
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        self.with_tx(|tx, now| {
            if !Self::list_is_live(tx, key, now)? {
                return Ok(0);
            }
            Self::count(tx, key)
        })
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.with_tx(|tx, now| {
            let string_exp: Option<i64> = tx
                .query_row(
                    "SELECT expires_at FROM kv_strings WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| row.get(0),
                )
                .optional()?;
            let exp = match string_exp {
                Some(exp) => Some(exp),
                None => tx
                    .query_row(
                        "SELECT expires_at FROM kv_lists WHERE key = ?1 AND expires_at > ?2",
                        params![key, now],
                        |row| row.get(0),
                    )
                    .optional()?,
            };
            Ok(exp.map(|exp| Duration::from_millis(u64::try_from(exp - now).unwrap_or(0))))
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        self.with_tx(|tx, _| {
            let strings = tx.execute(
                "DELETE FROM kv_strings WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            tx.execute(
                "DELETE FROM kv_list_items WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            let lists = tx.execute(
                "DELETE FROM kv_lists WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
            )?;
            Ok(strings + lists)
        })
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn set_if_absent_is_exclusive_across_connections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("kv.db");
        let a = SqliteKvStore::open(&path, Duration::from_secs(5)).unwrap();
        let b = SqliteKvStore::open(&path, Duration::from_secs(5)).unwrap();
        let ttl = Duration::from_secs(30);

        assert!(a.set_if_absent_with_ttl("lock", b"a", ttl).await.unwrap());
        assert!(!b.set_if_absent_with_ttl("lock", b"b", ttl).await.unwrap());
        assert_eq!(b.get("lock").await.unwrap().as_deref(), Some(&b"a"[..]));
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        assert!(store
            .set_if_absent_with_ttl("lock", b"a", Duration::from_millis(50))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("lock").await.unwrap().is_none());
        assert!(store
            .set_if_absent_with_ttl("lock", b"b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_and_refresh() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store
            .set_with_ttl("lock", b"owner", Duration::from_secs(10))
            .await
            .unwrap();

        assert!(!store.delete_if_equals("lock", b"other").await.unwrap());
        assert!(store
            .expire_if_equals("lock", b"owner", Duration::from_secs(120))
            .await
            .unwrap());
        assert!(store.ttl("lock").await.unwrap().unwrap() > Duration::from_secs(60));
        assert!(store.delete_if_equals("lock", b"owner").await.unwrap());
        assert!(store.ttl("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fenced_write_is_rejected_after_takeover() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(30);
        let fence = Fence {
            key: "lock".into(),
            token: "first".into(),
        };
        store.set_with_ttl("lock", b"first", ttl).await.unwrap();
        assert!(store.set_if_equals(&fence, "ctx", b"v1", ttl).await.unwrap());

        store.set_with_ttl("lock", b"second", ttl).await.unwrap();
        assert!(!store.set_if_equals(&fence, "ctx", b"v2", ttl).await.unwrap());
        assert!(!store.delete_fenced(&fence, "ctx").await.unwrap());
        assert_eq!(store.get("ctx").await.unwrap().as_deref(), Some(&b"v1"[..]));
    }

    #[tokio::test]
    async fn list_drain_preserves_order_and_clears_marker() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(30);
        for item in ["a", "b", "c"] {
            store.push_back("q", item.as_bytes(), ttl, None).await.unwrap();
        }
        store.set_with_ttl("marker", b"1", ttl).await.unwrap();
        assert_eq!(store.list_len("q").await.unwrap(), 3);

        let drained = store.drain_list("q", &["marker"]).await.unwrap();
        assert_eq!(drained, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(store.list_len("q").await.unwrap(), 0);
        assert!(store.get("marker").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_front_orders_ahead_of_tail_across_keys() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(30);
        let marker = Flag {
            key: "marker",
            value: b"1",
            ttl,
        };
        store.push_back("other", b"x", ttl, None).await.unwrap();
        store.push_back("q", b"c", ttl, Some(marker)).await.unwrap();
        assert!(store.get("marker").await.unwrap().is_some());

        let len = store
            .push_front("q", &[b"a".to_vec(), b"b".to_vec()], ttl, Some(marker))
            .await
            .unwrap();
        assert_eq!(len, 3);
        store.push_front("q", &[b"0".to_vec()], ttl, None).await.unwrap();
        store.push_back("q", b"d", ttl, None).await.unwrap();

        let drained = store.drain_list("q", &["marker"]).await.unwrap();
        let drained: Vec<&[u8]> = drained.iter().map(Vec::as_slice).collect();
        assert_eq!(drained, [&b"0"[..], &b"a"[..], &b"b"[..], &b"c"[..], &b"d"[..]]);
        assert_eq!(store.list_len("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_prefix_removes_all_families() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let ttl = Duration::from_secs(30);
        store.set_with_ttl("7_9:active_context", b"{}", ttl).await.unwrap();
        store.push_back("7_9:message_queue", b"m", ttl, None).await.unwrap();
        store.set_with_ttl("7_10:active_context", b"{}", ttl).await.unwrap();

        assert_eq!(store.delete_prefix("7_9:").await.unwrap(), 2);
        assert!(store.get("7_10:active_context").await.unwrap().is_some());
    }
}
