//! SQLite-backed coordination store.
//!
//! One table, `coordination_kv`, keyed by the full store key. Expiry is an
//! absolute unix timestamp in milliseconds; rows past it are treated as absent
//! and removed by [`SqliteStore::purge_expired`] or when overwritten. WAL mode
//! lets a scheduler process and several delivery workers on the same host
//! share one file.

use super::traits::{CoordinationStore, StoreError};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open coordination db: {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, mostly for tests.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        })
    }

    fn init_schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS coordination_kv (
                key           TEXT PRIMARY KEY,
                value         TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires ON coordination_kv(expires_at_ms);",
        )
        .context("Failed to initialize coordination schema")?;
        Ok(())
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Delete expired rows, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM coordination_kv WHERE expires_at_ms <= ?1",
                params![now_ms()],
            )
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("sqlite worker failed: {e}")))?
        .map_err(|e| StoreError::Backend(e.into()))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms().saturating_add(ttl_ms)
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM coordination_kv WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, now_ms()],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = expiry_ms(ttl);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO coordination_kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                expires_at_ms = excluded.expires_at_ms",
                params![key, value, expires_at],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let now = now_ms();
            let live = conn.execute(
                "DELETE FROM coordination_kv WHERE key = ?1 AND expires_at_ms > ?2",
                params![key, now],
            )?;
            conn.execute("DELETE FROM coordination_kv WHERE key = ?1", params![key])?;
            Ok(live > 0)
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM coordination_kv WHERE key = ?1 AND expires_at_ms > ?2)",
                params![key, now_ms()],
                |row| row.get::<_, bool>(0),
            )
        })
        .await
    }

    async fn get_and_set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = expiry_ms(ttl);
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front so other processes
            // cannot interleave between the read and the write.
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let swapped: rusqlite::Result<Option<String>> = (|| {
                let previous: Option<String> = conn
                    .query_row(
                        "SELECT value FROM coordination_kv WHERE key = ?1 AND expires_at_ms > ?2",
                        params![key, now_ms()],
                        |row| row.get(0),
                    )
                    .optional()?;
                conn.execute(
                    "INSERT INTO coordination_kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                    expires_at_ms = excluded.expires_at_ms",
                    params![key, value, expires_at],
                )?;
                Ok(previous)
            })();
            match swapped {
                Ok(previous) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(previous)
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
        .await
    }

    async fn set_extending_ttl(
        &self,
        key: &str,
        value: &str,
        min_ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = expiry_ms(min_ttl);
        self.with_conn(move |conn| {
            // An expired row keeps no claim on its old deadline.
            conn.execute(
                "INSERT INTO coordination_kv (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at_ms = CASE
                        WHEN coordination_kv.expires_at_ms > ?4
                            THEN MAX(coordination_kv.expires_at_ms, excluded.expires_at_ms)
                        ELSE excluded.expires_at_ms
                    END",
                params![key, value, expires_at, now_ms()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let expected = expected.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM coordination_kv
                 WHERE key = ?1 AND value = ?2 AND expires_at_ms > ?3",
                params![key, expected, now_ms()],
            )
            .map(|n| n > 0)
        })
        .await
    }
}
