use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    fn delete(&self, key: &str) -> StoreResult<()>;
    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>>;
}

pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> StoreResult<Option<T>> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw, ttl)
}

pub fn hget_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
    field: &str,
) -> StoreResult<Option<T>> {
    match store.hget(key, field)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn hset_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    field: &str,
    value: &T,
) -> StoreResult<()> {
    let raw = serde_json::to_string(value)?;
    store.hset(key, field, &raw)
}

/// Upper bound on a single pause between store attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// Pauses before each retry: exponential from `backoff`, capped at `MAX_BACKOFF`,
    /// jittered, and `retries` long.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let step = u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX);
        ExponentialBackoff::from_millis(2)
            .factor(step.div_ceil(2).max(1))
            .max_delay(MAX_BACKOFF)
            .map(move |delay| if step == 0 { Duration::ZERO } else { jitter(delay) })
            .take(self.retries as usize)
    }

    /// Runs `op`, retrying transient failures. Permanent errors return immediately.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
        let mut delays = self.delays();
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(err) if err.is_retryable() => {
                    let Some(delay) = delays.next() else {
                        return Err(err);
                    };
                    attempt += 1;
                    debug!(op = what, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying store call");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local store. Expiry is evaluated lazily against the injected clock.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    values: Mutex<HashMap<String, MemoryValue>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            values: Mutex::new(HashMap::new()),
            hashes: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> StoreResult<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| StoreError::Unavailable(format!("{what} lock poisoned")))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now();
        let mut values = lock(&self.values, "memory store")?;
        let expired = match values.get(key) {
            None => return Ok(None),
            Some(v) => v.expires_at.is_some_and(|at| at <= now),
        };
        if expired {
            values.remove(key);
            return Ok(None);
        }
        Ok(values.get(key).map(|v| v.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = expiry_from(self.clock.now(), ttl);
        lock(&self.values, "memory store")?.insert(
            key.to_string(),
            MemoryValue {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        lock(&self.values, "memory store")?.remove(key);
        lock(&self.hashes, "memory store")?.remove(key);
        Ok(())
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let hashes = lock(&self.hashes, "memory store")?;
        Ok(hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        lock(&self.hashes, "memory store")?
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        let hashes = lock(&self.hashes, "memory store")?;
        let mut out: Vec<(String, String)> = hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// SQLite-backed store. A busy database surfaces as `StoreError::Timeout` once
/// `busy_timeout` elapses, so callers never block indefinitely.
pub struct SqliteStore {
    clock: Arc<dyn Clock>,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                StoreError::Unavailable(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, busy_timeout, clock)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, Duration::from_millis(250), clock)
    }

    fn from_connection(
        conn: Connection,
        busy_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        conn.busy_timeout(busy_timeout)?;
        init_schema(&conn)?;
        Ok(Self {
            clock,
            conn: Mutex::new(conn),
        })
    }

    /// Drops expired rows; returns how many were removed.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now().timestamp_millis();
        let conn = lock(&self.conn, "sqlite store")?;
        let removed = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            debug!(removed, "purged expired store rows");
        }
        Ok(removed)
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NULL
        );
        CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);

        CREATE TABLE IF NOT EXISTS kv_hash (
            key TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (key, field)
        );
        "#,
    )?;
    Ok(())
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now().timestamp_millis();
        let conn = lock(&self.conn, "sqlite store")?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = expiry_from(self.clock.now(), ttl).map(|t| t.timestamp_millis());
        let conn = lock(&self.conn, "sqlite store")?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let conn = lock(&self.conn, "sqlite store")?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let conn = lock(&self.conn, "sqlite store")?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_hash WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let now = self.clock.now().timestamp_millis();
        let conn = lock(&self.conn, "sqlite store")?;
        conn.execute(
            r#"
            INSERT INTO kv_hash (key, field, value, updated_at) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key, field) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![key, field, value, now],
        )?;
        Ok(())
    }

    fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        let conn = lock(&self.conn, "sqlite store")?;
        let mut stmt =
            conn.prepare("SELECT field, value FROM kv_hash WHERE key = ?1 ORDER BY field")?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(pair) => out.push(pair),
                Err(err) => warn!(key, error = %err, "skipping unreadable hash row"),
            }
        }
        Ok(out)
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC))
}
