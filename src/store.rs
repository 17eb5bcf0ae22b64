// src/store.rs

//! SQLite-backed key/value store for repository metadata
//!
//! Entries live in one table keyed by `(namespace, key)` with an
//! `updated_at` timestamp in Unix milliseconds. The store is a
//! [`TransactionalResource`]: transactions use `BEGIN IMMEDIATE` so write
//! conflicts surface at begin time as `SQLITE_BUSY`, which the store allows
//! to be retried with linear backoff.

use crate::error::{Error, Result};
use crate::transaction::TransactionalResource;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Retry policy for lock conflicts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Base delay, multiplied by the attempt number
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Key/value store on one SQLite connection
pub struct SqliteStore {
    name: String,
    conn: Connection,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path, name: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn, name)?;
        info!("Opened store {} at {}", store.name, path.display());
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory(name: impl Into<String>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, name)
    }

    fn with_connection(conn: Connection, name: impl Into<String>) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migrate(&conn)?;
        Ok(Self {
            name: name.into(),
            conn,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long SQLite itself waits on a lock before reporting busy
    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self> {
        self.conn.busy_timeout(timeout)?;
        Ok(self)
    }

    pub fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.put_at(namespace, key, value, Utc::now())
    }

    /// Insert or replace an entry with an explicit timestamp
    pub fn put_at(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO entries (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value,
                                                      updated_at = excluded.updated_at",
            params![namespace, key, value, updated_at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Last update time of an entry
    pub fn updated_at(&self, namespace: &str, key: &str) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = self
            .conn
            .query_row(
                "SELECT updated_at FROM entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(millis.and_then(|m| Utc.timestamp_millis_opt(m).single()))
    }

    pub fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(deleted > 0)
    }

    /// Keys in a namespace, sorted
    pub fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM entries WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map([namespace], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    pub fn count(&self, namespace: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE namespace = ?1",
            [namespace],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Replace a namespace's contents with `entries`
    pub fn replace_namespace(&self, namespace: &str, entries: &[(String, String)]) -> Result<()> {
        self.conn
            .execute("DELETE FROM entries WHERE namespace = ?1", [namespace])?;
        let now = Utc::now();
        for (key, value) in entries {
            self.put_at(namespace, key, value, now)?;
        }
        debug!("Replaced {} with {} entries", namespace, entries.len());
        Ok(())
    }

    /// Delete up to `limit` entries last updated before `cutoff`; returns how many
    pub fn purge_older_than(
        &self,
        namespace: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM entries WHERE rowid IN (
                SELECT rowid FROM entries
                WHERE namespace = ?1 AND updated_at < ?2
                ORDER BY updated_at
                LIMIT ?3
            )",
            params![namespace, cutoff.timestamp_millis(), limit as i64],
        )?;
        Ok(deleted)
    }
}

impl TransactionalResource for SqliteStore {
    type Error = Error;

    fn name(&self) -> &str {
        &self.name
    }

    fn is_active(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn allow_retry(&mut self, error: &Error, attempts: u32) -> bool {
        if !error.is_busy() || attempts > self.retry.max_retries {
            return false;
        }
        let delay = self.retry.delay * attempts;
        debug!("{} is locked, retrying in {:?}", self.name, delay);
        std::thread::sleep(delay);
        true
    }
}

/// Create tables and record the schema version
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE TABLE IF NOT EXISTS entries (
            namespace TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, key)
        );
        CREATE INDEX IF NOT EXISTS idx_entries_updated ON entries(namespace, updated_at);",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    if current < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
        info!("Store schema initialized at version {}", SCHEMA_VERSION);
    }
    Ok(())
}
