//! SQLite Heartbeat Store
//!
//! Heartbeat records in a SQLite database file. Processes on one host
//! share the file; the conditional upsert runs inside an IMMEDIATE
//! transaction so only one writer can observe "no fresh record" at a time.

use std::path::Path;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::{HeartbeatRecord, HeartbeatStore};

/// Heartbeat store backed by SQLite
pub struct SqliteStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Idle expiry of records
    expire_after: Duration,
    clock: Clock,
}

impl SqliteStore {
    /// Create or open the heartbeat database
    pub fn open(path: &Path, expire_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::with_connection(conn, expire_after, Clock::system())
    }

    /// Open a private in-memory database
    pub fn in_memory(expire_after: Duration) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, expire_after, Clock::system())
    }

    fn with_connection(conn: Connection, expire_after: Duration, clock: Clock) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;

        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS heartbeats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                member TEXT NOT NULL,
                identifier TEXT,
                last_seen INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_heartbeats_name_last_seen
                ON heartbeats(name, last_seen);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            expire_after,
            clock,
        })
    }

    /// Wait at most `timeout` for a competing writer before failing with
    /// [`Error::StoreTimeout`]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.conn.get_mut().busy_timeout(timeout)?;
        Ok(self)
    }

    /// Drop records idle for longer than the expiry
    pub async fn purge_expired(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM heartbeats WHERE last_seen < ?1",
            params![self.expiry_cutoff()],
        )?;
        Ok(deleted as u64)
    }

    /// Number of records held for `name`
    pub async fn record_count(&self, name: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM heartbeats WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn expiry_cutoff(&self) -> i64 {
        let expire_after = i64::try_from(self.expire_after.as_millis()).unwrap_or(i64::MAX);
        self.clock.now().timestamp_millis().saturating_sub(expire_after)
    }

    fn select_fresh(conn: &Connection, name: &str, since: DateTime<Utc>) -> Result<Option<HeartbeatRecord>> {
        let row = conn
            .query_row(
                r#"
                SELECT name, member, identifier, last_seen FROM heartbeats
                WHERE name = ?1 AND last_seen > ?2
                ORDER BY last_seen DESC
                LIMIT 1
                "#,
                params![name, since.timestamp_millis()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((name, member, identifier, last_seen)) => Ok(Some(HeartbeatRecord {
                name,
                member,
                identifier,
                last_seen: from_millis(last_seen)?,
            })),
            None => Ok(None),
        }
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Store(format!("invalid last_seen timestamp {}", ms)))
}

#[async_trait]
impl HeartbeatStore for SqliteStore {
    async fn find_fresh(&self, name: &str, since: DateTime<Utc>) -> Result<Option<HeartbeatRecord>> {
        let conn = self.conn.lock().await;
        Self::select_fresh(&conn, name, since)
    }

    async fn find_or_insert(
        &self,
        name: &str,
        since: DateTime<Utc>,
        defaults: HeartbeatRecord,
    ) -> Result<HeartbeatRecord> {
        let cutoff = self.expiry_cutoff();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM heartbeats WHERE last_seen < ?1", params![cutoff])?;

        if let Some(existing) = Self::select_fresh(&tx, name, since)? {
            tx.commit()?;
            return Ok(existing);
        }

        // stored with millisecond precision
        let record = HeartbeatRecord {
            name: name.to_string(),
            last_seen: from_millis(defaults.last_seen.timestamp_millis())?,
            ..defaults
        };
        tx.execute(
            "INSERT INTO heartbeats (name, member, identifier, last_seen) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.name,
                record.member,
                record.identifier,
                record.last_seen.timestamp_millis()
            ],
        )?;
        tx.commit()?;

        Ok(record)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref failure, _)
                if failure.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                Error::StoreTimeout
            }
            other => Error::Store(format!("SQLite error: {}", other)),
        }
    }
}
