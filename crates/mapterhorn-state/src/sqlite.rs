//! SQLite-backed state store.

use crate::{Result, Stage, StageCounts, StateError, StateRecord, StateStore, UnitStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS units (
    version INTEGER NOT NULL,
    stage TEXT NOT NULL,
    unit_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    PRIMARY KEY (version, stage, unit_id)
);
CREATE INDEX IF NOT EXISTS units_by_status ON units (version, stage, status);
";

/// Connection settings for [`SqliteStateTracker`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file.
    pub path: PathBuf,
    /// Number of pooled connections.
    pub pool_size: usize,
    /// How long a writer waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl SqliteConfig {
    /// Defaults for a database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool_size: 4,
            busy_timeout_ms: 30_000,
        }
    }
}

/// State store in a SQLite database using WAL journaling.
///
/// Every transition is one conditional `INSERT … ON CONFLICT DO UPDATE`
/// statement, so updates to a key are atomic without any lock in this
/// process beyond the connection being used. Connections are handed out
/// round-robin from a small pool.
#[derive(Debug)]
pub struct SqliteStateTracker {
    connections: Vec<Mutex<Connection>>,
    cursor: AtomicUsize,
}

impl SqliteStateTracker {
    /// Open (or create) the database at `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_config(SqliteConfig::new(path))
    }

    /// Open (or create) the database described by `config`.
    pub fn with_config(config: SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let pool_size = config.pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for idx in 0..pool_size {
            let connection = open_connection(&config)?;
            if idx == 0 {
                connection.execute_batch(SCHEMA)?;
            }
            connections.push(Mutex::new(connection));
        }
        debug!(path = %config.path.display(), pool_size, "opened state database");
        Ok(Self {
            connections,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Next connection in round-robin order.
    fn connection(&self) -> &Mutex<Connection> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        &self.connections[index]
    }
}

fn open_connection(config: &SqliteConfig) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)?;
    connection.execute_batch("PRAGMA journal_mode = WAL;")?;
    connection.execute_batch("PRAGMA synchronous = NORMAL;")?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    Ok(connection)
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StateError::InvalidTimestamp(s.to_string()))
}

fn to_sql_version(version: u64) -> i64 {
    version as i64
}

impl StateStore for SqliteStateTracker {
    fn seed(&self, version: u64, stage: Stage, unit_ids: &[String]) -> Result<usize> {
        let now = timestamp(Utc::now());
        let mut conn = self.connection().lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO units (version, stage, unit_id, status, attempts, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
            )?;
            for id in unit_ids {
                inserted += stmt.execute(params![to_sql_version(version), stage.as_str(), id, now])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn claim(&self, version: u64, stage: Stage, unit_id: &str) -> Result<bool> {
        let now = timestamp(Utc::now());
        let conn = self.connection().lock();
        let changed = conn.execute(
            "INSERT INTO units (version, stage, unit_id, status, attempts, updated_at)
             VALUES (?1, ?2, ?3, 'in_progress', 1, ?4)
             ON CONFLICT (version, stage, unit_id) DO UPDATE SET
                status = 'in_progress',
                attempts = units.attempts + 1,
                error = NULL,
                updated_at = excluded.updated_at
             WHERE units.status != 'done'",
            params![to_sql_version(version), stage.as_str(), unit_id, now],
        )?;
        Ok(changed == 1)
    }

    fn mark_done(&self, version: u64, stage: Stage, unit_id: &str) -> Result<()> {
        let now = timestamp(Utc::now());
        let conn = self.connection().lock();
        conn.execute(
            "INSERT INTO units (version, stage, unit_id, status, attempts, updated_at, completed_at)
             VALUES (?1, ?2, ?3, 'done', 1, ?4, ?4)
             ON CONFLICT (version, stage, unit_id) DO UPDATE SET
                status = 'done',
                error = NULL,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at
             WHERE units.status != 'done'",
            params![to_sql_version(version), stage.as_str(), unit_id, now],
        )?;
        Ok(())
    }

    fn mark_failed(&self, version: u64, stage: Stage, unit_id: &str, error: &str) -> Result<()> {
        let now = timestamp(Utc::now());
        let conn = self.connection().lock();
        conn.execute(
            "INSERT INTO units (version, stage, unit_id, status, attempts, error, updated_at)
             VALUES (?1, ?2, ?3, 'failed', 1, ?4, ?5)
             ON CONFLICT (version, stage, unit_id) DO UPDATE SET
                status = 'failed',
                error = excluded.error,
                updated_at = excluded.updated_at
             WHERE units.status != 'done'",
            params![to_sql_version(version), stage.as_str(), unit_id, error, now],
        )?;
        Ok(())
    }

    fn status(&self, version: u64, stage: Stage, unit_id: &str) -> Result<Option<StateRecord>> {
        let conn = self.connection().lock();
        let row = conn
            .query_row(
                "SELECT status, attempts, error, updated_at, completed_at
                 FROM units WHERE version = ?1 AND stage = ?2 AND unit_id = ?3",
                params![to_sql_version(version), stage.as_str(), unit_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, attempts, error, updated_at, completed_at)) = row else {
            return Ok(None);
        };
        Ok(Some(StateRecord {
            version,
            stage,
            unit_id: unit_id.to_string(),
            status: status.parse()?,
            attempts: attempts.max(0) as u32,
            error,
            updated_at: parse_timestamp(&updated_at)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        }))
    }

    fn list_pending(&self, version: u64, stage: Stage) -> Result<Vec<String>> {
        let conn = self.connection().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT unit_id FROM units
             WHERE version = ?1 AND stage = ?2 AND status != 'done'
             ORDER BY unit_id",
        )?;
        let rows = stmt.query_map(params![to_sql_version(version), stage.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn list_done(&self, version: u64, stage: Stage) -> Result<Vec<String>> {
        let conn = self.connection().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT unit_id FROM units
             WHERE version = ?1 AND stage = ?2 AND status = 'done'
             ORDER BY unit_id",
        )?;
        let rows = stmt.query_map(params![to_sql_version(version), stage.as_str()], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn counts(&self, version: u64, stage: Stage) -> Result<StageCounts> {
        let conn = self.connection().lock();
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM units
             WHERE version = ?1 AND stage = ?2
             GROUP BY status",
        )?;
        let rows = stmt.query_map(params![to_sql_version(version), stage.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StageCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = n.max(0) as usize;
            match status.parse::<UnitStatus>()? {
                UnitStatus::Pending => counts.pending += n,
                UnitStatus::InProgress => counts.in_progress += n,
                UnitStatus::Done => counts.done += n,
                UnitStatus::Failed => counts.failed += n,
            }
        }
        Ok(counts)
    }

    fn first_done_at(&self, version: u64, stage: Stage) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connection().lock();
        let first: Option<String> = conn.query_row(
            "SELECT MIN(completed_at) FROM units
             WHERE version = ?1 AND stage = ?2 AND status = 'done'",
            params![to_sql_version(version), stage.as_str()],
            |row| row.get(0),
        )?;
        first.as_deref().map(parse_timestamp).transpose()
    }

    fn discard(&self, version: u64) -> Result<usize> {
        let conn = self.connection().lock();
        let removed = conn.execute(
            "DELETE FROM units WHERE version = ?1",
            params![to_sql_version(version)],
        )?;
        Ok(removed)
    }
}
