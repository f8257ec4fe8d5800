//! State persistence module
//!
//! SQLite-backed store for every entity the daemon tracks. One connection
//! per process behind an async mutex: a single writer, concurrent readers
//! tolerated through SQLite's WAL mode.

mod agents;
mod contributions;
mod issues;
pub mod models;
mod repositories;
mod webhooks;
mod workspaces;

pub use contributions::ContributionUpsert;
pub use workspaces::NewWorkspace;

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result as SqliteResult};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        Self::init_tables(&conn)?;
        Self::seed_config_defaults(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_tables(&conn)?;
        Self::seed_config_defaults(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Create the schema. Idempotent: safe to run on every startup.
    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                full_name TEXT NOT NULL UNIQUE,
                origin_url TEXT NOT NULL,
                fork_full_name TEXT,
                fork_url TEXT,
                language TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repository_id INTEGER NOT NULL REFERENCES repositories(id),
                number INTEGER NOT NULL,
                title TEXT NOT NULL,
                body TEXT,
                labels TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'pending',
                ai_fix_prompt TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(repository_id, number)
            );

            CREATE TABLE IF NOT EXISTS repository_environments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repository_id INTEGER NOT NULL UNIQUE REFERENCES repositories(id),
                runtime TEXT NOT NULL,
                package_manager TEXT,
                setup_command TEXT,
                test_command TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                model TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL REFERENCES agents(id),
                issue_id INTEGER NOT NULL REFERENCES issues(id),
                status TEXT NOT NULL DEFAULT 'pending',
                started_at TEXT NOT NULL,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS contributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_run_id INTEGER REFERENCES agent_runs(id),
                issue_id INTEGER NOT NULL REFERENCES issues(id),
                pr_url TEXT,
                pr_number INTEGER,
                branch_name TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_states (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_run_id INTEGER NOT NULL REFERENCES agent_runs(id),
                contribution_id INTEGER REFERENCES contributions(id),
                state TEXT,
                suspended INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workspaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id INTEGER NOT NULL REFERENCES agents(id),
                agent_run_id INTEGER REFERENCES agent_runs(id),
                repository_id INTEGER NOT NULL REFERENCES repositories(id),
                issue_id INTEGER NOT NULL REFERENCES issues(id),
                container_id TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                branch_name TEXT NOT NULL,
                base_branch TEXT NOT NULL DEFAULT 'main',
                timeout_minutes REAL NOT NULL,
                expires_at TEXT NOT NULL,
                recipe TEXT,
                pr_url TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                destroyed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS workspace_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL REFERENCES workspaces(id),
                stream TEXT NOT NULL CHECK (stream IN ('stdout', 'stderr')),
                line TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS webhooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contribution_id INTEGER REFERENCES contributions(id),
                event_type TEXT NOT NULL,
                action TEXT,
                payload TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                processed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_issues_status
                ON issues(status);

            CREATE INDEX IF NOT EXISTS idx_contributions_status
                ON contributions(status);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_contributions_issue
                ON contributions(issue_id);

            CREATE INDEX IF NOT EXISTS idx_webhooks_unprocessed
                ON webhooks(contribution_id, processed);

            CREATE INDEX IF NOT EXISTS idx_workspaces_agent
                ON workspaces(agent_id);

            CREATE INDEX IF NOT EXISTS idx_workspaces_status
                ON workspaces(status);

            CREATE INDEX IF NOT EXISTS idx_workspaces_expires
                ON workspaces(expires_at);

            CREATE INDEX IF NOT EXISTS idx_workspace_logs_workspace
                ON workspace_logs(workspace_id, id);

            CREATE INDEX IF NOT EXISTS idx_agent_states_suspended
                ON agent_states(suspended);
            "#,
        )?;

        Ok(())
    }

    /// Insert default configuration keys, keeping existing values.
    fn seed_config_defaults(conn: &Connection) -> SqliteResult<()> {
        let now = sql_ts(&Utc::now());
        for (key, value) in [
            ("max_concurrent_workspaces", "4"),
            ("default_timeout_minutes", "60"),
            ("default_base_branch", "main"),
        ] {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, value, now],
            )?;
        }
        Ok(())
    }

    /// Read a config value.
    pub async fn get_config(&self, key: &str) -> DatabaseResult<Option<String>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a config value, inserting or replacing.
    pub async fn set_config(&self, key: &str, value: &str) -> DatabaseResult<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, sql_ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Delete a config key.
    pub async fn delete_config(&self, key: &str) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(n > 0)
    }

    /// List all config entries as (key, value) pairs.
    pub async fn list_config(&self) -> DatabaseResult<Vec<(String, String)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Serialize a timestamp for storage (ISO-8601 UTC).
pub(crate) fn sql_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp back out of a row.
pub(crate) fn ts_col(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parse an optional stored timestamp.
pub(crate) fn opt_ts_col(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| ts_col(idx, v)).transpose()
}

/// Parse a stored enum column via FromStr.
pub(crate) fn enum_col<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}
