//! Repository and environment persistence

use chrono::Utc;
use rusqlite::Row;

use super::models::{Repository, RepositoryEnvironment};
use super::{sql_ts, ts_col, Database, DatabaseError, DatabaseResult};

fn repository_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        full_name: row.get(1)?,
        origin_url: row.get(2)?,
        fork_full_name: row.get(3)?,
        fork_url: row.get(4)?,
        language: row.get(5)?,
        created_at: ts_col(6, row.get(6)?)?,
    })
}

fn environment_from_row(row: &Row<'_>) -> rusqlite::Result<RepositoryEnvironment> {
    Ok(RepositoryEnvironment {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        runtime: row.get(2)?,
        package_manager: row.get(3)?,
        setup_command: row.get(4)?,
        test_command: row.get(5)?,
        updated_at: ts_col(6, row.get(6)?)?,
    })
}

const REPOSITORY_COLS: &str =
    "id, full_name, origin_url, fork_full_name, fork_url, language, created_at";

const ENVIRONMENT_COLS: &str =
    "id, repository_id, runtime, package_manager, setup_command, test_command, updated_at";

impl Database {
    /// Insert a repository, returning the stored row.
    pub async fn create_repository(
        &self,
        full_name: &str,
        origin_url: &str,
        language: Option<&str>,
    ) -> DatabaseResult<Repository> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO repositories (full_name, origin_url, language, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![full_name, origin_url, language, sql_ts(&Utc::now())],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories WHERE id = ?1",
            REPOSITORY_COLS
        ))?;
        Ok(stmt.query_row([id], repository_from_row)?)
    }

    pub async fn get_repository(&self, id: i64) -> DatabaseResult<Option<Repository>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories WHERE id = ?1",
            REPOSITORY_COLS
        ))?;
        let mut rows = stmt.query_map([id], repository_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn get_repository_by_name(&self, full_name: &str) -> DatabaseResult<Option<Repository>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories WHERE full_name = ?1",
            REPOSITORY_COLS
        ))?;
        let mut rows = stmt.query_map([full_name], repository_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn list_repositories(&self) -> DatabaseResult<Vec<Repository>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories ORDER BY id",
            REPOSITORY_COLS
        ))?;
        let rows = stmt
            .query_map([], repository_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Patch mutable repository fields; `None` leaves a field unchanged.
    pub async fn update_repository(
        &self,
        id: i64,
        origin_url: Option<&str>,
        language: Option<&str>,
    ) -> DatabaseResult<Repository> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE repositories SET
                origin_url = COALESCE(?2, origin_url),
                language = COALESCE(?3, language)
             WHERE id = ?1",
            rusqlite::params![id, origin_url, language],
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories WHERE id = ?1",
            REPOSITORY_COLS
        ))?;
        stmt.query_row([id], repository_from_row)
            .map_err(|_| DatabaseError::NotFound(format!("repository {}", id)))
    }

    /// Record the fork created (or discovered) for a repository.
    pub async fn set_repository_fork(
        &self,
        id: i64,
        fork_full_name: &str,
        fork_url: &str,
    ) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE repositories SET fork_full_name = ?2, fork_url = ?3 WHERE id = ?1",
            rusqlite::params![id, fork_full_name, fork_url],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("repository {}", id)));
        }
        Ok(())
    }

    pub async fn delete_repository(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM repositories WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Replace the environment for a repository (rederived on each extraction).
    pub async fn upsert_environment(
        &self,
        repository_id: i64,
        runtime: &str,
        package_manager: Option<&str>,
        setup_command: Option<&str>,
        test_command: Option<&str>,
    ) -> DatabaseResult<RepositoryEnvironment> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO repository_environments
                (repository_id, runtime, package_manager, setup_command, test_command, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(repository_id) DO UPDATE SET
                runtime = excluded.runtime,
                package_manager = excluded.package_manager,
                setup_command = excluded.setup_command,
                test_command = excluded.test_command,
                updated_at = excluded.updated_at",
            rusqlite::params![
                repository_id,
                runtime,
                package_manager,
                setup_command,
                test_command,
                sql_ts(&Utc::now())
            ],
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repository_environments WHERE repository_id = ?1",
            ENVIRONMENT_COLS
        ))?;
        Ok(stmt.query_row([repository_id], environment_from_row)?)
    }

    pub async fn get_environment(
        &self,
        repository_id: i64,
    ) -> DatabaseResult<Option<RepositoryEnvironment>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repository_environments WHERE repository_id = ?1",
            ENVIRONMENT_COLS
        ))?;
        let mut rows = stmt.query_map([repository_id], environment_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }
}
