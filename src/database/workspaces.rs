//! Workspace and workspace-log persistence
//!
//! The workspace row is the durable face of the runner state machine.
//! Transitions go through `set_workspace_status`, which refuses to move a
//! workspace out of a terminal state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Row;

use super::models::{LogStream, Workspace, WorkspaceLog, WorkspaceStatus};
use super::{enum_col, opt_ts_col, sql_ts, ts_col, Database, DatabaseError, DatabaseResult};

const WORKSPACE_COLS: &str = "id, agent_id, agent_run_id, repository_id, issue_id, container_id, \
     status, branch_name, base_branch, timeout_minutes, expires_at, recipe, pr_url, \
     error_message, created_at, destroyed_at";

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        agent_run_id: row.get(2)?,
        repository_id: row.get(3)?,
        issue_id: row.get(4)?,
        container_id: row.get(5)?,
        status: enum_col(6, row.get(6)?)?,
        branch_name: row.get(7)?,
        base_branch: row.get(8)?,
        timeout_minutes: row.get(9)?,
        expires_at: ts_col(10, row.get(10)?)?,
        recipe: row.get(11)?,
        pr_url: row.get(12)?,
        error_message: row.get(13)?,
        created_at: ts_col(14, row.get(14)?)?,
        destroyed_at: opt_ts_col(15, row.get(15)?)?,
    })
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceLog> {
    Ok(WorkspaceLog {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        stream: enum_col(2, row.get(2)?)?,
        line: row.get(3)?,
        created_at: ts_col(4, row.get(4)?)?,
    })
}

/// Parameters for inserting a new workspace row.
pub struct NewWorkspace {
    pub agent_id: i64,
    pub agent_run_id: Option<i64>,
    pub repository_id: i64,
    pub issue_id: i64,
    pub branch_name: String,
    pub base_branch: String,
    pub timeout_minutes: f64,
}

impl Database {
    /// Insert a workspace in `building`, with `expires_at = created_at + timeout`.
    pub async fn create_workspace(&self, new: NewWorkspace) -> DatabaseResult<Workspace> {
        let created_at = Utc::now();
        let expires_at = created_at
            + Duration::milliseconds((new.timeout_minutes * 60_000.0).round() as i64);

        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO workspaces
                (agent_id, agent_run_id, repository_id, issue_id, status, branch_name,
                 base_branch, timeout_minutes, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'building', ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                new.agent_id,
                new.agent_run_id,
                new.repository_id,
                new.issue_id,
                new.branch_name,
                new.base_branch,
                new.timeout_minutes,
                sql_ts(&expires_at),
                sql_ts(&created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLS))?;
        Ok(stmt.query_row([id], workspace_from_row)?)
    }

    pub async fn get_workspace(&self, id: i64) -> DatabaseResult<Option<Workspace>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLS))?;
        let mut rows = stmt.query_map([id], workspace_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn list_workspaces(
        &self,
        status: Option<WorkspaceStatus>,
    ) -> DatabaseResult<Vec<Workspace>> {
        let conn = self.lock().await;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workspaces WHERE status = ?1 ORDER BY id",
                    WORKSPACE_COLS
                ))?;
                let result = stmt.query_map([status.as_str()], workspace_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {} FROM workspaces ORDER BY id", WORKSPACE_COLS))?;
                let result = stmt.query_map([], workspace_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    /// Workspaces that are not yet in a terminal state (reconciled at startup).
    pub async fn list_nonterminal_workspaces(&self) -> DatabaseResult<Vec<Workspace>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM workspaces WHERE status IN ('pending', 'building', 'running') ORDER BY id",
            WORKSPACE_COLS
        ))?;
        let rows = stmt
            .query_map([], workspace_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Transition the workspace status. Terminal states are frozen: a
    /// transition out of one is a silent no-op and returns the stored row.
    pub async fn set_workspace_status(
        &self,
        id: i64,
        status: WorkspaceStatus,
    ) -> DatabaseResult<Workspace> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE workspaces SET status = ?2
             WHERE id = ?1
               AND status NOT IN ('completed', 'build_failed', 'container_crashed',
                                  'timeout', 'destroyed', 'cancelled')",
            rusqlite::params![id, status.as_str()],
        )?;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM workspaces WHERE id = ?1", WORKSPACE_COLS))?;
        stmt.query_row([id], workspace_from_row)
            .map_err(|_| DatabaseError::NotFound(format!("workspace {}", id)))
    }

    pub async fn set_workspace_container(&self, id: i64, container_id: &str) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE workspaces SET container_id = ?2 WHERE id = ?1",
            rusqlite::params![id, container_id],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("workspace {}", id)));
        }
        Ok(())
    }

    pub async fn set_workspace_recipe(&self, id: i64, recipe: &str) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE workspaces SET recipe = ?2 WHERE id = ?1",
            rusqlite::params![id, recipe],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("workspace {}", id)));
        }
        Ok(())
    }

    /// Record a detected pull-request URL. Latest detection wins.
    pub async fn set_workspace_pr_url(&self, id: i64, pr_url: &str) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE workspaces SET pr_url = ?2 WHERE id = ?1",
            rusqlite::params![id, pr_url],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("workspace {}", id)));
        }
        Ok(())
    }

    pub async fn set_workspace_error(&self, id: i64, error_json: &str) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE workspaces SET error_message = ?2 WHERE id = ?1",
            rusqlite::params![id, error_json],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("workspace {}", id)));
        }
        Ok(())
    }

    /// Stamp `destroyed_at` once. Re-stamping an already destroyed
    /// workspace is a no-op so destroy stays idempotent.
    pub async fn mark_workspace_destroyed(&self, id: i64) -> DatabaseResult<DateTime<Utc>> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE workspaces SET destroyed_at = ?2, container_id = NULL
             WHERE id = ?1 AND destroyed_at IS NULL",
            rusqlite::params![id, sql_ts(&Utc::now())],
        )?;
        let mut stmt = conn.prepare("SELECT destroyed_at FROM workspaces WHERE id = ?1")?;
        let stamp: Option<String> = stmt
            .query_row([id], |row| row.get(0))
            .map_err(|_| DatabaseError::NotFound(format!("workspace {}", id)))?;
        let stamp = stamp.ok_or_else(|| DatabaseError::Other("destroyed_at not set".into()))?;
        Ok(ts_col(0, stamp)?)
    }

    pub async fn delete_workspace(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        conn.execute("DELETE FROM workspace_logs WHERE workspace_id = ?1", [id])?;
        let n = conn.execute("DELETE FROM workspaces WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    /// Append one complete log line. Ids are allocated by SQLite and are
    /// strictly increasing per workspace.
    pub async fn append_workspace_log(
        &self,
        workspace_id: i64,
        stream: LogStream,
        line: &str,
    ) -> DatabaseResult<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO workspace_logs (workspace_id, stream, line, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![workspace_id, stream.as_str(), line, sql_ts(&Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Ordered-ascending logs with id strictly greater than `after_id`.
    pub async fn get_workspace_logs(
        &self,
        workspace_id: i64,
        after_id: Option<i64>,
    ) -> DatabaseResult<Vec<WorkspaceLog>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, stream, line, created_at
             FROM workspace_logs
             WHERE workspace_id = ?1 AND id > ?2
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![workspace_id, after_id.unwrap_or(0)], log_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Tail of the log stream, most recent last (for crash excerpts).
    pub async fn tail_workspace_logs(
        &self,
        workspace_id: i64,
        limit: usize,
    ) -> DatabaseResult<Vec<String>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT line FROM (
                SELECT id, line FROM workspace_logs
                WHERE workspace_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![workspace_id, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Scan this workspace's logs for the most recent line containing a
    /// pull-request link (fallback for the PR endpoint).
    pub async fn find_pr_url_in_logs(
        &self,
        workspace_id: i64,
        pattern: &regex::Regex,
    ) -> DatabaseResult<Option<String>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT line FROM workspace_logs WHERE workspace_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([workspace_id], |row| row.get::<_, String>(0))?;
        for line in rows {
            let line = line?;
            if let Some(m) = pattern.find(&line) {
                return Ok(Some(m.as_str().to_string()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(db: &Database) -> NewWorkspace {
        let agent = db.create_agent("claude", None).await.unwrap();
        let repo = db
            .create_repository("acme/widget", "https://github.com/acme/widget", None)
            .await
            .unwrap();
        let issue = db.create_issue(repo.id, 42, "bug", None, &[]).await.unwrap();
        NewWorkspace {
            agent_id: agent.id,
            agent_run_id: None,
            repository_id: repo.id,
            issue_id: issue.id,
            branch_name: "fix/issue-42".to_string(),
            base_branch: "main".to_string(),
            timeout_minutes: 60.0,
        }
    }

    #[tokio::test]
    async fn test_expires_at_derived_from_timeout() {
        let db = Database::open_in_memory().unwrap();
        let new = seed(&db).await;
        let ws = db.create_workspace(new).await.unwrap();

        assert_eq!(ws.status, WorkspaceStatus::Building);
        let delta = ws.expires_at - ws.created_at;
        assert_eq!(delta.num_minutes(), 60);
    }

    #[tokio::test]
    async fn test_fractional_timeout_minutes() {
        let db = Database::open_in_memory().unwrap();
        let mut new = seed(&db).await;
        new.timeout_minutes = 0.05; // 3 seconds
        let ws = db.create_workspace(new).await.unwrap();

        let delta = ws.expires_at - ws.created_at;
        assert_eq!(delta.num_milliseconds(), 3000);
    }

    #[tokio::test]
    async fn test_terminal_states_are_frozen() {
        let db = Database::open_in_memory().unwrap();
        let new = seed(&db).await;
        let ws = db.create_workspace(new).await.unwrap();

        db.set_workspace_status(ws.id, WorkspaceStatus::Running).await.unwrap();
        db.set_workspace_status(ws.id, WorkspaceStatus::Cancelled).await.unwrap();

        // A later transition attempt must not move it.
        let after = db
            .set_workspace_status(ws.id, WorkspaceStatus::Completed)
            .await
            .unwrap();
        assert_eq!(after.status, WorkspaceStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let new = seed(&db).await;
        let ws = db.create_workspace(new).await.unwrap();

        let first = db.mark_workspace_destroyed(ws.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = db.mark_workspace_destroyed(ws.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_log_pagination_is_strictly_after() {
        let db = Database::open_in_memory().unwrap();
        let new = seed(&db).await;
        let ws = db.create_workspace(new).await.unwrap();

        let mut last = 0;
        for i in 0..5 {
            last = db
                .append_workspace_log(ws.id, LogStream::Stdout, &format!("line {}", i))
                .await
                .unwrap();
        }

        let all = db.get_workspace_logs(ws.id, None).await.unwrap();
        assert_eq!(all.len(), 5);
        // Ids strictly increase in insertion order.
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let after = db.get_workspace_logs(ws.id, Some(all[2].id)).await.unwrap();
        assert_eq!(after.len(), 2);

        let none = db.get_workspace_logs(ws.id, Some(last)).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_find_pr_url_in_logs_prefers_latest() {
        let db = Database::open_in_memory().unwrap();
        let new = seed(&db).await;
        let ws = db.create_workspace(new).await.unwrap();

        let re = regex::Regex::new(r"https://github\.com/[^/\s]+/[^/\s]+/pull/\d+").unwrap();
        db.append_workspace_log(ws.id, LogStream::Stdout, "opened https://github.com/acme/widget/pull/7")
            .await
            .unwrap();
        db.append_workspace_log(ws.id, LogStream::Stdout, "updated https://github.com/acme/widget/pull/8 instead")
            .await
            .unwrap();

        let found = db.find_pr_url_in_logs(ws.id, &re).await.unwrap();
        assert_eq!(found.as_deref(), Some("https://github.com/acme/widget/pull/8"));
    }
}
