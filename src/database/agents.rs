//! Agent, agent-run, and agent-state persistence

use chrono::Utc;
use rusqlite::Row;

use super::models::{Agent, AgentRun, AgentState};
use super::{opt_ts_col, sql_ts, ts_col, Database, DatabaseError, DatabaseResult};

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        created_at: ts_col(3, row.get(3)?)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRun> {
    Ok(AgentRun {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        issue_id: row.get(2)?,
        status: row.get(3)?,
        started_at: ts_col(4, row.get(4)?)?,
        finished_at: opt_ts_col(5, row.get(5)?)?,
    })
}

fn state_from_row(row: &Row<'_>) -> rusqlite::Result<AgentState> {
    Ok(AgentState {
        id: row.get(0)?,
        agent_run_id: row.get(1)?,
        contribution_id: row.get(2)?,
        state: row.get(3)?,
        suspended: row.get::<_, i64>(4)? != 0,
        updated_at: ts_col(5, row.get(5)?)?,
    })
}

impl Database {
    pub async fn create_agent(&self, name: &str, model: Option<&str>) -> DatabaseResult<Agent> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO agents (name, model, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![name, model, sql_ts(&Utc::now())],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt =
            conn.prepare("SELECT id, name, model, created_at FROM agents WHERE id = ?1")?;
        Ok(stmt.query_row([id], agent_from_row)?)
    }

    pub async fn get_agent(&self, id: i64) -> DatabaseResult<Option<Agent>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare("SELECT id, name, model, created_at FROM agents WHERE id = ?1")?;
        let mut rows = stmt.query_map([id], agent_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn list_agents(&self) -> DatabaseResult<Vec<Agent>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT id, name, model, created_at FROM agents ORDER BY id")?;
        let rows = stmt
            .query_map([], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn update_agent(
        &self,
        id: i64,
        name: Option<&str>,
        model: Option<&str>,
    ) -> DatabaseResult<Agent> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE agents SET name = COALESCE(?2, name), model = COALESCE(?3, model) WHERE id = ?1",
            rusqlite::params![id, name, model],
        )?;
        let mut stmt =
            conn.prepare("SELECT id, name, model, created_at FROM agents WHERE id = ?1")?;
        stmt.query_row([id], agent_from_row)
            .map_err(|_| DatabaseError::NotFound(format!("agent {}", id)))
    }

    pub async fn delete_agent(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM agents WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub async fn create_agent_run(&self, agent_id: i64, issue_id: i64) -> DatabaseResult<AgentRun> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO agent_runs (agent_id, issue_id, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            rusqlite::params![agent_id, issue_id, sql_ts(&Utc::now())],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, issue_id, status, started_at, finished_at
             FROM agent_runs WHERE id = ?1",
        )?;
        Ok(stmt.query_row([id], run_from_row)?)
    }

    pub async fn get_agent_run(&self, id: i64) -> DatabaseResult<Option<AgentRun>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, issue_id, status, started_at, finished_at
             FROM agent_runs WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], run_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn list_agent_runs(&self) -> DatabaseResult<Vec<AgentRun>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, issue_id, status, started_at, finished_at
             FROM agent_runs ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn finish_agent_run(&self, id: i64, status: &str) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE agent_runs SET status = ?2, finished_at = ?3 WHERE id = ?1",
            rusqlite::params![id, status, sql_ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("agent run {}", id)));
        }
        Ok(())
    }

    pub async fn delete_agent_run(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM agent_runs WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub async fn upsert_agent_state(
        &self,
        agent_run_id: i64,
        contribution_id: Option<i64>,
        state: Option<&str>,
        suspended: bool,
    ) -> DatabaseResult<AgentState> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO agent_states (agent_run_id, contribution_id, state, suspended, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                agent_run_id,
                contribution_id,
                state,
                suspended as i64,
                sql_ts(&Utc::now())
            ],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt = conn.prepare(
            "SELECT id, agent_run_id, contribution_id, state, suspended, updated_at
             FROM agent_states WHERE id = ?1",
        )?;
        Ok(stmt.query_row([id], state_from_row)?)
    }

    pub async fn get_agent_state(&self, id: i64) -> DatabaseResult<Option<AgentState>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_run_id, contribution_id, state, suspended, updated_at
             FROM agent_states WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], state_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn list_agent_states(&self, suspended: Option<bool>) -> DatabaseResult<Vec<AgentState>> {
        let conn = self.lock().await;
        let rows = match suspended {
            Some(flag) => {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_run_id, contribution_id, state, suspended, updated_at
                     FROM agent_states WHERE suspended = ?1 ORDER BY id",
                )?;
                let result = stmt.query_map([flag as i64], state_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_run_id, contribution_id, state, suspended, updated_at
                     FROM agent_states ORDER BY id",
                )?;
                let result = stmt.query_map([], state_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    pub async fn set_agent_state_suspended(&self, id: i64, suspended: bool) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE agent_states SET suspended = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, suspended as i64, sql_ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("agent state {}", id)));
        }
        Ok(())
    }

    pub async fn delete_agent_state(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM agent_states WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_run_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let agent = db.create_agent("claude", Some("sonnet")).await.unwrap();
        let repo = db
            .create_repository("acme/widget", "https://github.com/acme/widget", None)
            .await
            .unwrap();
        let issue = db.create_issue(repo.id, 1, "bug", None, &[]).await.unwrap();

        let run = db.create_agent_run(agent.id, issue.id).await.unwrap();
        assert_eq!(run.status, "running");
        assert!(run.finished_at.is_none());

        db.finish_agent_run(run.id, "completed").await.unwrap();
        let run = db.get_agent_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_agent_state_suspension_filter() {
        let db = Database::open_in_memory().unwrap();
        let agent = db.create_agent("claude", None).await.unwrap();
        let repo = db
            .create_repository("acme/widget", "https://github.com/acme/widget", None)
            .await
            .unwrap();
        let issue = db.create_issue(repo.id, 1, "bug", None, &[]).await.unwrap();
        let run = db.create_agent_run(agent.id, issue.id).await.unwrap();

        let state = db
            .upsert_agent_state(run.id, None, Some("{}"), false)
            .await
            .unwrap();
        db.upsert_agent_state(run.id, None, None, true).await.unwrap();

        assert_eq!(db.list_agent_states(Some(true)).await.unwrap().len(), 1);
        assert_eq!(db.list_agent_states(None).await.unwrap().len(), 2);

        db.set_agent_state_suspended(state.id, true).await.unwrap();
        assert_eq!(db.list_agent_states(Some(true)).await.unwrap().len(), 2);
    }
}
