//! Contribution persistence
//!
//! At most one contribution exists per issue (schema-enforced). The row is
//! upserted when a workspace completes and mutated by inbound provider
//! events afterwards.

use chrono::Utc;
use rusqlite::Row;

use super::models::{Contribution, ContributionStatus};
use super::{enum_col, sql_ts, ts_col, Database, DatabaseError, DatabaseResult};

const CONTRIBUTION_COLS: &str = "id, agent_run_id, issue_id, pr_url, pr_number, branch_name, \
     status, summary, created_at, updated_at";

fn contribution_from_row(row: &Row<'_>) -> rusqlite::Result<Contribution> {
    Ok(Contribution {
        id: row.get(0)?,
        agent_run_id: row.get(1)?,
        issue_id: row.get(2)?,
        pr_url: row.get(3)?,
        pr_number: row.get(4)?,
        branch_name: row.get(5)?,
        status: enum_col(6, row.get(6)?)?,
        summary: row.get(7)?,
        created_at: ts_col(8, row.get(8)?)?,
        updated_at: ts_col(9, row.get(9)?)?,
    })
}

/// Fields written by a contribution upsert.
pub struct ContributionUpsert<'a> {
    pub agent_run_id: Option<i64>,
    pub issue_id: i64,
    pub pr_url: Option<&'a str>,
    pub pr_number: Option<i64>,
    pub branch_name: Option<&'a str>,
    pub status: ContributionStatus,
    pub summary: Option<&'a str>,
}

impl Database {
    /// Insert or update the single contribution for an issue.
    pub async fn upsert_contribution(
        &self,
        upsert: ContributionUpsert<'_>,
    ) -> DatabaseResult<Contribution> {
        let now = sql_ts(&Utc::now());
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO contributions
                (agent_run_id, issue_id, pr_url, pr_number, branch_name, status, summary,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(issue_id) DO UPDATE SET
                agent_run_id = COALESCE(excluded.agent_run_id, agent_run_id),
                pr_url = COALESCE(excluded.pr_url, pr_url),
                pr_number = COALESCE(excluded.pr_number, pr_number),
                branch_name = COALESCE(excluded.branch_name, branch_name),
                status = excluded.status,
                summary = COALESCE(excluded.summary, summary),
                updated_at = excluded.updated_at",
            rusqlite::params![
                upsert.agent_run_id,
                upsert.issue_id,
                upsert.pr_url,
                upsert.pr_number,
                upsert.branch_name,
                upsert.status.as_str(),
                upsert.summary,
                now,
            ],
        )?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contributions WHERE issue_id = ?1",
            CONTRIBUTION_COLS
        ))?;
        Ok(stmt.query_row([upsert.issue_id], contribution_from_row)?)
    }

    pub async fn get_contribution(&self, id: i64) -> DatabaseResult<Option<Contribution>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contributions WHERE id = ?1",
            CONTRIBUTION_COLS
        ))?;
        let mut rows = stmt.query_map([id], contribution_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn get_contribution_for_issue(
        &self,
        issue_id: i64,
    ) -> DatabaseResult<Option<Contribution>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contributions WHERE issue_id = ?1",
            CONTRIBUTION_COLS
        ))?;
        let mut rows = stmt.query_map([issue_id], contribution_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    /// Locate a contribution by PR URL or PR number (webhook routing).
    pub async fn find_contribution_by_pr(
        &self,
        pr_url: Option<&str>,
        pr_number: Option<i64>,
    ) -> DatabaseResult<Option<Contribution>> {
        let conn = self.lock().await;
        if let Some(url) = pr_url {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM contributions WHERE pr_url = ?1",
                CONTRIBUTION_COLS
            ))?;
            let mut rows = stmt.query_map([url], contribution_from_row)?;
            if let Some(found) = rows.next().transpose()? {
                return Ok(Some(found));
            }
        }
        if let Some(number) = pr_number {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM contributions WHERE pr_number = ?1",
                CONTRIBUTION_COLS
            ))?;
            let mut rows = stmt.query_map([number], contribution_from_row)?;
            if let Some(found) = rows.next().transpose()? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    pub async fn list_contributions(
        &self,
        status: Option<ContributionStatus>,
    ) -> DatabaseResult<Vec<Contribution>> {
        let conn = self.lock().await;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM contributions WHERE status = ?1 ORDER BY id",
                    CONTRIBUTION_COLS
                ))?;
                let result = stmt.query_map([status.as_str()], contribution_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM contributions ORDER BY id",
                    CONTRIBUTION_COLS
                ))?;
                let result = stmt.query_map([], contribution_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    pub async fn set_contribution_status(
        &self,
        id: i64,
        status: ContributionStatus,
    ) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE contributions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, status.as_str(), sql_ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("contribution {}", id)));
        }
        Ok(())
    }

    /// Record an open PR discovered out-of-band (pre-spawn provider check).
    pub async fn set_contribution_pr(
        &self,
        id: i64,
        pr_url: &str,
        pr_number: Option<i64>,
    ) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE contributions SET pr_url = ?2, pr_number = COALESCE(?3, pr_number),
                updated_at = ?4
             WHERE id = ?1",
            rusqlite::params![id, pr_url, pr_number, sql_ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("contribution {}", id)));
        }
        Ok(())
    }

    pub async fn delete_contribution(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM contributions WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}
