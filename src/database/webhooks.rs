//! Webhook audit persistence
//!
//! Every authenticated inbound event is stored, routable or not. Rows are
//! immutable after creation except for the processed flag.

use chrono::Utc;
use rusqlite::Row;

use super::models::Webhook;
use super::{opt_ts_col, sql_ts, ts_col, Database, DatabaseError, DatabaseResult};

const WEBHOOK_COLS: &str =
    "id, contribution_id, event_type, action, payload, processed, created_at, processed_at";

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<Webhook> {
    Ok(Webhook {
        id: row.get(0)?,
        contribution_id: row.get(1)?,
        event_type: row.get(2)?,
        action: row.get(3)?,
        payload: row.get(4)?,
        processed: row.get::<_, i64>(5)? != 0,
        created_at: ts_col(6, row.get(6)?)?,
        processed_at: opt_ts_col(7, row.get(7)?)?,
    })
}

impl Database {
    pub async fn create_webhook(
        &self,
        contribution_id: Option<i64>,
        event_type: &str,
        action: Option<&str>,
        payload: &str,
    ) -> DatabaseResult<Webhook> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO webhooks (contribution_id, event_type, action, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![contribution_id, event_type, action, payload, sql_ts(&Utc::now())],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM webhooks WHERE id = ?1", WEBHOOK_COLS))?;
        Ok(stmt.query_row([id], webhook_from_row)?)
    }

    pub async fn get_webhook(&self, id: i64) -> DatabaseResult<Option<Webhook>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM webhooks WHERE id = ?1", WEBHOOK_COLS))?;
        let mut rows = stmt.query_map([id], webhook_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn list_webhooks(&self, unprocessed_only: bool) -> DatabaseResult<Vec<Webhook>> {
        let conn = self.lock().await;
        let rows = if unprocessed_only {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM webhooks WHERE processed = 0 ORDER BY id",
                WEBHOOK_COLS
            ))?;
            let result = stmt.query_map([], webhook_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            result
        } else {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM webhooks ORDER BY id", WEBHOOK_COLS))?;
            let result = stmt.query_map([], webhook_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            result
        };
        Ok(rows)
    }

    pub async fn mark_webhook_processed(&self, id: i64) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE webhooks SET processed = 1, processed_at = ?2 WHERE id = ?1",
            rusqlite::params![id, sql_ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("webhook {}", id)));
        }
        Ok(())
    }

    /// Attach a webhook to the contribution it was routed to.
    pub async fn set_webhook_contribution(
        &self,
        id: i64,
        contribution_id: i64,
    ) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE webhooks SET contribution_id = ?2 WHERE id = ?1",
            rusqlite::params![id, contribution_id],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("webhook {}", id)));
        }
        Ok(())
    }

    pub async fn delete_webhook(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM webhooks WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}
