//! Issue persistence

use chrono::Utc;
use rusqlite::Row;

use super::models::{Issue, IssueStatus};
use super::{enum_col, sql_ts, ts_col, Database, DatabaseError, DatabaseResult};

const ISSUE_COLS: &str =
    "id, repository_id, number, title, body, labels, status, ai_fix_prompt, created_at, updated_at";

fn issue_from_row(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let labels: String = row.get(5)?;
    let labels: Vec<String> = serde_json::from_str(&labels).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Issue {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        number: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        labels,
        status: enum_col(6, row.get(6)?)?,
        ai_fix_prompt: row.get(7)?,
        created_at: ts_col(8, row.get(8)?)?,
        updated_at: ts_col(9, row.get(9)?)?,
    })
}

impl Database {
    pub async fn create_issue(
        &self,
        repository_id: i64,
        number: i64,
        title: &str,
        body: Option<&str>,
        labels: &[String],
    ) -> DatabaseResult<Issue> {
        let labels_json = serde_json::to_string(labels)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = sql_ts(&Utc::now());

        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO issues (repository_id, number, title, body, labels, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            rusqlite::params![repository_id, number, title, body, labels_json, now],
        )?;
        let id = conn.last_insert_rowid();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM issues WHERE id = ?1", ISSUE_COLS))?;
        Ok(stmt.query_row([id], issue_from_row)?)
    }

    pub async fn get_issue(&self, id: i64) -> DatabaseResult<Option<Issue>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM issues WHERE id = ?1", ISSUE_COLS))?;
        let mut rows = stmt.query_map([id], issue_from_row)?;
        rows.next().transpose().map_err(Into::into)
    }

    pub async fn list_issues(&self, status: Option<IssueStatus>) -> DatabaseResult<Vec<Issue>> {
        let conn = self.lock().await;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM issues WHERE status = ?1 ORDER BY id",
                    ISSUE_COLS
                ))?;
                let result = stmt.query_map([status.as_str()], issue_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {} FROM issues ORDER BY id", ISSUE_COLS))?;
                let result = stmt.query_map([], issue_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    pub async fn set_issue_status(&self, id: i64, status: IssueStatus) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE issues SET status = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, status.as_str(), sql_ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("issue {}", id)));
        }
        Ok(())
    }

    pub async fn set_issue_fix_prompt(&self, id: i64, prompt: &str) -> DatabaseResult<()> {
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE issues SET ai_fix_prompt = ?2, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![id, prompt, sql_ts(&Utc::now())],
        )?;
        if n == 0 {
            return Err(DatabaseError::NotFound(format!("issue {}", id)));
        }
        Ok(())
    }

    /// Patch mutable issue fields; `None` leaves a field unchanged.
    pub async fn update_issue(
        &self,
        id: i64,
        title: Option<&str>,
        body: Option<&str>,
        labels: Option<&[String]>,
    ) -> DatabaseResult<Issue> {
        let labels_json = labels
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let conn = self.lock().await;
        conn.execute(
            "UPDATE issues SET
                title = COALESCE(?2, title),
                body = COALESCE(?3, body),
                labels = COALESCE(?4, labels),
                updated_at = ?5
             WHERE id = ?1",
            rusqlite::params![id, title, body, labels_json, sql_ts(&Utc::now())],
        )?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM issues WHERE id = ?1", ISSUE_COLS))?;
        stmt.query_row([id], issue_from_row)
            .map_err(|_| DatabaseError::NotFound(format!("issue {}", id)))
    }

    pub async fn delete_issue(&self, id: i64) -> DatabaseResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM issues WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(db: &Database) -> Issue {
        let repo = db
            .create_repository("acme/widget", "https://github.com/acme/widget", None)
            .await
            .unwrap();
        db.create_issue(
            repo.id,
            42,
            "Widget crashes on empty input",
            Some("Steps to reproduce..."),
            &["bug".to_string(), "help wanted".to_string()],
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_issue_crud_and_labels_order() {
        let db = Database::open_in_memory().unwrap();
        let issue = seed(&db).await;

        assert_eq!(issue.status, IssueStatus::Pending);
        assert_eq!(issue.labels, vec!["bug", "help wanted"]);

        let loaded = db.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(loaded.number, 42);

        db.set_issue_status(issue.id, IssueStatus::Open).await.unwrap();
        let loaded = db.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, IssueStatus::Open);
    }

    #[tokio::test]
    async fn test_duplicate_issue_number_rejected() {
        let db = Database::open_in_memory().unwrap();
        let issue = seed(&db).await;

        let dup = db
            .create_issue(issue.repository_id, 42, "Duplicate", None, &[])
            .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_list_issues_by_status() {
        let db = Database::open_in_memory().unwrap();
        let issue = seed(&db).await;
        db.set_issue_status(issue.id, IssueStatus::Fixing).await.unwrap();

        assert_eq!(db.list_issues(Some(IssueStatus::Fixing)).await.unwrap().len(), 1);
        assert!(db.list_issues(Some(IssueStatus::Open)).await.unwrap().is_empty());
        assert_eq!(db.list_issues(None).await.unwrap().len(), 1);
    }
}
