//! Issue CRUD

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::database::models::{Issue, IssueStatus};
use crate::error::{DaemonError, Result};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateIssue {
    pub repository_id: i64,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateIssue>,
) -> Result<(StatusCode, Json<Issue>)> {
    state
        .ctx
        .db
        .get_repository(body.repository_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("repository {}", body.repository_id)))?;
    let issue = state
        .ctx
        .db
        .create_issue(
            body.repository_id,
            body.number,
            &body.title,
            body.body.as_deref(),
            &body.labels,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Issue>>> {
    let status: Option<IssueStatus> = query
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(DaemonError::BadRequest)?;
    Ok(Json(state.ctx.db.list_issues(status).await?))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Issue>> {
    state
        .ctx
        .db
        .get_issue(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("issue {}", id)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateIssue {
    pub title: Option<String>,
    pub body: Option<String>,
    pub labels: Option<Vec<String>>,
    pub status: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateIssue>,
) -> Result<Json<Issue>> {
    if let Some(status) = body.status.as_deref() {
        let status: IssueStatus = status.parse().map_err(DaemonError::BadRequest)?;
        state.ctx.db.set_issue_status(id, status).await?;
    }
    let issue = state
        .ctx
        .db
        .update_issue(
            id,
            body.title.as_deref(),
            body.body.as_deref(),
            body.labels.as_deref(),
        )
        .await?;
    Ok(Json(issue))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_issue(id).await?))
}
