//! Repository and environment CRUD

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::database::models::{Repository, RepositoryEnvironment};
use crate::error::{DaemonError, Result};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRepository {
    pub full_name: String,
    pub origin_url: String,
    pub language: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateRepository>,
) -> Result<(StatusCode, Json<Repository>)> {
    let repository = state
        .ctx
        .db
        .create_repository(&body.full_name, &body.origin_url, body.language.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(repository)))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Repository>>> {
    Ok(Json(state.ctx.db.list_repositories().await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Repository>> {
    state
        .ctx
        .db
        .get_repository(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("repository {}", id)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRepository {
    pub origin_url: Option<String>,
    pub language: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateRepository>,
) -> Result<Json<Repository>> {
    let repository = state
        .ctx
        .db
        .update_repository(id, body.origin_url.as_deref(), body.language.as_deref())
        .await?;
    Ok(Json(repository))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_repository(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PutEnvironment {
    pub runtime: String,
    pub package_manager: Option<String>,
    pub setup_command: Option<String>,
    pub test_command: Option<String>,
}

/// POST /repositories/{id}/environment replaces the environment, as
/// each extraction rederives it.
pub async fn put_environment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<PutEnvironment>,
) -> Result<Json<RepositoryEnvironment>> {
    state
        .ctx
        .db
        .get_repository(id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("repository {}", id)))?;
    let environment = state
        .ctx
        .db
        .upsert_environment(
            id,
            &body.runtime,
            body.package_manager.as_deref(),
            body.setup_command.as_deref(),
            body.test_command.as_deref(),
        )
        .await?;
    Ok(Json(environment))
}

pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RepositoryEnvironment>> {
    state
        .ctx
        .db
        .get_environment(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("environment for repository {}", id)))
}
