//! Contribution CRUD
//!
//! Contributions are created by the runner, not the API; the surface here
//! is read, status patch, and delete.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::database::models::{Contribution, ContributionStatus};
use crate::error::{DaemonError, Result};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Contribution>>> {
    let status: Option<ContributionStatus> = query
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(DaemonError::BadRequest)?;
    Ok(Json(state.ctx.db.list_contributions(status).await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Contribution>> {
    state
        .ctx
        .db
        .get_contribution(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("contribution {}", id)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateContribution {
    pub status: String,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateContribution>,
) -> Result<Json<Contribution>> {
    let status: ContributionStatus = body.status.parse().map_err(DaemonError::BadRequest)?;
    state.ctx.db.set_contribution_status(id, status).await?;
    state
        .ctx
        .db
        .get_contribution(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("contribution {}", id)))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_contribution(id).await?))
}
