//! Runtime configuration key CRUD

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<ConfigEntry>>> {
    let entries = state
        .ctx
        .db
        .list_config()
        .await?
        .into_iter()
        .map(|(key, value)| ConfigEntry { key, value })
        .collect();
    Ok(Json(entries))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ConfigEntry>> {
    state
        .ctx
        .db
        .get_config(&key)
        .await?
        .map(|value| Json(ConfigEntry { key: key.clone(), value }))
        .ok_or_else(|| DaemonError::NotFound(format!("config key {}", key)))
}

#[derive(Debug, Deserialize)]
pub struct SetConfig {
    pub value: String,
}

pub async fn set(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<SetConfig>,
) -> Result<Json<ConfigEntry>> {
    state.ctx.db.set_config(&key, &body.value).await?;
    Ok(Json(ConfigEntry {
        key,
        value: body.value,
    }))
}

pub async fn delete(State(state): State<AppState>, Path(key): Path<String>) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_config(&key).await?))
}
