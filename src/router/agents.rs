//! Agent, agent-run, and agent-state CRUD

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::database::models::{Agent, AgentRun, AgentState};
use crate::error::{DaemonError, Result};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAgent {
    pub name: String,
    pub model: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateAgent>,
) -> Result<(StatusCode, Json<Agent>)> {
    let agent = state
        .ctx
        .db
        .create_agent(&body.name, body.model.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Agent>>> {
    Ok(Json(state.ctx.db.list_agents().await?))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Agent>> {
    state
        .ctx
        .db
        .get_agent(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("agent {}", id)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgent {
    pub name: Option<String>,
    pub model: Option<String>,
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateAgent>,
) -> Result<Json<Agent>> {
    let agent = state
        .ctx
        .db
        .update_agent(id, body.name.as_deref(), body.model.as_deref())
        .await?;
    Ok(Json(agent))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_agent(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRun {
    pub agent_id: i64,
    pub issue_id: i64,
}

pub async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateAgentRun>,
) -> Result<(StatusCode, Json<AgentRun>)> {
    let run = state
        .ctx
        .db
        .create_agent_run(body.agent_id, body.issue_id)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

pub async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<AgentRun>>> {
    Ok(Json(state.ctx.db.list_agent_runs().await?))
}

pub async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<AgentRun>> {
    state
        .ctx
        .db
        .get_agent_run(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("agent run {}", id)))
}

pub async fn delete_run(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_agent_run(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentState {
    pub agent_run_id: i64,
    pub contribution_id: Option<i64>,
    pub state: Option<String>,
    #[serde(default)]
    pub suspended: bool,
}

pub async fn create_state(
    State(state): State<AppState>,
    Json(body): Json<CreateAgentState>,
) -> Result<(StatusCode, Json<AgentState>)> {
    let row = state
        .ctx
        .db
        .upsert_agent_state(
            body.agent_run_id,
            body.contribution_id,
            body.state.as_deref(),
            body.suspended,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(row)))
}

#[derive(Debug, Deserialize)]
pub struct StateListQuery {
    pub suspended: Option<bool>,
}

pub async fn list_states(
    State(state): State<AppState>,
    Query(query): Query<StateListQuery>,
) -> Result<Json<Vec<AgentState>>> {
    Ok(Json(state.ctx.db.list_agent_states(query.suspended).await?))
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<AgentState>> {
    state
        .ctx
        .db
        .get_agent_state(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("agent state {}", id)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentState {
    pub suspended: bool,
}

pub async fn update_state(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateAgentState>,
) -> Result<Json<AgentState>> {
    state
        .ctx
        .db
        .set_agent_state_suspended(id, body.suspended)
        .await?;
    state
        .ctx
        .db
        .get_agent_state(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("agent state {}", id)))
}

pub async fn delete_state(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_agent_state(id).await?))
}
