//! Workspace endpoints: spawn, destroy, logs, PR lookup, CRUD

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::database::models::{Workspace, WorkspaceLog};
use crate::error::{DaemonError, Result};
use crate::workspace::prompt::{pr_number_from_url, pr_url_regex};
use crate::workspace::{destroy_workspace, spawn_workspace, SpawnRequest};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct SpawnBody {
    pub issue_id: i64,
    pub agent_id: i64,
    pub timeout_minutes: Option<f64>,
}

/// POST /workspaces/spawn
///
/// Returns the workspace row only after the image is built and the
/// container is started; agent execution continues in the background. On
/// build/start failure the row is persisted with the failure status and
/// the request fails.
pub async fn spawn(
    State(state): State<AppState>,
    Json(body): Json<SpawnBody>,
) -> Result<Json<Workspace>> {
    let workspace = spawn_workspace(
        &state.ctx,
        &state.registry,
        SpawnRequest {
            issue_id: body.issue_id,
            agent_id: body.agent_id,
            timeout_minutes: body.timeout_minutes,
        },
    )
    .await?;
    Ok(Json(workspace))
}

/// POST /workspaces/{id}/destroy. Idempotent.
pub async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Workspace>> {
    let workspace = destroy_workspace(&state.ctx, &state.registry, id).await?;
    Ok(Json(workspace))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub after_id: Option<i64>,
}

/// GET /workspaces/{id}/logs?after_id=n. Ascending, strictly greater.
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<WorkspaceLog>>> {
    state
        .ctx
        .db
        .get_workspace(id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("workspace {}", id)))?;
    let rows = state.ctx.db.get_workspace_logs(id, query.after_id).await?;
    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
pub struct PrResponse {
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub branch_name: Option<String>,
    pub source: Option<&'static str>,
}

/// GET /workspaces/{id}/pr
///
/// Fallback order: workspace column, grep of this workspace's logs, the
/// issue's most recent contribution.
pub async fn pull_request(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<PrResponse>> {
    let workspace = state
        .ctx
        .db
        .get_workspace(id)
        .await?
        .ok_or_else(|| DaemonError::NotFound(format!("workspace {}", id)))?;

    if let Some(url) = &workspace.pr_url {
        return Ok(Json(PrResponse {
            pr_number: pr_number_from_url(url),
            pr_url: Some(url.clone()),
            branch_name: Some(workspace.branch_name),
            source: Some("workspace"),
        }));
    }

    if let Some(url) = state
        .ctx
        .db
        .find_pr_url_in_logs(id, pr_url_regex())
        .await?
    {
        return Ok(Json(PrResponse {
            pr_number: pr_number_from_url(&url),
            pr_url: Some(url),
            branch_name: Some(workspace.branch_name),
            source: Some("logs"),
        }));
    }

    if let Some(contribution) = state
        .ctx
        .db
        .get_contribution_for_issue(workspace.issue_id)
        .await?
    {
        return Ok(Json(PrResponse {
            pr_url: contribution.pr_url,
            pr_number: contribution.pr_number,
            branch_name: contribution.branch_name,
            source: Some("contribution"),
        }));
    }

    Ok(Json(PrResponse {
        pr_url: None,
        pr_number: None,
        branch_name: Some(workspace.branch_name),
        source: None,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// GET /workspaces
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Workspace>>> {
    let status = query
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(DaemonError::BadRequest)?;
    Ok(Json(state.ctx.db.list_workspaces(status).await?))
}

/// GET /workspaces/{id}
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Workspace>> {
    state
        .ctx
        .db
        .get_workspace(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("workspace {}", id)))
}

/// DELETE /workspaces/{id} removes the row and its logs.
pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<bool>> {
    if state.registry.is_running(id) {
        return Err(DaemonError::BadRequest(format!(
            "workspace {} is still running; destroy it first",
            id
        )));
    }
    Ok(Json(state.ctx.db.delete_workspace(id).await?))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{body_json, test_app};
    use crate::database::models::{LogStream, WorkspaceStatus};
    use crate::database::ContributionUpsert;
    use crate::workspace::runner::tests::{seed_issue, wait_for_status};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_spawn_returns_running_workspace() {
        let (app, state) = test_app().await;
        let (issue_id, agent_id) = seed_issue(&state.ctx).await;

        let request = Request::post("/workspaces/spawn")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "issue_id": issue_id, "agent_id": agent_id }).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let value = body_json(response).await;
        assert_eq!(value["status"], "running");
        assert!(value["container_id"].is_string());
        assert_eq!(value["branch_name"], "fix/issue-42");
    }

    #[tokio::test]
    async fn test_spawn_missing_issue_is_404() {
        let (app, state) = test_app().await;
        let (_, agent_id) = seed_issue(&state.ctx).await;

        let request = Request::post("/workspaces/spawn")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "issue_id": 999, "agent_id": agent_id }).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_logs_pagination() {
        let (app, state) = test_app().await;
        let (issue_id, agent_id) = seed_issue(&state.ctx).await;

        let workspace = crate::workspace::spawn_workspace(
            &state.ctx,
            &state.registry,
            crate::workspace::SpawnRequest {
                issue_id,
                agent_id,
                timeout_minutes: None,
            },
        )
        .await
        .unwrap();
        wait_for_status(&state.ctx.db, workspace.id, WorkspaceStatus::Completed).await;

        for i in 0..3 {
            state
                .ctx
                .db
                .append_workspace_log(workspace.id, LogStream::Stdout, &format!("extra {}", i))
                .await
                .unwrap();
        }

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/workspaces/{}/logs", workspace.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let all = body_json(response).await;
        let rows = all.as_array().unwrap();
        assert!(rows.len() >= 3);
        let pivot = rows[rows.len() - 2]["id"].as_i64().unwrap();

        let response = app
            .oneshot(
                Request::get(format!(
                    "/workspaces/{}/logs?after_id={}",
                    workspace.id, pivot
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        let newer = body_json(response).await;
        assert_eq!(newer.as_array().unwrap().len(), 1);
        assert!(newer[0]["id"].as_i64().unwrap() > pivot);
    }

    #[tokio::test]
    async fn test_pr_endpoint_fallback_chain() {
        let (app, state) = test_app().await;
        let (issue_id, agent_id) = seed_issue(&state.ctx).await;
        let issue = state.ctx.db.get_issue(issue_id).await.unwrap().unwrap();

        let workspace = state
            .ctx
            .db
            .create_workspace(crate::database::NewWorkspace {
                agent_id,
                agent_run_id: None,
                repository_id: issue.repository_id,
                issue_id,
                branch_name: "fix/issue-42".to_string(),
                base_branch: "main".to_string(),
                timeout_minutes: 60.0,
            })
            .await
            .unwrap();

        // Nothing anywhere: null source.
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/workspaces/{}/pr", workspace.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value = body_json(response).await;
        assert!(value["pr_url"].is_null());
        assert!(value["source"].is_null());

        // A log line makes the grep fallback fire.
        state
            .ctx
            .db
            .append_workspace_log(
                workspace.id,
                LogStream::Stdout,
                "opened https://github.com/acme/widget/pull/55",
            )
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/workspaces/{}/pr", workspace.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value = body_json(response).await;
        assert_eq!(value["source"], "logs");
        assert_eq!(value["pr_number"], 55);

        // The workspace column wins over everything.
        state
            .ctx
            .db
            .set_workspace_pr_url(workspace.id, "https://github.com/acme/widget/pull/56")
            .await
            .unwrap();
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/workspaces/{}/pr", workspace.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value = body_json(response).await;
        assert_eq!(value["source"], "workspace");
        assert_eq!(value["pr_url"], "https://github.com/acme/widget/pull/56");
    }

    #[tokio::test]
    async fn test_pr_endpoint_contribution_fallback() {
        let (app, state) = test_app().await;
        let (issue_id, agent_id) = seed_issue(&state.ctx).await;
        let issue = state.ctx.db.get_issue(issue_id).await.unwrap().unwrap();

        let workspace = state
            .ctx
            .db
            .create_workspace(crate::database::NewWorkspace {
                agent_id,
                agent_run_id: None,
                repository_id: issue.repository_id,
                issue_id,
                branch_name: "fix/issue-42".to_string(),
                base_branch: "main".to_string(),
                timeout_minutes: 60.0,
            })
            .await
            .unwrap();

        state
            .ctx
            .db
            .upsert_contribution(ContributionUpsert {
                agent_run_id: None,
                issue_id,
                pr_url: Some("https://github.com/acme/widget/pull/77"),
                pr_number: Some(77),
                branch_name: Some("fix/issue-42"),
                status: crate::database::models::ContributionStatus::PrOpen,
                summary: None,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::get(format!("/workspaces/{}/pr", workspace.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let value = body_json(response).await;
        assert_eq!(value["source"], "contribution");
        assert_eq!(value["pr_number"], 77);
    }
}
