//! HTTP control surface
//!
//! Thin axum handlers over the store and the workspace runner. All bodies
//! are JSON; timestamps serialize as ISO-8601 UTC.

mod agents;
mod config;
mod contributions;
mod issues;
mod repositories;
mod webhooks;
mod workspaces;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::workspace::{RunnerContext, RunnerRegistry};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: RunnerContext,
    pub registry: Arc<RunnerRegistry>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub docker: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let docker_ok = state.ctx.runtime.ping().await.is_ok();
    Json(HealthResponse {
        status: if docker_ok { "healthy" } else { "degraded" }.to_string(),
        docker: docker_ok,
    })
}

/// Build the daemon's router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Workspace orchestration
        .route("/workspaces/spawn", post(workspaces::spawn))
        .route("/workspaces/:id/destroy", post(workspaces::destroy))
        .route("/workspaces/:id/logs", get(workspaces::logs))
        .route("/workspaces/:id/pr", get(workspaces::pull_request))
        .route("/workspaces", get(workspaces::list))
        .route(
            "/workspaces/:id",
            get(workspaces::get_one).delete(workspaces::delete),
        )
        // Inbound provider events
        .route("/webhooks/github", post(webhooks::receive_github_event))
        .route("/webhooks", get(webhooks::list))
        .route("/webhooks/:id", get(webhooks::get_one).delete(webhooks::delete))
        // Entity CRUD
        .route(
            "/repositories",
            get(repositories::list).post(repositories::create),
        )
        .route(
            "/repositories/:id",
            get(repositories::get_one)
                .patch(repositories::update)
                .delete(repositories::delete),
        )
        .route(
            "/repositories/:id/environment",
            get(repositories::get_environment).post(repositories::put_environment),
        )
        .route("/issues", get(issues::list).post(issues::create))
        .route(
            "/issues/:id",
            get(issues::get_one).patch(issues::update).delete(issues::delete),
        )
        .route("/agents", get(agents::list).post(agents::create))
        .route(
            "/agents/:id",
            get(agents::get_one).patch(agents::update).delete(agents::delete),
        )
        .route("/agent-runs", get(agents::list_runs).post(agents::create_run))
        .route(
            "/agent-runs/:id",
            get(agents::get_run).delete(agents::delete_run),
        )
        .route(
            "/agent-states",
            get(agents::list_states).post(agents::create_state),
        )
        .route(
            "/agent-states/:id",
            get(agents::get_state)
                .patch(agents::update_state)
                .delete(agents::delete_state),
        )
        .route("/contributions", get(contributions::list))
        .route(
            "/contributions/:id",
            get(contributions::get_one)
                .patch(contributions::update)
                .delete(contributions::delete),
        )
        .route("/config", get(config::list))
        .route(
            "/config/:key",
            get(config::get_one).post(config::set).delete(config::delete),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workspace::runner::tests::harness;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub(crate) async fn test_app() -> (Router, AppState) {
        let h = harness().await;
        let state = AppState {
            ctx: h.ctx.clone(),
            registry: h.registry.clone(),
        };
        (build_router(state.clone()), state)
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["docker"], true);
    }
}
