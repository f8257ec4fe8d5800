//! Inbound provider events and webhook audit CRUD

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::database::models::Webhook;
use crate::error::{DaemonError, Result};
use crate::webhook::{process_event, verify_signature, EventOutcome};

use super::AppState;

/// POST /webhooks/github
///
/// The raw body is read before JSON parsing so the HMAC signature can be
/// verified over the exact bytes the provider signed.
pub async fn receive_github_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let secret = state
        .ctx
        .config
        .webhook
        .secret
        .as_deref()
        .ok_or_else(|| DaemonError::Internal("webhook secret is not configured".to_string()))?;

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DaemonError::Unauthorized("missing signature header".to_string()))?;

    if !verify_signature(secret, &body, signature) {
        warn!("Rejected webhook delivery with a bad signature");
        return Err(DaemonError::Unauthorized("signature mismatch".to_string()));
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| DaemonError::BadRequest(format!("invalid JSON payload: {}", e)))?;
    let raw = String::from_utf8_lossy(&body);

    let outcome = process_event(&state.ctx.db, event_type, &payload, &raw).await?;
    let outcome = match outcome {
        EventOutcome::Applied => "applied",
        EventOutcome::AuditOnly => "stored",
        EventOutcome::Unroutable => "unroutable",
    };
    Ok(Json(json!({ "ok": true, "outcome": outcome })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub unprocessed: bool,
}

/// GET /webhooks
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Webhook>>> {
    Ok(Json(state.ctx.db.list_webhooks(query.unprocessed).await?))
}

/// GET /webhooks/{id}
pub async fn get_one(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Webhook>> {
    state
        .ctx
        .db
        .get_webhook(id)
        .await?
        .map(Json)
        .ok_or_else(|| DaemonError::NotFound(format!("webhook {}", id)))
}

/// DELETE /webhooks/{id}
pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<bool>> {
    Ok(Json(state.ctx.db.delete_webhook(id).await?))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{body_json, test_app};
    use crate::database::models::{ContributionStatus, IssueStatus};
    use crate::database::ContributionUpsert;
    use crate::webhook::sign_body;
    use crate::workspace::runner::tests::seed_issue;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    const SECRET: &str = "test-webhook-secret";

    async fn app_with_secret() -> (axum::Router, super::AppState) {
        let (_app, mut state) = test_app().await;
        let mut config = (*state.ctx.config).clone();
        config.webhook.secret = Some(SECRET.to_string());
        state.ctx.config = std::sync::Arc::new(config);
        // Rebuild the router against the updated state.
        (crate::router::build_router(state.clone()), state)
    }

    fn merged_event_body() -> String {
        serde_json::json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://github.com/acme/widget/pull/7",
                "number": 7,
                "merged": true
            }
        })
        .to_string()
    }

    fn event_request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::post("/webhooks/github")
            .header("content-type", "application/json")
            .header("x-github-event", "pull_request");
        if let Some(sig) = signature {
            builder = builder.header("x-hub-signature-256", sig);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_valid_signature_applies_event() {
        let (app, state) = app_with_secret().await;
        let (issue_id, _) = seed_issue(&state.ctx).await;
        state
            .ctx
            .db
            .upsert_contribution(ContributionUpsert {
                agent_run_id: None,
                issue_id,
                pr_url: Some("https://github.com/acme/widget/pull/7"),
                pr_number: Some(7),
                branch_name: Some("fix/issue-42"),
                status: ContributionStatus::PrOpen,
                summary: None,
            })
            .await
            .unwrap();

        let body = merged_event_body();
        let signature = sign_body(SECRET, body.as_bytes());
        let response = app
            .oneshot(event_request(&body, Some(signature)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["outcome"], "applied");

        let issue = state.ctx.db.get_issue(issue_id).await.unwrap().unwrap();
        assert_eq!(issue.status, IssueStatus::Fixed);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_401_and_changes_nothing() {
        let (app, state) = app_with_secret().await;
        let (issue_id, _) = seed_issue(&state.ctx).await;
        state
            .ctx
            .db
            .upsert_contribution(ContributionUpsert {
                agent_run_id: None,
                issue_id,
                pr_url: Some("https://github.com/acme/widget/pull/7"),
                pr_number: Some(7),
                branch_name: Some("fix/issue-42"),
                status: ContributionStatus::PrOpen,
                summary: None,
            })
            .await
            .unwrap();

        let body = merged_event_body();
        let response = app
            .clone()
            .oneshot(event_request(&body, Some("sha256=deadbeef".to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Missing header too.
        let response = app.oneshot(event_request(&body, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // No observable state change.
        let issue = state.ctx.db.get_issue(issue_id).await.unwrap().unwrap();
        assert_eq!(issue.status, IssueStatus::Open);
        assert!(state.ctx.db.list_webhooks(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_secret_is_500() {
        let (app, _) = test_app().await;
        let body = merged_event_body();
        let response = app
            .oneshot(event_request(&body, Some("sha256=00".to_string())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_json_is_400() {
        let (app, _) = app_with_secret().await;
        let body = "{not json";
        let signature = sign_body(SECRET, body.as_bytes());
        let response = app
            .oneshot(event_request(body, Some(signature)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
