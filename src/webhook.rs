//! Event integrator
//!
//! Consumes authenticated provider events and reconciles them with
//! contribution state. Signature verification runs over the raw request
//! body, before any JSON parsing, and uses a constant-time comparison.
//! Every verified event is stored for audit whether or not it routes to a
//! contribution.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::database::models::{ContributionStatus, IssueStatus};
use crate::database::{Database, DatabaseResult};

type HmacSha256 = Hmac<Sha256>;

/// Verify an `x-hub-signature-256` header (`sha256=<hex>`) against the
/// raw body. The comparison is constant-time; a wrong-length signature
/// fails without leaking where it diverged.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the signature header value for a body (used by tests and the
/// diagnostics command).
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// What happened to a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Contribution (and possibly issue) state advanced.
    Applied,
    /// Stored for audit; the action carries no state change.
    AuditOnly,
    /// Stored but no matching contribution was found.
    Unroutable,
}

/// Store a verified event and apply its semantics.
///
/// `pull_request` events route to a contribution by PR URL or PR number:
/// closed+merged advances the contribution to `merged` and the issue to
/// `fixed`; closed without merge advances the contribution to `closed`.
/// Everything else is audit-only. Unroutable events stay unprocessed so a
/// later manual reconciliation can pick them up.
pub async fn process_event(
    db: &Database,
    event_type: &str,
    payload: &serde_json::Value,
    raw_payload: &str,
) -> DatabaseResult<EventOutcome> {
    let action = payload.get("action").and_then(|a| a.as_str());
    let stored = db
        .create_webhook(None, event_type, action, raw_payload)
        .await?;

    if event_type != "pull_request" {
        debug!("Stored {} event for audit", event_type);
        db.mark_webhook_processed(stored.id).await?;
        return Ok(EventOutcome::AuditOnly);
    }

    let pr = payload.get("pull_request");
    let pr_url = pr
        .and_then(|p| p.get("html_url"))
        .and_then(|u| u.as_str());
    let pr_number = pr.and_then(|p| p.get("number")).and_then(|n| n.as_i64());
    let merged = pr
        .and_then(|p| p.get("merged"))
        .and_then(|m| m.as_bool())
        .unwrap_or(false);

    let Some(contribution) = db.find_contribution_by_pr(pr_url, pr_number).await? else {
        warn!(
            "No contribution matches pull_request event (url={:?}, number={:?}); stored unapplied",
            pr_url, pr_number
        );
        return Ok(EventOutcome::Unroutable);
    };

    db.set_webhook_contribution(stored.id, contribution.id).await?;

    let outcome = match action {
        Some("closed") if merged => {
            db.set_contribution_status(contribution.id, ContributionStatus::Merged)
                .await?;
            db.set_issue_status(contribution.issue_id, IssueStatus::Fixed)
                .await?;
            info!(
                "Contribution {} merged; issue {} fixed",
                contribution.id, contribution.issue_id
            );
            EventOutcome::Applied
        }
        Some("closed") => {
            db.set_contribution_status(contribution.id, ContributionStatus::Closed)
                .await?;
            info!("Contribution {} closed without merge", contribution.id);
            EventOutcome::Applied
        }
        _ => {
            debug!(
                "pull_request action {:?} stored for audit on contribution {}",
                action, contribution.id
            );
            EventOutcome::AuditOnly
        }
    };

    db.mark_webhook_processed(stored.id).await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ContributionUpsert;

    const SECRET: &str = "shared-secret";

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"action":"closed"}"#;
        let header = sign_body(SECRET, body);
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(SECRET, body, &header));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let header = sign_body(SECRET, b"original");
        assert!(!verify_signature(SECRET, b"tampered", &header));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let header = sign_body("other-secret", b"body");
        assert!(!verify_signature(SECRET, b"body", &header));
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        assert!(!verify_signature(SECRET, b"body", "sha1=deadbeef"));
        assert!(!verify_signature(SECRET, b"body", "deadbeef"));
        assert!(!verify_signature(SECRET, b"body", "sha256=nothex"));
        // Truncated digest must fail cleanly, not panic.
        assert!(!verify_signature(SECRET, b"body", "sha256=dead"));
    }

    async fn seed_contribution(db: &Database) -> (i64, i64) {
        let repo = db
            .create_repository("acme/widget", "https://github.com/acme/widget", None)
            .await
            .unwrap();
        let issue = db.create_issue(repo.id, 42, "bug", None, &[]).await.unwrap();
        db.set_issue_status(issue.id, IssueStatus::PrOpen).await.unwrap();

        let contribution = db
            .upsert_contribution(ContributionUpsert {
                agent_run_id: None,
                issue_id: issue.id,
                pr_url: Some("https://github.com/acme/widget/pull/7"),
                pr_number: Some(7),
                branch_name: Some("fix/issue-42"),
                status: ContributionStatus::PrOpen,
                summary: None,
            })
            .await
            .unwrap();
        (contribution.id, issue.id)
    }

    fn merged_payload() -> serde_json::Value {
        serde_json::json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://github.com/acme/widget/pull/7",
                "number": 7,
                "merged": true
            }
        })
    }

    #[tokio::test]
    async fn test_merged_event_advances_contribution_and_issue() {
        let db = Database::open_in_memory().unwrap();
        let (contribution_id, issue_id) = seed_contribution(&db).await;

        let payload = merged_payload();
        let outcome = process_event(&db, "pull_request", &payload, &payload.to_string())
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied);

        let contribution = db.get_contribution(contribution_id).await.unwrap().unwrap();
        assert_eq!(contribution.status, ContributionStatus::Merged);
        let issue = db.get_issue(issue_id).await.unwrap().unwrap();
        assert_eq!(issue.status, IssueStatus::Fixed);
    }

    #[tokio::test]
    async fn test_merged_event_replay_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let (contribution_id, issue_id) = seed_contribution(&db).await;

        let payload = merged_payload();
        for _ in 0..2 {
            process_event(&db, "pull_request", &payload, &payload.to_string())
                .await
                .unwrap();
        }

        let contribution = db.get_contribution(contribution_id).await.unwrap().unwrap();
        assert_eq!(contribution.status, ContributionStatus::Merged);
        let issue = db.get_issue(issue_id).await.unwrap().unwrap();
        assert_eq!(issue.status, IssueStatus::Fixed);
        // Both deliveries are kept for audit.
        assert_eq!(db.list_webhooks(false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_without_merge() {
        let db = Database::open_in_memory().unwrap();
        let (contribution_id, issue_id) = seed_contribution(&db).await;

        let payload = serde_json::json!({
            "action": "closed",
            "pull_request": {
                "html_url": "https://github.com/acme/widget/pull/7",
                "number": 7,
                "merged": false
            }
        });
        let outcome = process_event(&db, "pull_request", &payload, &payload.to_string())
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Applied);

        let contribution = db.get_contribution(contribution_id).await.unwrap().unwrap();
        assert_eq!(contribution.status, ContributionStatus::Closed);
        // The issue does not advance on an unmerged close.
        let issue = db.get_issue(issue_id).await.unwrap().unwrap();
        assert_eq!(issue.status, IssueStatus::PrOpen);
    }

    #[tokio::test]
    async fn test_unroutable_event_stored_unprocessed() {
        let db = Database::open_in_memory().unwrap();

        let payload = merged_payload();
        let outcome = process_event(&db, "pull_request", &payload, &payload.to_string())
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Unroutable);

        let pending = db.list_webhooks(true).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].contribution_id.is_none());
    }

    #[tokio::test]
    async fn test_routable_non_closed_action_is_audit_only() {
        let db = Database::open_in_memory().unwrap();
        let (contribution_id, _) = seed_contribution(&db).await;

        let payload = serde_json::json!({
            "action": "synchronize",
            "pull_request": {
                "html_url": "https://github.com/acme/widget/pull/7",
                "number": 7,
                "merged": false
            }
        });
        let outcome = process_event(&db, "pull_request", &payload, &payload.to_string())
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::AuditOnly);

        let contribution = db.get_contribution(contribution_id).await.unwrap().unwrap();
        assert_eq!(contribution.status, ContributionStatus::PrOpen);
    }

    #[tokio::test]
    async fn test_non_pull_request_event_is_audit_only() {
        let db = Database::open_in_memory().unwrap();
        let payload = serde_json::json!({ "zen": "Design for failure." });
        let outcome = process_event(&db, "ping", &payload, &payload.to_string())
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::AuditOnly);
        assert_eq!(db.list_webhooks(false).await.unwrap().len(), 1);
    }
}
