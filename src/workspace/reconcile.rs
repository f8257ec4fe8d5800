//! Startup reconciliation
//!
//! A daemon restart orphans every non-terminal workspace: its runner task
//! is gone and cannot be resumed. Each one is settled here before the
//! control surface comes up. Workspaces that never reached a container
//! become `build_failed`; running ones have their container looked up and
//! are marked `container_crashed`, with any surviving container
//! force-destroyed.

use chrono::Utc;
use tracing::{info, warn};

use crate::database::models::{IssueStatus, WorkspaceError, WorkspaceStatus};

use super::runner::RunnerContext;
use super::RunnerResult;

/// Settle all non-terminal workspaces left over from a previous process.
/// Returns the number of workspaces reconciled.
pub async fn reconcile_workspaces(ctx: &RunnerContext) -> RunnerResult<usize> {
    let orphans = ctx.db.list_nonterminal_workspaces().await?;
    if orphans.is_empty() {
        return Ok(0);
    }

    info!("Reconciling {} orphaned workspace(s)", orphans.len());
    let count = orphans.len();

    for workspace in orphans {
        match &workspace.container_id {
            None => {
                let err = WorkspaceError::new(
                    "build_failed",
                    "daemon restarted before the container was started",
                );
                let _ = ctx.db.set_workspace_error(workspace.id, &err.to_json()).await;
                let _ = ctx
                    .db
                    .set_workspace_status(workspace.id, WorkspaceStatus::BuildFailed)
                    .await;
            }
            Some(container_id) => {
                let found = match ctx.runtime.inspect(container_id).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(
                            "Failed to inspect container {} for workspace {}: {}",
                            container_id, workspace.id, e
                        );
                        None
                    }
                };

                let message = match found {
                    Some(_) => {
                        if let Err(e) = ctx.runtime.force_remove(container_id).await {
                            warn!("Failed to remove stale container {}: {}", container_id, e);
                        }
                        "daemon restarted; stale container force-destroyed"
                    }
                    None => "daemon restarted; container is gone",
                };

                let err = WorkspaceError::new("container_crashed", message).with_details(
                    serde_json::json!({
                        "container_id": container_id,
                        "reconciled_at": Utc::now().to_rfc3339(),
                    }),
                );
                let _ = ctx.db.set_workspace_error(workspace.id, &err.to_json()).await;
                let _ = ctx
                    .db
                    .set_workspace_status(workspace.id, WorkspaceStatus::ContainerCrashed)
                    .await;
            }
        }

        let _ = ctx.db.mark_workspace_destroyed(workspace.id).await;
        if let Ok(Some(issue)) = ctx.db.get_issue(workspace.issue_id).await {
            if issue.status == IssueStatus::Fixing {
                let _ = ctx.db.set_issue_status(issue.id, IssueStatus::Error).await;
            }
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewWorkspace;
    use crate::workspace::runner::tests::{harness, seed_issue};

    #[tokio::test]
    async fn test_reconcile_settles_orphans() {
        let h = harness().await;
        let (issue_id, agent_id) = seed_issue(&h.ctx).await;
        let issue = h.ctx.db.get_issue(issue_id).await.unwrap().unwrap();

        // Orphan in building: never got a container.
        let building = h
            .ctx
            .db
            .create_workspace(NewWorkspace {
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

        // Orphan in running whose container is gone.
        let crashed = h
            .ctx
            .db
            .create_workspace(NewWorkspace {
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
        h.ctx
            .db
            .set_workspace_container(crashed.id, "vanished-container")
            .await
            .unwrap();
        h.ctx
            .db
            .set_workspace_status(crashed.id, WorkspaceStatus::Running)
            .await
            .unwrap();

        // Orphan in running whose container still exists.
        let stale = h
            .ctx
            .db
            .create_workspace(NewWorkspace {
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
        h.runtime
            .containers_running
            .lock()
            .push("stale-container".to_string());
        h.ctx
            .db
            .set_workspace_container(stale.id, "stale-container")
            .await
            .unwrap();
        h.ctx
            .db
            .set_workspace_status(stale.id, WorkspaceStatus::Running)
            .await
            .unwrap();

        let count = reconcile_workspaces(&h.ctx).await.unwrap();
        assert_eq!(count, 3);

        let building = h.ctx.db.get_workspace(building.id).await.unwrap().unwrap();
        assert_eq!(building.status, WorkspaceStatus::BuildFailed);
        assert!(building.destroyed_at.is_some());

        let crashed = h.ctx.db.get_workspace(crashed.id).await.unwrap().unwrap();
        assert_eq!(crashed.status, WorkspaceStatus::ContainerCrashed);

        let stale = h.ctx.db.get_workspace(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, WorkspaceStatus::ContainerCrashed);
        // The stale container was force-removed.
        assert!(h.runtime.containers_running.lock().is_empty());

        // A second pass finds nothing.
        assert_eq!(reconcile_workspaces(&h.ctx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminal_workspaces_untouched() {
        let h = harness().await;
        let (issue_id, agent_id) = seed_issue(&h.ctx).await;
        let issue = h.ctx.db.get_issue(issue_id).await.unwrap().unwrap();

        let done = h
            .ctx
            .db
            .create_workspace(NewWorkspace {
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
        h.ctx
            .db
            .set_workspace_status(done.id, WorkspaceStatus::Completed)
            .await
            .unwrap();

        assert_eq!(reconcile_workspaces(&h.ctx).await.unwrap(), 0);
        let done = h.ctx.db.get_workspace(done.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkspaceStatus::Completed);
    }
}
