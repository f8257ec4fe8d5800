//! Workspace runner state machine
//!
//! Drives one workspace from `building` to a terminal state. The spawn
//! phase (fork check, recipe synthesis, image build, container start)
//! runs inline with the HTTP request; agent execution continues in a
//! background task owned by the registry. Failures at every stage are
//! persisted into the workspace row as structured errors before they
//! propagate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::completion::CompletionBackend;
use crate::config::Configuration;
use crate::database::models::{
    Contribution, ContributionStatus, Issue, IssueStatus, LogStream, Repository,
    RepositoryEnvironment, Workspace, WorkspaceError, WorkspaceStatus,
};
use crate::database::{ContributionUpsert, Database, NewWorkspace};
use crate::docker::types::ContainerSpec;
use crate::docker::{ContainerRuntime, DockerError, ExecOutput, StreamKind};
use crate::provider::ProviderClient;
use crate::recipe::{
    RecipeContext, RecipeSynthesizer, CONTAINER_REPO_DIR, CONTAINER_USER, MAX_RECIPE_ATTEMPTS,
};

use super::logs::LineBuffer;
use super::prompt::{self, AGENT_LOG_PATH};
use super::registry::RunnerRegistry;
use super::{RunnerError, RunnerResult};

/// Monotonic suffix for image tags.
static IMAGE_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Number of trailing log lines attached to a crash error.
const CRASH_LOG_TAIL: usize = 20;

/// Shared dependencies handed to every runner.
#[derive(Clone)]
pub struct RunnerContext {
    pub db: Arc<Database>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub provider: Arc<dyn ProviderClient>,
    pub completion: Arc<dyn CompletionBackend>,
    pub config: Arc<Configuration>,
}

/// Inputs to a spawn: which issue, which agent, how long.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub issue_id: i64,
    pub agent_id: i64,
    pub timeout_minutes: Option<f64>,
}

/// Everything resolved during the inline phase.
struct Prepared {
    workspace: Workspace,
    issue: Issue,
    repository: Repository,
    environment: RepositoryEnvironment,
    prior: Option<Contribution>,
    agent_run_id: i64,
}

/// Docker image names allow [a-z0-9._-]; squash everything else.
fn sanitize_image_name(full_name: &str) -> String {
    full_name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn next_image_tag(full_name: &str) -> String {
    format!(
        "uc-workspace-{}:{}",
        sanitize_image_name(full_name),
        IMAGE_SEQUENCE.fetch_add(1, Ordering::SeqCst)
    )
}

/// Create a workspace and drive it to `running`, then hand agent
/// execution to a background task. Returns the running workspace row.
///
/// Failures after the row exists are persisted into it and re-raised so
/// the HTTP caller sees the error while the row stays queryable.
pub async fn spawn_workspace(
    ctx: &RunnerContext,
    registry: &Arc<RunnerRegistry>,
    request: SpawnRequest,
) -> RunnerResult<Workspace> {
    let limit = ctx
        .db
        .get_config("max_concurrent_workspaces")
        .await?
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(usize::MAX);
    if registry.len() >= limit {
        return Err(RunnerError::ConcurrencyLimit(registry.len()));
    }

    let mut prepared = prepare(ctx, &request).await?;
    info!(
        "Workspace {} created for issue #{} ({})",
        prepared.workspace.id, prepared.issue.number, prepared.repository.full_name
    );

    build_and_start(ctx, &mut prepared).await?;

    let workspace = ctx
        .db
        .set_workspace_status(prepared.workspace.id, WorkspaceStatus::Running)
        .await?;
    prepared.workspace = workspace.clone();
    info!(
        "Workspace {} running in container {}",
        workspace.id,
        workspace.container_id.as_deref().unwrap_or("?")
    );

    let cancel = registry.register(workspace.id);
    let ctx = ctx.clone();
    let registry = registry.clone();
    tokio::spawn(async move {
        let workspace_id = prepared.workspace.id;
        run_agent_phase(&ctx, prepared, cancel).await;
        registry.remove(workspace_id);
    });

    Ok(workspace)
}

/// Steps 1-6 of the sequence: load rows, decide branch, ensure fork,
/// check for an existing PR, insert the workspace row.
async fn prepare(ctx: &RunnerContext, request: &SpawnRequest) -> RunnerResult<Prepared> {
    let issue = ctx
        .db
        .get_issue(request.issue_id)
        .await?
        .ok_or(RunnerError::IssueNotFound(request.issue_id))?;
    let mut repository = ctx
        .db
        .get_repository(issue.repository_id)
        .await?
        .ok_or(RunnerError::RepositoryNotFound(issue.repository_id))?;
    ctx.db
        .get_agent(request.agent_id)
        .await?
        .ok_or(RunnerError::AgentNotFound(request.agent_id))?;
    let environment = ctx
        .db
        .get_environment(repository.id)
        .await?
        .ok_or(RunnerError::EnvironmentMissing(repository.id))?;

    // A prior contribution with a branch makes this a re-run: the branch
    // is reused exactly.
    let prior = ctx.db.get_contribution_for_issue(issue.id).await?;
    let branch_name = prior
        .as_ref()
        .and_then(|c| c.branch_name.clone())
        .unwrap_or_else(|| prompt::branch_name_for_issue(issue.number));

    if repository.fork_full_name.is_none() {
        let fork = ctx.provider.ensure_fork(&repository.full_name).await?;
        ctx.db
            .set_repository_fork(repository.id, &fork.full_name, &fork.url)
            .await?;
        repository.fork_full_name = Some(fork.full_name);
        repository.fork_url = Some(fork.url);
    }

    let open_pr = ctx
        .provider
        .find_open_pr(&repository.full_name, issue.number, &branch_name)
        .await?;
    if let (Some(pr), Some(prior)) = (&open_pr, &prior) {
        ctx.db
            .set_contribution_pr(prior.id, &pr.url, Some(pr.number))
            .await?;
    }

    let agent_run = ctx.db.create_agent_run(request.agent_id, issue.id).await?;

    let timeout_minutes = request
        .timeout_minutes
        .unwrap_or(ctx.config.workspace.default_timeout_minutes);
    let workspace = ctx
        .db
        .create_workspace(NewWorkspace {
            agent_id: request.agent_id,
            agent_run_id: Some(agent_run.id),
            repository_id: repository.id,
            issue_id: issue.id,
            branch_name,
            base_branch: ctx.config.workspace.base_branch.clone(),
            timeout_minutes,
        })
        .await?;

    if let Some(pr) = &open_pr {
        ctx.db.set_workspace_pr_url(workspace.id, &pr.url).await?;
    }

    ctx.db
        .set_issue_status(issue.id, IssueStatus::Fixing)
        .await?;

    let workspace = ctx
        .db
        .get_workspace(workspace.id)
        .await?
        .unwrap_or(workspace);

    Ok(Prepared {
        workspace,
        issue,
        repository,
        environment,
        prior,
        agent_run_id: agent_run.id,
    })
}

/// Steps 5-9: ping, synthesize-and-build loop, container create/start.
async fn build_and_start(ctx: &RunnerContext, prepared: &mut Prepared) -> RunnerResult<()> {
    let workspace_id = prepared.workspace.id;
    let issue_id = prepared.issue.id;

    if let Err(e) = ctx.runtime.ping().await {
        let err = WorkspaceError::new("build_failed", format!("container daemon unreachable: {}", e));
        fail_workspace(ctx, workspace_id, issue_id, WorkspaceStatus::BuildFailed, &err).await;
        return Err(e.into());
    }

    let synthesizer = RecipeSynthesizer::new(ctx.completion.clone());
    let fork_url = prepared
        .repository
        .fork_url
        .clone()
        .unwrap_or_else(|| prepared.repository.origin_url.clone());

    let mut previous_error: Option<String> = None;
    let mut last_progress: Vec<String> = Vec::new();
    let mut last_recipe: Option<String> = None;
    let mut image: Option<String> = None;

    for attempt in 1..=MAX_RECIPE_ATTEMPTS {
        let recipe_ctx = RecipeContext {
            repo_full_name: prepared.repository.full_name.clone(),
            origin_url: prepared.repository.origin_url.clone(),
            language: prepared.repository.language.clone(),
            fork_url: fork_url.clone(),
            previous_error: previous_error.clone(),
        };

        let recipe = match synthesizer.synthesize(&recipe_ctx).await {
            Ok(recipe) => recipe,
            Err(e) => {
                warn!(
                    "Recipe synthesis attempt {}/{} for workspace {} failed: {}",
                    attempt, MAX_RECIPE_ATTEMPTS, workspace_id, e
                );
                previous_error = Some(e.to_string());
                continue;
            }
        };

        ctx.db.set_workspace_recipe(workspace_id, &recipe).await?;
        last_recipe = Some(recipe.clone());

        let tag = next_image_tag(&prepared.repository.full_name);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let drain = tokio::spawn(async move {
            while let Some(line) = progress_rx.recv().await {
                debug!("build: {}", line);
            }
        });

        let built = ctx.runtime.build_image(&tag, &recipe, progress_tx).await;
        let _ = drain.await;

        match built {
            Ok(id) => {
                image = Some(id);
                break;
            }
            Err(DockerError::BuildFailed { message, progress }) => {
                warn!(
                    "Image build attempt {}/{} for workspace {} failed: {}",
                    attempt, MAX_RECIPE_ATTEMPTS, workspace_id, message
                );
                previous_error = Some(message);
                last_progress = progress;
            }
            Err(e) => {
                let err = WorkspaceError::new("build_failed", e.to_string())
                    .with_details(serde_json::json!({ "attempt": attempt }));
                fail_workspace(ctx, workspace_id, issue_id, WorkspaceStatus::BuildFailed, &err)
                    .await;
                return Err(e.into());
            }
        }
    }

    let Some(image) = image else {
        let message = previous_error.unwrap_or_else(|| "recipe synthesis failed".to_string());
        let recipe_excerpt = last_recipe
            .as_deref()
            .map(|r| r.chars().take(2000).collect::<String>());
        let err = WorkspaceError::new("build_failed", message.clone()).with_details(
            serde_json::json!({
                "attempt": MAX_RECIPE_ATTEMPTS,
                "recipe": recipe_excerpt,
                "progress": last_progress,
            }),
        );
        fail_workspace(ctx, workspace_id, issue_id, WorkspaceStatus::BuildFailed, &err).await;
        return Err(RunnerError::BuildExhausted {
            attempts: MAX_RECIPE_ATTEMPTS,
            message,
        });
    };

    let spec = container_spec(ctx, workspace_id, &image);
    match ctx.runtime.create_and_start(&spec).await {
        Ok(container_id) => {
            ctx.db
                .set_workspace_container(workspace_id, &container_id)
                .await?;
            prepared.workspace.container_id = Some(container_id);
            Ok(())
        }
        Err(e) => {
            let err = WorkspaceError::new(
                "container_crashed",
                format!("container failed to start: {}", e),
            );
            fail_workspace(
                ctx,
                workspace_id,
                issue_id,
                WorkspaceStatus::ContainerCrashed,
                &err,
            )
            .await;
            Err(e.into())
        }
    }
}

/// Container definition: operator credentials mounted read-only, host
/// networking, non-root user, tty, keep-alive command tailing the log
/// file the exec appends to.
fn container_spec(ctx: &RunnerContext, workspace_id: i64, image: &str) -> ContainerSpec {
    let cfg = &ctx.config.workspace;
    let mut env = Vec::new();
    if let Some(token) = &ctx.config.provider.token {
        env.push(format!("GH_TOKEN={}", token));
        env.push(format!("GITHUB_TOKEN={}", token));
    }

    let mut binds = Vec::new();
    if let Some(key) = &cfg.ssh_key_path {
        binds.push(format!(
            "{}:/home/{}/.ssh/id_ed25519:ro",
            key.display(),
            CONTAINER_USER
        ));
    }
    if let Some(auth) = &cfg.agent_auth_path {
        binds.push(format!(
            "{}:/home/{}/.claude.json:ro",
            auth.display(),
            CONTAINER_USER
        ));
    }
    if let Some(dir) = &cfg.agent_config_dir {
        binds.push(format!(
            "{}:/home/{}/.claude:ro",
            dir.display(),
            CONTAINER_USER
        ));
    }

    let mut labels = std::collections::HashMap::new();
    labels.insert("io.autofix.workspace".to_string(), workspace_id.to_string());

    ContainerSpec {
        image: image.to_string(),
        cmd: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("touch {0} && tail -f {0}", AGENT_LOG_PATH),
        ],
        env,
        working_dir: Some(CONTAINER_REPO_DIR.to_string()),
        user: Some(CONTAINER_USER.to_string()),
        tty: true,
        labels,
        binds,
        network_mode: Some("host".to_string()),
    }
}

enum ExecOutcome {
    Finished,
    Cancelled,
    TimedOut,
}

/// Steps 10-12: run the agent, ingest its output line by line, settle the
/// terminal state, wait out the grace period, tear the container down.
async fn run_agent_phase(ctx: &RunnerContext, prepared: Prepared, cancel: CancellationToken) {
    let workspace = &prepared.workspace;
    let workspace_id = workspace.id;
    let issue_id = prepared.issue.id;
    let container_id = match &workspace.container_id {
        Some(id) => id.clone(),
        None => {
            error!("Workspace {} entered agent phase without a container", workspace_id);
            return;
        }
    };

    let fix_prompt = prompt::build_fix_prompt(
        &prepared.issue,
        &prepared.repository,
        &prepared.environment,
        &workspace.branch_name,
        &workspace.base_branch,
        prepared.prior.as_ref(),
    );
    if let Err(e) = ctx.db.set_issue_fix_prompt(issue_id, &fix_prompt).await {
        warn!("Failed to persist fix prompt for issue {}: {}", issue_id, e);
    }

    let script = prompt::agent_exec_script(&ctx.config.workspace.agent_command, &fix_prompt);
    let cmd = vec!["/bin/bash".to_string(), "-lc".to_string(), script];

    let (tx, mut rx) = mpsc::unbounded_channel::<ExecOutput>();
    let runtime = ctx.runtime.clone();
    let exec_container = container_id.clone();
    let mut exec_task =
        tokio::spawn(async move { runtime.exec_streaming(&exec_container, cmd, tx).await });

    let mut stdout_buf = LineBuffer::new();
    let mut stderr_buf = LineBuffer::new();
    // Seed with the URL the pre-spawn provider check may have found.
    let mut pr_url = workspace.pr_url.clone();

    let remaining = (workspace.expires_at - Utc::now())
        .to_std()
        .unwrap_or_default();
    let deadline = tokio::time::sleep(remaining);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    ingest_frame(ctx, workspace_id, frame, &mut stdout_buf, &mut stderr_buf, &mut pr_url).await;
                }
                None => break ExecOutcome::Finished,
            },
            _ = cancel.cancelled() => break ExecOutcome::Cancelled,
            _ = &mut deadline => break ExecOutcome::TimedOut,
        }
    };

    // Commit any buffered fragments before the terminal transition so
    // readers never see the final status ahead of the last log line.
    flush_buffers(ctx, workspace_id, &mut stdout_buf, &mut stderr_buf).await;

    match outcome {
        ExecOutcome::Finished => {
            let exec_result = exec_task.await;
            settle_exec_result(ctx, &prepared, exec_result, pr_url).await;
            grace_and_teardown(ctx, &cancel, workspace_id, &container_id).await;
        }
        ExecOutcome::Cancelled => {
            exec_task.abort();
            append_line(ctx, workspace_id, LogStream::Stderr, "workspace cancelled").await;
            let _ = ctx
                .db
                .set_workspace_status(workspace_id, WorkspaceStatus::Cancelled)
                .await;
            if let Err(e) = ctx.runtime.force_remove(&container_id).await {
                warn!("Failed to remove container {}: {}", container_id, e);
            }
            let _ = ctx.db.set_issue_status(issue_id, IssueStatus::Open).await;
            let _ = ctx.db.finish_agent_run(prepared.agent_run_id, "cancelled").await;
            let _ = ctx.db.mark_workspace_destroyed(workspace_id).await;
            info!("Workspace {} cancelled", workspace_id);
        }
        ExecOutcome::TimedOut => {
            exec_task.abort();
            let elapsed = (Utc::now() - workspace.created_at).num_seconds();
            append_line(ctx, workspace_id, LogStream::Stderr, "workspace timed out").await;
            let err = WorkspaceError::new(
                "timeout",
                format!(
                    "workspace exceeded its {} minute deadline",
                    workspace.timeout_minutes
                ),
            )
            .with_details(serde_json::json!({ "duration": elapsed }));
            let _ = ctx.db.set_workspace_error(workspace_id, &err.to_json()).await;
            let _ = ctx
                .db
                .set_workspace_status(workspace_id, WorkspaceStatus::Timeout)
                .await;
            if let Err(e) = ctx.runtime.force_remove(&container_id).await {
                warn!("Failed to remove container {}: {}", container_id, e);
            }
            let _ = ctx.db.set_issue_status(issue_id, IssueStatus::Error).await;
            let _ = ctx.db.finish_agent_run(prepared.agent_run_id, "timeout").await;
            let _ = ctx.db.mark_workspace_destroyed(workspace_id).await;
            warn!("Workspace {} timed out after {}s", workspace_id, elapsed);
        }
    }
}

async fn ingest_frame(
    ctx: &RunnerContext,
    workspace_id: i64,
    frame: ExecOutput,
    stdout_buf: &mut LineBuffer,
    stderr_buf: &mut LineBuffer,
    pr_url: &mut Option<String>,
) {
    let (stream, buffer) = match frame.stream {
        StreamKind::Stdout => (LogStream::Stdout, stdout_buf),
        StreamKind::Stderr => (LogStream::Stderr, stderr_buf),
    };

    for line in buffer.push(&frame.data) {
        append_line(ctx, workspace_id, stream, &line).await;

        // Latest detected pull-request link wins.
        if stream == LogStream::Stdout {
            if let Some(found) = prompt::pr_url_regex().find(&line) {
                let url = found.as_str().to_string();
                if ctx
                    .db
                    .set_workspace_pr_url(workspace_id, &url)
                    .await
                    .is_ok()
                {
                    *pr_url = Some(url);
                }
            }
        }
    }
}

async fn flush_buffers(
    ctx: &RunnerContext,
    workspace_id: i64,
    stdout_buf: &mut LineBuffer,
    stderr_buf: &mut LineBuffer,
) {
    if let Some(line) = stdout_buf.flush() {
        append_line(ctx, workspace_id, LogStream::Stdout, &line).await;
    }
    if let Some(line) = stderr_buf.flush() {
        append_line(ctx, workspace_id, LogStream::Stderr, &line).await;
    }
}

async fn append_line(ctx: &RunnerContext, workspace_id: i64, stream: LogStream, line: &str) {
    if let Err(e) = ctx.db.append_workspace_log(workspace_id, stream, line).await {
        warn!("Failed to append log for workspace {}: {}", workspace_id, e);
    }
}

/// Step 11: translate the exec result into the terminal workspace state.
async fn settle_exec_result(
    ctx: &RunnerContext,
    prepared: &Prepared,
    exec_result: Result<Result<i64, DockerError>, tokio::task::JoinError>,
    pr_url: Option<String>,
) {
    let workspace_id = prepared.workspace.id;
    let issue_id = prepared.issue.id;

    match exec_result {
        Ok(Ok(0)) => {
            let pr_number = pr_url.as_deref().and_then(prompt::pr_number_from_url);
            let upsert = ContributionUpsert {
                agent_run_id: Some(prepared.agent_run_id),
                issue_id,
                pr_url: pr_url.as_deref(),
                pr_number,
                branch_name: Some(&prepared.workspace.branch_name),
                status: ContributionStatus::PrOpen,
                summary: None,
            };
            if let Err(e) = ctx.db.upsert_contribution(upsert).await {
                error!(
                    "Failed to upsert contribution for workspace {}: {}",
                    workspace_id, e
                );
            }
            // The branch was pushed even when no PR link showed up in the
            // logs, so the issue still advances.
            let _ = ctx.db.set_issue_status(issue_id, IssueStatus::PrOpen).await;
            let _ = ctx.db.finish_agent_run(prepared.agent_run_id, "completed").await;
            let _ = ctx
                .db
                .set_workspace_status(workspace_id, WorkspaceStatus::Completed)
                .await;
            info!(
                "Workspace {} completed (pr: {})",
                workspace_id,
                pr_url.as_deref().unwrap_or("none detected")
            );
        }
        Ok(Ok(code)) => {
            let tail = ctx
                .db
                .tail_workspace_logs(workspace_id, CRASH_LOG_TAIL)
                .await
                .unwrap_or_default();
            let err = WorkspaceError::new(
                "container_crashed",
                format!("agent exited with code {}", code),
            )
            .with_details(serde_json::json!({ "logs": tail }));
            let _ = ctx.db.set_workspace_error(workspace_id, &err.to_json()).await;
            let _ = ctx
                .db
                .set_workspace_status(workspace_id, WorkspaceStatus::ContainerCrashed)
                .await;
            let _ = ctx.db.set_issue_status(issue_id, IssueStatus::Error).await;
            let _ = ctx.db.finish_agent_run(prepared.agent_run_id, "failed").await;
            warn!("Workspace {} crashed: exit code {}", workspace_id, code);
        }
        Ok(Err(e)) => {
            let err = WorkspaceError::new("container_crashed", e.to_string());
            let _ = ctx.db.set_workspace_error(workspace_id, &err.to_json()).await;
            let _ = ctx
                .db
                .set_workspace_status(workspace_id, WorkspaceStatus::ContainerCrashed)
                .await;
            let _ = ctx.db.set_issue_status(issue_id, IssueStatus::Error).await;
            let _ = ctx.db.finish_agent_run(prepared.agent_run_id, "failed").await;
            warn!("Workspace {} exec failed: {}", workspace_id, e);
        }
        Err(join_error) => {
            let err = WorkspaceError::new(
                "container_crashed",
                format!("exec task aborted: {}", join_error),
            );
            let _ = ctx.db.set_workspace_error(workspace_id, &err.to_json()).await;
            let _ = ctx
                .db
                .set_workspace_status(workspace_id, WorkspaceStatus::ContainerCrashed)
                .await;
            let _ = ctx.db.set_issue_status(issue_id, IssueStatus::Error).await;
            let _ = ctx.db.finish_agent_run(prepared.agent_run_id, "failed").await;
        }
    }
}

/// Step 12: wait out the grace period for late output, then stop and
/// remove the container and stamp `destroyed_at`.
async fn grace_and_teardown(
    ctx: &RunnerContext,
    cancel: &CancellationToken,
    workspace_id: i64,
    container_id: &str,
) {
    let grace = ctx.config.workspace.grace_seconds;
    if grace > 0 {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(std::time::Duration::from_secs(grace)) => {}
        }
    }

    if let Err(e) = ctx.runtime.stop_and_remove(container_id).await {
        warn!("Failed to tear down container {}: {}", container_id, e);
    }
    let _ = ctx.db.mark_workspace_destroyed(workspace_id).await;
    debug!("Workspace {} torn down", workspace_id);
}

/// Persist a failure into the workspace row.
async fn fail_workspace(
    ctx: &RunnerContext,
    workspace_id: i64,
    issue_id: i64,
    status: WorkspaceStatus,
    err: &WorkspaceError,
) {
    let _ = ctx.db.set_workspace_error(workspace_id, &err.to_json()).await;
    let _ = ctx.db.set_workspace_status(workspace_id, status).await;
    let _ = ctx.db.set_issue_status(issue_id, IssueStatus::Error).await;
}

/// How long a cancelled runner gets to persist its terminal state before
/// destroy falls back to settling the row itself.
const CANCEL_SETTLE_SECS: u64 = 30;

/// Idempotent destroy.
///
/// While a runner is in flight it stays the sole writer of the
/// workspace's terminal state: destroy only signals its token and waits
/// for the runner's own `cancelled` write (container removal and issue
/// release included). The direct-cleanup path below runs only for
/// workspaces no runner owns, such as rows left over from a previous
/// process.
pub async fn destroy_workspace(
    ctx: &RunnerContext,
    registry: &Arc<RunnerRegistry>,
    workspace_id: i64,
) -> RunnerResult<Workspace> {
    ctx.db
        .get_workspace(workspace_id)
        .await?
        .ok_or(RunnerError::WorkspaceNotFound(workspace_id))?;

    if let Some(finished) = registry.cancel(workspace_id) {
        let settled = tokio::time::timeout(
            std::time::Duration::from_secs(CANCEL_SETTLE_SECS),
            finished.cancelled(),
        )
        .await;
        if settled.is_err() {
            warn!(
                "Runner for workspace {} did not settle within {}s of cancel",
                workspace_id, CANCEL_SETTLE_SECS
            );
        }
    }

    // Re-read: the runner may have settled the row while we waited.
    let workspace = ctx
        .db
        .get_workspace(workspace_id)
        .await?
        .ok_or(RunnerError::WorkspaceNotFound(workspace_id))?;

    if !workspace.status.is_terminal() {
        if let Some(container_id) = &workspace.container_id {
            if let Err(e) = ctx.runtime.force_remove(container_id).await {
                warn!("Failed to remove container {}: {}", container_id, e);
            }
        }
        let _ = ctx
            .db
            .set_workspace_status(workspace_id, WorkspaceStatus::Destroyed)
            .await;
        if let Some(issue) = ctx.db.get_issue(workspace.issue_id).await? {
            if issue.status == IssueStatus::Fixing {
                ctx.db
                    .set_issue_status(issue.id, IssueStatus::Open)
                    .await?;
            }
        }
    } else if let Some(container_id) = &workspace.container_id {
        // Terminal row with a leftover container (grace teardown never
        // finished): clean it up without touching the status.
        if let Err(e) = ctx.runtime.force_remove(container_id).await {
            warn!("Failed to remove container {}: {}", container_id, e);
        }
    }

    ctx.db.mark_workspace_destroyed(workspace_id).await?;
    let workspace = ctx
        .db
        .get_workspace(workspace_id)
        .await?
        .ok_or(RunnerError::WorkspaceNotFound(workspace_id))?;
    Ok(workspace)
}
