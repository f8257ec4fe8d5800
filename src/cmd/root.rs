//! Main daemon command - starts the daemon server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use autofix_daemon::completion::{CompletionBackend, CompletionClient, UnconfiguredBackend};
use autofix_daemon::config::Configuration;
use autofix_daemon::database::Database;
use autofix_daemon::docker::{ContainerRuntime, DockerClient};
use autofix_daemon::provider::GhCliProvider;
use autofix_daemon::router::{self, AppState};
use autofix_daemon::workspace::{reconcile_workspaces, RunnerContext, RunnerRegistry};

/// Run the daemon
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);

    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Database: {}", config.database.path.display());

    let db = Arc::new(Database::open(&config.database.path)?);

    let docker = match &config.docker.socket {
        Some(socket) => DockerClient::with_socket(PathBuf::from(socket)),
        None => DockerClient::new()?,
    };
    info!("  Docker socket: {}", docker.socket_path().display());
    match docker.ping().await {
        Ok(()) => info!("Container daemon is reachable"),
        Err(e) => warn!("Container daemon is not reachable yet: {}", e),
    }

    let completion: Arc<dyn CompletionBackend> = match CompletionClient::new(&config.completion) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            warn!("Completion RPC not configured ({}); spawns will fail until it is", e);
            Arc::new(UnconfiguredBackend)
        }
    };

    let provider = Arc::new(GhCliProvider::new(config.provider.token.clone()));

    let ctx = RunnerContext {
        db,
        runtime: Arc::new(docker),
        provider,
        completion,
        config: config.clone(),
    };

    // Settle workspaces orphaned by a previous process before accepting
    // new work.
    match reconcile_workspaces(&ctx).await {
        Ok(0) => {}
        Ok(n) => info!("Reconciled {} orphaned workspace(s)", n),
        Err(e) => warn!("Workspace reconciliation failed: {}", e),
    }

    let shutdown = CancellationToken::new();
    let registry = Arc::new(RunnerRegistry::new(shutdown.clone()));

    let state = AppState {
        ctx,
        registry: registry.clone(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Listening on {}", bind_addr);

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, cancelling runners...");
            shutdown_signal.cancel();
        }
    });

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    // Give cancelled runners a moment to persist their terminal states.
    for _ in 0..50 {
        if registry.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    info!("Daemon stopped");
    Ok(())
}
