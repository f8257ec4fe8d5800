//! Diagnostics command: report daemon prerequisites

use std::path::PathBuf;

use anyhow::Result;

use autofix_daemon::config::Configuration;
use autofix_daemon::docker::{resolve_socket_path, ContainerRuntime, DockerClient};

pub async fn run(config_path: &str) -> Result<()> {
    println!("autofix-daemon {}", env!("CARGO_PKG_VERSION"));

    let config = Configuration::load(config_path)?;

    let socket = match &config.docker.socket {
        Some(socket) => {
            println!("docker socket (configured): {}", socket);
            Some(PathBuf::from(socket))
        }
        None => match resolve_socket_path() {
            Ok(path) => {
                println!("docker socket (resolved):   {}", path.display());
                Some(path)
            }
            Err(e) => {
                println!("docker socket:              NOT FOUND ({})", e);
                None
            }
        },
    };

    if let Some(socket) = socket {
        let client = DockerClient::with_socket(socket);
        match client.ping().await {
            Ok(()) => println!("docker ping:                ok"),
            Err(e) => println!("docker ping:                FAILED ({})", e),
        }
    }

    match tokio::process::Command::new("gh").arg("--version").output().await {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            println!(
                "gh CLI:                     {}",
                version.lines().next().unwrap_or("unknown")
            );
        }
        _ => println!("gh CLI:                     NOT FOUND"),
    }

    println!(
        "webhook secret:             {}",
        if config.webhook.secret.is_some() { "configured" } else { "missing" }
    );
    println!(
        "completion API key:         {}",
        if config.completion.api_key.is_some() { "configured" } else { "missing" }
    );
    println!(
        "provider token:             {}",
        if config.provider.token.is_some() { "configured" } else { "missing" }
    );

    Ok(())
}
