//! Daemon socket discovery
//!
//! Resolution order: explicit environment override, the Docker CLI's
//! current context, the user's rootless socket, the system socket. The
//! first candidate that can be stat-ed wins and is cached process-wide.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use sha2::{Digest, Sha256};
use tracing::debug;

use super::{DockerError, DockerResult};

static SOCKET_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Resolve the daemon socket, caching the first successful answer for the
/// life of the process.
pub fn resolve_socket_path() -> DockerResult<PathBuf> {
    if let Some(cached) = SOCKET_PATH.get() {
        return Ok(cached.clone());
    }

    let resolved = first_usable(candidate_paths(
        std::env::var("DOCKER_SOCKET").ok(),
        std::env::var("DOCKER_HOST").ok(),
        std::env::var("HOME").ok().map(PathBuf::from),
        std::env::var("XDG_RUNTIME_DIR").ok().map(PathBuf::from),
    ))
    .ok_or(DockerError::SocketNotFound)?;

    debug!("Resolved daemon socket: {}", resolved.display());
    Ok(SOCKET_PATH.get_or_init(|| resolved).clone())
}

/// First candidate that exists on disk.
pub(crate) fn first_usable(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|p| p.metadata().is_ok())
}

/// Candidate socket paths, highest priority first.
pub(crate) fn candidate_paths(
    socket_override: Option<String>,
    docker_host: Option<String>,
    home: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(path) = socket_override {
        candidates.push(PathBuf::from(strip_unix_scheme(&path)));
    }

    // DOCKER_HOST only helps when it points at a unix socket.
    if let Some(host) = docker_host {
        if host.starts_with("unix://") || host.starts_with('/') {
            candidates.push(PathBuf::from(strip_unix_scheme(&host)));
        }
    }

    if let Some(home) = &home {
        if let Some(path) = context_socket(home) {
            candidates.push(path);
        }
    }

    if let Some(dir) = runtime_dir {
        candidates.push(dir.join("docker.sock"));
    } else if let Some(uid) = process_uid() {
        candidates.push(PathBuf::from(format!("/run/user/{}/docker.sock", uid)));
    }

    candidates.push(PathBuf::from("/var/run/docker.sock"));
    candidates
}

fn strip_unix_scheme(value: &str) -> &str {
    value.strip_prefix("unix://").unwrap_or(value)
}

/// Follow `~/.docker/config.json` to the current context's endpoint.
///
/// Context metadata lives at
/// `~/.docker/contexts/meta/<sha256(context-name)>/meta.json` with the
/// endpoint under `Endpoints.docker.Host`.
fn context_socket(home: &Path) -> Option<PathBuf> {
    let config = std::fs::read_to_string(home.join(".docker/config.json")).ok()?;
    let config: serde_json::Value = serde_json::from_str(&config).ok()?;
    let context = config.get("currentContext")?.as_str()?;

    let digest = hex::encode(Sha256::digest(context.as_bytes()));
    let meta_path = home
        .join(".docker/contexts/meta")
        .join(digest)
        .join("meta.json");
    let meta = std::fs::read_to_string(meta_path).ok()?;
    let meta: serde_json::Value = serde_json::from_str(&meta).ok()?;
    let host = meta.get("Endpoints")?.get("docker")?.get("Host")?.as_str()?;

    if host.starts_with("unix://") {
        Some(PathBuf::from(strip_unix_scheme(host)))
    } else {
        None
    }
}

#[cfg(unix)]
fn process_uid() -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").ok().map(|m| m.uid())
}

#[cfg(not(unix))]
fn process_uid() -> Option<u32> {
    None
}
