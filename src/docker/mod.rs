//! Container daemon protocol client
//!
//! Speaks the Docker Engine API over the local unix socket: ping, image
//! build from a recipe, create-and-start, inspect, exec with multiplexed
//! streaming, stop-and-remove. The build progress stream (NDJSON) and the
//! exec stream (8-byte-header frames) are decoded by first-class parsers
//! over explicit byte buffers; see `build` and `exec`.

mod build;
mod client;
mod exec;
mod socket;
pub mod types;

pub use build::{BuildEvent, BuildProgressParser};
pub use client::DockerClient;
pub use exec::{ExecOutput, MuxCodec, MuxFrame, StreamKind};
pub use socket::resolve_socket_path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use types::{ContainerSpec, ContainerStatus};

/// Per-request deadline for unary daemon calls.
pub const UNARY_TIMEOUT_SECS: u64 = 30;

/// Per-request deadline for streaming daemon calls (build, exec).
pub const STREAM_TIMEOUT_SECS: u64 = 300;

/// Number of trailing build progress lines attached to a build failure.
pub const BUILD_PROGRESS_TAIL: usize = 100;

/// Daemon client errors
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("no usable daemon socket found")]
    SocketNotFound,

    #[error("transport error on {path}: {message}")]
    Transport { path: String, message: String },

    #[error("request to {path} timed out after {seconds}s")]
    Timeout { path: String, seconds: u64 },

    #[error("daemon returned {status} on {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
    },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("image build failed: {message}")]
    BuildFailed {
        message: String,
        progress: Vec<String>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DockerError {
    pub(crate) fn transport(path: &str, err: impl std::fmt::Display) -> Self {
        DockerError::Transport {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

pub type DockerResult<T> = Result<T, DockerError>;

/// Seam between the workspace runner and the container daemon.
///
/// The production implementation is [`DockerClient`]; runner tests
/// substitute a mock.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// GET /_ping
    async fn ping(&self) -> DockerResult<()>;

    /// Build an image from a recipe, forwarding NDJSON progress lines to
    /// `progress`. Returns the image id.
    async fn build_image(
        &self,
        tag: &str,
        recipe: &str,
        progress: UnboundedSender<String>,
    ) -> DockerResult<String>;

    /// Create and start a container, returning its id.
    async fn create_and_start(&self, spec: &ContainerSpec) -> DockerResult<String>;

    /// Look up a container. `None` means the daemon does not know it.
    async fn inspect(&self, container_id: &str) -> DockerResult<Option<ContainerStatus>>;

    /// Run a command inside the container, streaming demultiplexed output
    /// chunks to `output`. Resolves to the exit code once the stream ends.
    async fn exec_streaming(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        output: UnboundedSender<ExecOutput>,
    ) -> DockerResult<i64>;

    /// Stop (10 s deadline) then remove the container.
    async fn stop_and_remove(&self, container_id: &str) -> DockerResult<()>;

    /// Remove the container with force, without a prior stop.
    async fn force_remove(&self, container_id: &str) -> DockerResult<()>;
}
