//! Workspace orchestration
//!
//! A workspace is one attempt at fixing one issue: a container built from
//! a synthesized recipe, the agent exec inside it, the captured log
//! stream, and the terminal outcome. Each in-flight workspace is owned by
//! exactly one runner task from spawn to terminal state.

mod logs;
pub mod prompt;
mod reconcile;
mod registry;
pub(crate) mod runner;

pub use logs::LineBuffer;
pub use reconcile::reconcile_workspaces;
pub use registry::RunnerRegistry;
pub use runner::{destroy_workspace, spawn_workspace, RunnerContext, SpawnRequest};

use thiserror::Error;

use crate::database::DatabaseError;
use crate::docker::DockerError;
use crate::provider::ProviderError;
use crate::recipe::SynthesisError;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("issue {0} not found")]
    IssueNotFound(i64),

    #[error("workspace {0} not found")]
    WorkspaceNotFound(i64),

    #[error("repository {0} not found")]
    RepositoryNotFound(i64),

    #[error("agent {0} not found")]
    AgentNotFound(i64),

    #[error("repository {0} has no extracted environment")]
    EnvironmentMissing(i64),

    #[error("concurrency limit reached: {0} workspace(s) already in flight")]
    ConcurrencyLimit(usize),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("daemon error: {0}")]
    Docker(#[from] DockerError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("recipe synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("build failed after {attempts} attempts: {message}")]
    BuildExhausted { attempts: u32, message: String },
}

pub type RunnerResult<T> = Result<T, RunnerError>;
