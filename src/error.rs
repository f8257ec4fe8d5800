use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::database::DatabaseError;
use crate::docker::DockerError;
use crate::workspace::RunnerError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("daemon error: {0}")]
    Docker(#[from] DockerError),

    #[error("{0}")]
    Runner(#[from] RunnerError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    fn status(&self) -> StatusCode {
        match self {
            DaemonError::Database(DatabaseError::NotFound(_)) => StatusCode::NOT_FOUND,
            DaemonError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::Docker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DaemonError::Runner(e) => match e {
                RunnerError::IssueNotFound(_)
                | RunnerError::WorkspaceNotFound(_)
                | RunnerError::RepositoryNotFound(_)
                | RunnerError::AgentNotFound(_) => StatusCode::NOT_FOUND,
                RunnerError::EnvironmentMissing(_) => StatusCode::BAD_REQUEST,
                RunnerError::ConcurrencyLimit(_) => StatusCode::TOO_MANY_REQUESTS,
                RunnerError::Database(DatabaseError::NotFound(_)) => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DaemonError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DaemonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": true,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
