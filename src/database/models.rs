//! Persisted entity types
//!
//! Row structs and status enums for everything the daemon stores. Statuses
//! are persisted as lowercase strings and parsed back on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an issue, advancing along a DAG:
/// pending -> extracting -> {open, error}; open -> fixing -> {pr_open, error};
/// pr_open -> fixed (via webhook event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Pending,
    Extracting,
    Open,
    Fixing,
    PrOpen,
    Fixed,
    Error,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Pending => "pending",
            IssueStatus::Extracting => "extracting",
            IssueStatus::Open => "open",
            IssueStatus::Fixing => "fixing",
            IssueStatus::PrOpen => "pr_open",
            IssueStatus::Fixed => "fixed",
            IssueStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IssueStatus::Pending),
            "extracting" => Ok(IssueStatus::Extracting),
            // Legacy rows written before the rename
            "extracted" | "open" => Ok(IssueStatus::Open),
            "fixing" => Ok(IssueStatus::Fixing),
            "pr_open" => Ok(IssueStatus::PrOpen),
            "fixed" => Ok(IssueStatus::Fixed),
            "error" => Ok(IssueStatus::Error),
            other => Err(format!("unknown issue status: {}", other)),
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a workspace. Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Pending,
    Building,
    Running,
    Completed,
    BuildFailed,
    ContainerCrashed,
    Timeout,
    Destroyed,
    Cancelled,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Building => "building",
            WorkspaceStatus::Running => "running",
            WorkspaceStatus::Completed => "completed",
            WorkspaceStatus::BuildFailed => "build_failed",
            WorkspaceStatus::ContainerCrashed => "container_crashed",
            WorkspaceStatus::Timeout => "timeout",
            WorkspaceStatus::Destroyed => "destroyed",
            WorkspaceStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkspaceStatus::Completed
                | WorkspaceStatus::BuildFailed
                | WorkspaceStatus::ContainerCrashed
                | WorkspaceStatus::Timeout
                | WorkspaceStatus::Destroyed
                | WorkspaceStatus::Cancelled
        )
    }
}

impl std::str::FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkspaceStatus::Pending),
            "building" => Ok(WorkspaceStatus::Building),
            "running" => Ok(WorkspaceStatus::Running),
            "completed" => Ok(WorkspaceStatus::Completed),
            "build_failed" => Ok(WorkspaceStatus::BuildFailed),
            "container_crashed" => Ok(WorkspaceStatus::ContainerCrashed),
            "timeout" => Ok(WorkspaceStatus::Timeout),
            "destroyed" => Ok(WorkspaceStatus::Destroyed),
            "cancelled" => Ok(WorkspaceStatus::Cancelled),
            other => Err(format!("unknown workspace status: {}", other)),
        }
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a contribution, mutated by inbound provider events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Pending,
    PrOpen,
    Merged,
    Closed,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionStatus::Pending => "pending",
            ContributionStatus::PrOpen => "pr_open",
            ContributionStatus::Merged => "merged",
            ContributionStatus::Closed => "closed",
        }
    }
}

impl std::str::FromStr for ContributionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ContributionStatus::Pending),
            "pr_open" => Ok(ContributionStatus::PrOpen),
            "merged" => Ok(ContributionStatus::Merged),
            "closed" => Ok(ContributionStatus::Closed),
            other => Err(format!("unknown contribution status: {}", other)),
        }
    }
}

impl std::fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the exec stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl std::str::FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            other => Err(format!("unknown log stream: {}", other)),
        }
    }
}

/// A tracked source repository. Fork fields are populated lazily on the
/// first spawn that needs them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub full_name: String,
    pub origin_url: String,
    pub fork_full_name: Option<String>,
    pub fork_url: Option<String>,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A defect tracker entry extracted from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub repository_id: i64,
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub labels: Vec<String>,
    pub status: IssueStatus,
    pub ai_fix_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Toolchain facts rederived on each extraction; required before spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEnvironment {
    pub id: i64,
    pub repository_id: i64,
    pub runtime: String,
    pub package_manager: Option<String>,
    pub setup_command: Option<String>,
    pub test_command: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A configured coding agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One invocation of an agent against an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: i64,
    pub agent_id: i64,
    pub issue_id: i64,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Opaque agent state snapshot, scoped to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: i64,
    pub agent_run_id: i64,
    pub contribution_id: Option<i64>,
    pub state: Option<String>,
    pub suspended: bool,
    pub updated_at: DateTime<Utc>,
}

/// A single attempt at fixing one issue: container, recipe, log stream,
/// terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub agent_id: i64,
    pub agent_run_id: Option<i64>,
    pub repository_id: i64,
    pub issue_id: i64,
    pub container_id: Option<String>,
    pub status: WorkspaceStatus,
    pub branch_name: String,
    pub base_branch: String,
    pub timeout_minutes: f64,
    pub expires_at: DateTime<Utc>,
    pub recipe: Option<String>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

/// Append-only log line captured from the exec stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceLog {
    pub id: i64,
    pub workspace_id: i64,
    pub stream: LogStream,
    pub line: String,
    pub created_at: DateTime<Utc>,
}

/// The durable record of a produced (or pending) pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub id: i64,
    pub agent_run_id: Option<i64>,
    pub issue_id: i64,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub branch_name: Option<String>,
    pub status: ContributionStatus,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Raw inbound provider event, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub contribution_id: Option<i64>,
    pub event_type: String,
    pub action: Option<String>,
    pub payload: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Structured error blob persisted on failed workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl WorkspaceError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Serialized form stored in `workspaces.error_message`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}
