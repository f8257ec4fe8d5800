//! Wire types for the daemon API

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Everything needed to create and start a workspace container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    /// KEY=VALUE pairs.
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub tty: bool,
    pub labels: HashMap<String, String>,
    /// host-path:container-path[:ro] bind mounts.
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
}

/// POST /containers/create request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainerRequest<'a> {
    pub image: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
    pub tty: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<&'a str, &'a str>,
    pub host_config: HostConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<&'a str>,
}

impl<'a> CreateContainerRequest<'a> {
    pub fn from_spec(spec: &'a ContainerSpec) -> Self {
        Self {
            image: &spec.image,
            cmd: spec.cmd.iter().map(String::as_str).collect(),
            env: spec.env.iter().map(String::as_str).collect(),
            working_dir: spec.working_dir.as_deref(),
            user: spec.user.as_deref(),
            tty: spec.tty,
            labels: spec
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            host_config: HostConfig {
                binds: spec.binds.iter().map(String::as_str).collect(),
                network_mode: spec.network_mode.as_deref(),
            },
        }
    }
}

/// Create-style responses carrying an id.
#[derive(Debug, Deserialize)]
pub struct IdResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Warnings", default)]
    pub warnings: Vec<String>,
}

/// POST /containers/{id}/exec request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateExecRequest<'a> {
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub cmd: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<&'a str>,
}

/// POST /exec/{id}/start request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartExecRequest {
    pub detach: bool,
    pub tty: bool,
}

/// GET /exec/{id}/json response (the fields we read).
#[derive(Debug, Deserialize)]
pub struct ExecInspect {
    #[serde(rename = "ExitCode")]
    pub exit_code: Option<i64>,
    #[serde(rename = "Running", default)]
    pub running: bool,
}

/// GET /containers/{id}/json response (the fields we read).
#[derive(Debug, Deserialize)]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "State", default)]
    pub state: Option<ContainerInspectState>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerInspectState {
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "ExitCode")]
    pub exit_code: Option<i64>,
}

/// Distilled container status used by the runner and reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub running: bool,
}

/// Error body the daemon returns on status >= 400.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_serialization() {
        let mut spec = ContainerSpec {
            image: "uc-workspace-acme-widget:3".to_string(),
            cmd: vec!["tail".into(), "-f".into(), "/tmp/agent.log".into()],
            env: vec!["GITHUB_TOKEN=tok".into()],
            working_dir: Some("/home/agent/repo".into()),
            user: Some("agent".into()),
            tty: true,
            labels: HashMap::new(),
            binds: vec!["/home/op/.ssh/id_ed25519:/home/agent/.ssh/id_ed25519:ro".into()],
            network_mode: Some("host".into()),
        };
        spec.labels.insert("managed-by".into(), "autofix".into());

        let value =
            serde_json::to_value(CreateContainerRequest::from_spec(&spec)).unwrap();
        assert_eq!(value["Image"], "uc-workspace-acme-widget:3");
        assert_eq!(value["Cmd"][0], "tail");
        assert_eq!(value["Tty"], true);
        assert_eq!(value["WorkingDir"], "/home/agent/repo");
        assert_eq!(value["HostConfig"]["NetworkMode"], "host");
        assert_eq!(
            value["HostConfig"]["Binds"][0],
            "/home/op/.ssh/id_ed25519:/home/agent/.ssh/id_ed25519:ro"
        );
        assert_eq!(value["Labels"]["managed-by"], "autofix");
    }

    #[test]
    fn test_exec_inspect_deserialization() {
        let inspect: ExecInspect =
            serde_json::from_str(r#"{"ExitCode": 0, "Running": false, "Pid": 0}"#).unwrap();
        assert_eq!(inspect.exit_code, Some(0));
        assert!(!inspect.running);
    }
}
