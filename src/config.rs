//! Configuration structures and loading
//!
//! Settings come from an optional TOML file with environment variables
//! layered on top. Every field has a default so a bare `autofix-daemon run`
//! works against the local Docker socket.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Enable debug mode
    pub debug: bool,

    /// API server configuration
    pub api: ApiConfiguration,

    /// State database location
    pub database: DatabaseConfiguration,

    /// Container daemon configuration
    pub docker: DockerConfiguration,

    /// Provider (GitHub) configuration
    pub provider: ProviderConfiguration,

    /// Inbound webhook verification
    pub webhook: WebhookConfiguration,

    /// Text-completion RPC configuration
    pub completion: CompletionConfiguration,

    /// Issue-extraction RPC configuration
    pub extraction: ExtractionConfiguration,

    /// Workspace defaults
    pub workspace: WorkspaceConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file is absent, then apply environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse configuration: {}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Configuration::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file: {}", path))
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables take precedence over the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.api.port = port;
            }
        }
        if let Ok(socket) = std::env::var("DOCKER_SOCKET") {
            self.docker.socket = Some(socket);
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            if let Some(path) = host.strip_prefix("unix://") {
                self.docker.socket = Some(path.to_string());
            }
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            self.provider.token = Some(token);
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Ok(key) = std::env::var("COMPLETION_API_KEY") {
            self.completion.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("EXTRACTION_API_KEY") {
            self.extraction.api_key = Some(key);
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfiguration {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// State database location
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfiguration {
    /// Path to the SQLite file
    pub path: PathBuf,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/autofix.db"),
        }
    }
}

/// Container daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DockerConfiguration {
    /// Explicit socket path; resolved automatically when unset
    pub socket: Option<String>,
}

/// Provider (GitHub) configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfiguration {
    /// Token passed to containers for CLI auth
    pub token: Option<String>,
}

/// Inbound webhook verification
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfiguration {
    /// HMAC-SHA256 shared secret
    pub secret: Option<String>,
}

/// Text-completion RPC configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfiguration {
    /// Chat-completions endpoint
    pub url: String,

    /// API key
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,

    /// Request timeout in seconds
    pub timeout: u64,

    /// Total attempts per completion call, transient failures included
    pub max_attempts: u32,

    /// Wait before the first retry; doubles per retry
    pub initial_backoff_ms: u64,
}

impl Default for CompletionConfiguration {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1/chat/completions".into(),
            api_key: None,
            model: "gpt-4o".into(),
            timeout: 120,
            max_attempts: 4,
            initial_backoff_ms: 250,
        }
    }
}

/// Issue-extraction RPC configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtractionConfiguration {
    /// API key for the external scraper
    pub api_key: Option<String>,
}

/// Workspace defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfiguration {
    /// Default per-workspace timeout
    pub default_timeout_minutes: f64,

    /// Post-exec grace period before teardown
    pub grace_seconds: u64,

    /// Default base branch for fix branches
    pub base_branch: String,

    /// Agent invocation inside the container; the fix prompt file path is
    /// appended as its argument
    pub agent_command: String,

    /// SSH private key bind-mounted read-only into containers
    pub ssh_key_path: Option<PathBuf>,

    /// Agent auth file bind-mounted read-only into containers
    pub agent_auth_path: Option<PathBuf>,

    /// Agent config directory bind-mounted read-only into containers
    pub agent_config_dir: Option<PathBuf>,
}

impl Default for WorkspaceConfiguration {
    fn default() -> Self {
        let home = std::env::var("HOME").ok().map(PathBuf::from);
        Self {
            default_timeout_minutes: 60.0,
            grace_seconds: 60,
            base_branch: "main".into(),
            agent_command: "claude --dangerously-skip-permissions -p".into(),
            ssh_key_path: home.as_ref().map(|h| h.join(".ssh/id_ed25519")),
            agent_auth_path: home.as_ref().map(|h| h.join(".claude.json")),
            agent_config_dir: home.as_ref().map(|h| h.join(".claude")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.workspace.default_timeout_minutes, 60.0);
        assert_eq!(config.workspace.grace_seconds, 60);
        assert!(config.webhook.secret.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Configuration = toml::from_str(
            r#"
            [api]
            port = 9000

            [workspace]
            default_timeout_minutes = 30.0
            grace_seconds = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "0.0.0.0");
        assert_eq!(config.workspace.default_timeout_minutes, 30.0);
        assert_eq!(config.workspace.grace_seconds, 0);
        assert_eq!(config.workspace.base_branch, "main");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Configuration::load("/definitely/not/here.toml").unwrap();
        assert_eq!(config.api.port, 8080);
    }
}
