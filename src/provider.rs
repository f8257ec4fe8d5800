//! Provider (GitHub) interactions via the `gh` CLI
//!
//! The daemon shells out to the operator's authenticated `gh` binary for
//! the pre-spawn checks: making sure a fork exists and looking for an
//! already-open pull request referencing an issue.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to spawn gh: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("gh {command} exited with {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to parse gh output: {0}")]
    Parse(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// A fork owned by the operator's account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkInfo {
    pub full_name: String,
    pub url: String,
}

/// An open pull request on the origin repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub url: String,
    pub number: i64,
    pub head_ref: String,
}

/// Seam for provider lookups; runner tests substitute a mock.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Return the operator's fork of `origin_full_name`, creating it if
    /// absent.
    async fn ensure_fork(&self, origin_full_name: &str) -> ProviderResult<ForkInfo>;

    /// Find an open PR on the origin that references the issue, either via
    /// its head branch or an issue mention.
    async fn find_open_pr(
        &self,
        origin_full_name: &str,
        issue_number: i64,
        branch_name: &str,
    ) -> ProviderResult<Option<PullRequestRef>>;
}

#[derive(Debug, Deserialize)]
struct RepoView {
    #[serde(rename = "nameWithOwner")]
    name_with_owner: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct PrListEntry {
    number: i64,
    url: String,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
}

/// `gh`-backed provider client.
pub struct GhCliProvider {
    token: Option<String>,
}

impl GhCliProvider {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    async fn run(&self, args: &[&str]) -> ProviderResult<String> {
        let mut command = Command::new("gh");
        command.args(args);
        if let Some(token) = &self.token {
            command.env("GH_TOKEN", token);
        }

        let output = command.output().await?;
        if !output.status.success() {
            return Err(ProviderError::Command {
                command: args.join(" "),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn current_login(&self) -> ProviderResult<String> {
        let out = self.run(&["api", "user", "--jq", ".login"]).await?;
        Ok(out.trim().to_string())
    }

    async fn view_repo(&self, full_name: &str) -> ProviderResult<Option<ForkInfo>> {
        match self
            .run(&["repo", "view", full_name, "--json", "nameWithOwner,url"])
            .await
        {
            Ok(out) => {
                let view: RepoView = serde_json::from_str(&out)
                    .map_err(|e| ProviderError::Parse(e.to_string()))?;
                Ok(Some(ForkInfo {
                    full_name: view.name_with_owner,
                    url: view.url,
                }))
            }
            // `gh repo view` exits non-zero when the repo does not exist.
            Err(ProviderError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ProviderClient for GhCliProvider {
    async fn ensure_fork(&self, origin_full_name: &str) -> ProviderResult<ForkInfo> {
        let login = self.current_login().await?;
        let repo_name = origin_full_name
            .split('/')
            .nth(1)
            .ok_or_else(|| ProviderError::Parse(format!("bad repo name: {}", origin_full_name)))?;
        let fork_full_name = format!("{}/{}", login, repo_name);

        if let Some(existing) = self.view_repo(&fork_full_name).await? {
            debug!("Fork {} already exists", existing.full_name);
            return Ok(existing);
        }

        info!("Forking {} as {}", origin_full_name, fork_full_name);
        self.run(&["repo", "fork", origin_full_name, "--clone=false"])
            .await?;

        self.view_repo(&fork_full_name)
            .await?
            .ok_or_else(|| ProviderError::Parse(format!("fork {} not visible", fork_full_name)))
    }

    async fn find_open_pr(
        &self,
        origin_full_name: &str,
        issue_number: i64,
        branch_name: &str,
    ) -> ProviderResult<Option<PullRequestRef>> {
        let out = self
            .run(&[
                "pr",
                "list",
                "--repo",
                origin_full_name,
                "--state",
                "open",
                "--json",
                "number,url,title,body,headRefName",
            ])
            .await?;

        let entries: Vec<PrListEntry> =
            serde_json::from_str(&out).map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(select_pr_for_issue(&entries, issue_number, branch_name))
    }
}

/// Pick the open PR that belongs to this issue: a matching head branch
/// wins, otherwise the first PR mentioning the issue number.
fn select_pr_for_issue(
    entries: &[PrListEntry],
    issue_number: i64,
    branch_name: &str,
) -> Option<PullRequestRef> {
    let mention = format!("#{}", issue_number);

    let by_branch = entries.iter().find(|e| e.head_ref_name == branch_name);
    let by_mention = entries
        .iter()
        .find(|e| e.title.contains(&mention) || e.body.contains(&mention));

    by_branch.or(by_mention).map(|e| PullRequestRef {
        url: e.url.clone(),
        number: e.number,
        head_ref: e.head_ref_name.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(number: i64, head: &str, title: &str, body: &str) -> PrListEntry {
        PrListEntry {
            number,
            url: format!("https://github.com/acme/widget/pull/{}", number),
            title: title.to_string(),
            body: body.to_string(),
            head_ref_name: head.to_string(),
        }
    }

    #[test]
    fn test_branch_match_wins_over_mention() {
        let entries = vec![
            entry(5, "other-branch", "Mentions #42 in passing", ""),
            entry(7, "fix/issue-42", "Fix widget crash", ""),
        ];

        let found = select_pr_for_issue(&entries, 42, "fix/issue-42").unwrap();
        assert_eq!(found.number, 7);
    }

    #[test]
    fn test_mention_in_body_matches() {
        let entries = vec![entry(9, "some-branch", "A fix", "Closes #42")];
        let found = select_pr_for_issue(&entries, 42, "fix/issue-42").unwrap();
        assert_eq!(found.number, 9);
    }

    #[test]
    fn test_no_match_returns_none() {
        let entries = vec![entry(3, "unrelated", "Refactor #7", "")];
        assert!(select_pr_for_issue(&entries, 42, "fix/issue-42").is_none());
    }

    #[test]
    fn test_pr_list_parsing() {
        let json = r#"[{"number":7,"url":"https://github.com/acme/widget/pull/7",
            "title":"Fix crash","body":"Fixes #42","headRefName":"fix/issue-42"}]"#;
        let entries: Vec<PrListEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries[0].head_ref_name, "fix/issue-42");
    }
}
