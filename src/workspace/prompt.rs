//! Fix prompt and agent invocation script construction
//!
//! The prompt is written into a file inside the container through a
//! bounded heredoc so arbitrary issue text never meets shell quoting; the
//! agent is then invoked referencing that file.

use std::sync::OnceLock;

use regex::Regex;

use crate::database::models::{Contribution, Issue, Repository, RepositoryEnvironment};
use crate::recipe::CONTAINER_REPO_DIR;

/// Path the fix prompt is written to inside the container.
pub const PROMPT_PATH: &str = "/tmp/fix-prompt.md";

/// Log file the container's keep-alive command tails and the agent
/// invocation appends to.
pub const AGENT_LOG_PATH: &str = "/tmp/agent.log";

/// Matches a GitHub pull-request URL in agent output.
pub fn pr_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"https://github\.com/[^/\s]+/[^/\s]+/pull/\d+")
            .expect("pull-request pattern is valid")
    })
}

/// Extract the PR number from a pull-request URL.
pub fn pr_number_from_url(url: &str) -> Option<i64> {
    url.rsplit('/').next()?.parse().ok()
}

/// Branch used for a fresh fix attempt.
pub fn branch_name_for_issue(issue_number: i64) -> String {
    format!("fix/issue-{}", issue_number)
}

/// Compose the fix prompt. A re-run (prior contribution with a branch)
/// reuses the branch and updates the existing PR instead of opening a new
/// one.
pub fn build_fix_prompt(
    issue: &Issue,
    repository: &Repository,
    environment: &RepositoryEnvironment,
    branch_name: &str,
    base_branch: &str,
    prior: Option<&Contribution>,
) -> String {
    let mut prompt = format!(
        "You are fixing a reported issue in {repo}.\n\
         The repository is cloned at {dir}; 'origin' is your fork, \
         'upstream' is {origin}.\n\
         \n\
         Issue #{number}: {title}\n",
        repo = repository.full_name,
        dir = CONTAINER_REPO_DIR,
        origin = repository.origin_url,
        number = issue.number,
        title = issue.title,
    );

    if !issue.labels.is_empty() {
        prompt.push_str(&format!("Labels: {}\n", issue.labels.join(", ")));
    }
    if let Some(body) = &issue.body {
        if !body.trim().is_empty() {
            prompt.push_str(&format!("\nIssue description:\n{}\n", body.trim()));
        }
    }

    prompt.push_str(&format!(
        "\nToolchain: {runtime}{pm}\n",
        runtime = environment.runtime,
        pm = environment
            .package_manager
            .as_deref()
            .map(|p| format!(" ({})", p))
            .unwrap_or_default(),
    ));
    if let Some(setup) = &environment.setup_command {
        prompt.push_str(&format!("Setup: {}\n", setup));
    }
    if let Some(test) = &environment.test_command {
        prompt.push_str(&format!("Run tests with: {}\n", test));
    }

    if let Some(extra) = &issue.ai_fix_prompt {
        if !extra.trim().is_empty() {
            prompt.push_str(&format!("\nAdditional guidance:\n{}\n", extra.trim()));
        }
    }

    match prior {
        Some(contribution) => {
            prompt.push_str(&format!(
                "\nIMPORTANT: this is a RE-RUN. A previous attempt already \
                 pushed branch '{branch}'",
                branch = branch_name,
            ));
            if let Some(url) = &contribution.pr_url {
                prompt.push_str(&format!(" and opened {}", url));
            }
            prompt.push_str(&format!(
                ".\nSteps:\n\
                 1. git fetch upstream and rebase '{branch}' onto upstream/{base}.\n\
                 2. Address the issue on the SAME branch name '{branch}'.\n\
                 3. Verify the fix, then push to origin with --force-with-lease.\n\
                 4. Do NOT create a new pull request; pushing the branch \
                 updates the existing one.\n",
                branch = branch_name,
                base = base_branch,
            ));
        }
        None => {
            prompt.push_str(&format!(
                "\nSteps:\n\
                 1. Create a branch named '{branch}' from {base}.\n\
                 2. Implement and verify the fix; run the test suite.\n\
                 3. Commit with a clear message referencing issue #{number}.\n\
                 4. Push the branch to origin (your fork).\n\
                 5. Open a pull request from the fork branch against \
                 {repo} {base} with 'Fixes #{number}' in the description, \
                 using the gh CLI, and print the PR URL.\n",
                branch = branch_name,
                base = base_branch,
                number = issue.number,
                repo = repository.full_name,
            ));
        }
    }

    prompt
}

/// Pick a heredoc delimiter that cannot appear in the content.
fn heredoc_delimiter(content: &str) -> String {
    let mut delimiter = String::from("UC_PROMPT_EOF");
    while content.contains(&delimiter) {
        delimiter.push('_');
    }
    delimiter
}

/// Shell script run inside the container: write the prompt file via a
/// bounded heredoc, then invoke the agent on it, mirroring all output to
/// the tailed log file.
pub fn agent_exec_script(agent_command: &str, prompt: &str) -> String {
    let delimiter = heredoc_delimiter(prompt);
    format!(
        "set -o pipefail\n\
         cat > {prompt_path} <<'{delim}'\n\
         {prompt}\n\
         {delim}\n\
         cd {repo_dir}\n\
         {agent} \"$(cat {prompt_path})\" 2>&1 | tee -a {log_path}\n",
        prompt_path = PROMPT_PATH,
        delim = delimiter,
        prompt = prompt,
        repo_dir = CONTAINER_REPO_DIR,
        agent = agent_command,
        log_path = AGENT_LOG_PATH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ContributionStatus, IssueStatus};
    use chrono::Utc;

    fn fixture() -> (Issue, Repository, RepositoryEnvironment) {
        let now = Utc::now();
        let issue = Issue {
            id: 1,
            repository_id: 1,
            number: 42,
            title: "Widget crashes on empty input".to_string(),
            body: Some("Call widget('') and observe the panic.".to_string()),
            labels: vec!["bug".to_string()],
            status: IssueStatus::Open,
            ai_fix_prompt: None,
            created_at: now,
            updated_at: now,
        };
        let repository = Repository {
            id: 1,
            full_name: "acme/widget".to_string(),
            origin_url: "https://github.com/acme/widget".to_string(),
            fork_full_name: Some("operator/widget".to_string()),
            fork_url: Some("https://github.com/operator/widget".to_string()),
            language: Some("Node.js".to_string()),
            created_at: now,
        };
        let environment = RepositoryEnvironment {
            id: 1,
            repository_id: 1,
            runtime: "node-20".to_string(),
            package_manager: Some("npm".to_string()),
            setup_command: Some("npm ci".to_string()),
            test_command: Some("npm test".to_string()),
            updated_at: now,
        };
        (issue, repository, environment)
    }

    #[test]
    fn test_pr_url_regex_matches() {
        let re = pr_url_regex();
        let line = "Created PR: https://github.com/acme/widget/pull/123 (draft)";
        assert_eq!(
            re.find(line).unwrap().as_str(),
            "https://github.com/acme/widget/pull/123"
        );
        assert!(re.find("https://github.com/acme/widget/issues/123").is_none());
    }

    #[test]
    fn test_pr_number_from_url() {
        assert_eq!(
            pr_number_from_url("https://github.com/acme/widget/pull/123"),
            Some(123)
        );
        assert_eq!(pr_number_from_url("not a url"), None);
    }

    #[test]
    fn test_fresh_prompt_opens_pr() {
        let (issue, repo, env) = fixture();
        let prompt = build_fix_prompt(&issue, &repo, &env, "fix/issue-42", "main", None);

        assert!(prompt.contains("Issue #42"));
        assert!(prompt.contains("fix/issue-42"));
        assert!(prompt.contains("Open a pull request"));
        assert!(prompt.contains("Fixes #42"));
        assert!(prompt.contains("npm test"));
        assert!(!prompt.contains("RE-RUN"));
    }

    #[test]
    fn test_rerun_prompt_reuses_branch_and_skips_pr() {
        let (issue, repo, env) = fixture();
        let now = Utc::now();
        let prior = Contribution {
            id: 1,
            agent_run_id: None,
            issue_id: 1,
            pr_url: Some("https://github.com/acme/widget/pull/7".to_string()),
            pr_number: Some(7),
            branch_name: Some("fix/issue-42".to_string()),
            status: ContributionStatus::PrOpen,
            summary: None,
            created_at: now,
            updated_at: now,
        };

        let prompt = build_fix_prompt(&issue, &repo, &env, "fix/issue-42", "main", Some(&prior));
        assert!(prompt.contains("this is a RE-RUN"));
        assert!(prompt.contains("Do NOT create a new pull request"));
        assert!(prompt.contains("rebase 'fix/issue-42' onto upstream/main"));
        assert!(prompt.contains("https://github.com/acme/widget/pull/7"));
    }

    #[test]
    fn test_heredoc_delimiter_avoids_collision() {
        let content = "text containing UC_PROMPT_EOF marker";
        let delimiter = heredoc_delimiter(content);
        assert!(!content.contains(&delimiter));
        assert_eq!(delimiter, "UC_PROMPT_EOF_");
    }

    #[test]
    fn test_exec_script_shape() {
        let script = agent_exec_script("claude -p", "fix the bug");
        assert!(script.contains("cat > /tmp/fix-prompt.md <<'UC_PROMPT_EOF'"));
        assert!(script.contains("fix the bug\n"));
        assert!(script.contains("claude -p \"$(cat /tmp/fix-prompt.md)\""));
        assert!(script.contains("tee -a /tmp/agent.log"));
        assert!(script.contains("set -o pipefail"));
    }

    #[test]
    fn test_exec_script_heredoc_is_bounded_on_collision() {
        let script = agent_exec_script("claude -p", "sneaky\nUC_PROMPT_EOF\npayload");
        // The shifted delimiter bounds the heredoc.
        assert!(script.contains("<<'UC_PROMPT_EOF_'"));
        assert!(script.contains("\nUC_PROMPT_EOF_\n"));
    }
}
