//! Container recipe synthesis
//!
//! Asks the text-completion RPC for a Dockerfile tailored to the target
//! repository. The generated recipe must satisfy a fixed set of
//! invariants (base image, tooling, non-root user, fork clone, keep-alive
//! command); the prompt spells those out and the response is validated
//! before it reaches the image builder.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::completion::{CompletionBackend, CompletionError};

/// Maximum synthesize-and-build attempts before a workspace fails.
pub const MAX_RECIPE_ATTEMPTS: u32 = 3;

/// Username created inside every workspace container.
pub const CONTAINER_USER: &str = "agent";

/// Where the fork is cloned inside the container.
pub const CONTAINER_REPO_DIR: &str = "/home/agent/repo";

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("completion RPC failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("generated recipe is invalid: {0}")]
    InvalidRecipe(String),
}

/// Everything the prompt needs to know about the target repository.
#[derive(Debug, Clone)]
pub struct RecipeContext {
    pub repo_full_name: String,
    pub origin_url: String,
    pub language: Option<String>,
    pub fork_url: String,
    /// Error text from the previous synthesis or build attempt, if any.
    pub previous_error: Option<String>,
}

/// Base image keyed on the repository's primary language.
pub fn base_image_for_language(language: Option<&str>) -> &'static str {
    match language.map(|l| l.to_ascii_lowercase()).as_deref() {
        Some("javascript") | Some("typescript") | Some("node") | Some("node.js") => {
            "node:20-bookworm"
        }
        Some("python") => "python:3.12-bookworm",
        Some("rust") => "rust:1-bookworm",
        Some("go") | Some("golang") => "golang:1-bookworm",
        Some("ruby") => "ruby:3-bookworm",
        Some("java") | Some("kotlin") => "eclipse-temurin:21-jdk",
        _ => "ubuntu:24.04",
    }
}

/// Remove markdown code-fence decoration from a model response.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    // Opening fence, possibly tagged (```dockerfile).
    lines.remove(0);
    if let Some(last) = lines.last() {
        if last.trim().starts_with("```") {
            lines.pop();
        }
    }
    lines.join("\n").trim().to_string()
}

/// Cheap sanity checks before handing the recipe to the daemon.
fn validate_recipe(recipe: &str) -> Result<(), SynthesisError> {
    if recipe.trim().is_empty() {
        return Err(SynthesisError::InvalidRecipe("empty response".to_string()));
    }
    if !recipe.lines().any(|l| l.trim_start().starts_with("FROM ")) {
        return Err(SynthesisError::InvalidRecipe(
            "missing FROM instruction".to_string(),
        ));
    }
    Ok(())
}

fn build_prompt(ctx: &RecipeContext) -> String {
    let base_image = base_image_for_language(ctx.language.as_deref());
    let mut prompt = format!(
        "Generate a Dockerfile for an autonomous coding-agent workspace. \
         Output only the Dockerfile content, no explanation, no markdown fences.\n\
         \n\
         Target repository: {repo} ({origin})\n\
         Primary language: {language}\n\
         Fork to clone: {fork}\n\
         \n\
         The Dockerfile must:\n\
         1. Use base image {base_image}.\n\
         2. Install curl, git, sudo, ca-certificates and build essentials; \
            install the GitHub CLI by downloading the architecture-appropriate \
            release archive from https://github.com/cli/cli/releases; install \
            the claude-code agent binary with: curl -fsSL https://claude.ai/install.sh | bash\n\
         3. Create a non-root user named '{user}' with passwordless sudo.\n\
         4. Pre-seed /home/{user}/.ssh/known_hosts with github.com host keys \
            (use ssh-keyscan at build time).\n\
         5. Clone the fork at {repo_dir} and add an 'upstream' remote pointing \
            at {origin}.\n\
         6. Extend PATH so the agent binary under /home/{user}/.local/bin is found.\n\
         7. End with a long-running default command that keeps the container \
            alive (for example tailing a log file).\n",
        repo = ctx.repo_full_name,
        origin = ctx.origin_url,
        language = ctx.language.as_deref().unwrap_or("unknown"),
        fork = ctx.fork_url,
        base_image = base_image,
        user = CONTAINER_USER,
        repo_dir = CONTAINER_REPO_DIR,
    );

    if let Some(error) = &ctx.previous_error {
        prompt.push_str(&format!(
            "\nThe previous attempt failed with the following error; fix the \
             cause in this version:\n{}\n",
            error
        ));
    }

    prompt
}

/// One-shot recipe synthesis. The attempt loop (up to
/// [`MAX_RECIPE_ATTEMPTS`], feeding the prior error back through
/// [`RecipeContext::previous_error`]) lives in the workspace runner.
pub struct RecipeSynthesizer {
    backend: Arc<dyn CompletionBackend>,
}

impl RecipeSynthesizer {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    pub async fn synthesize(&self, ctx: &RecipeContext) -> Result<String, SynthesisError> {
        let prompt = build_prompt(ctx);
        debug!(
            "Requesting recipe for {} (retry context: {})",
            ctx.repo_full_name,
            ctx.previous_error.is_some()
        );

        let response = self.backend.complete(&prompt).await?;
        let recipe = strip_code_fences(&response);

        if let Err(e) = validate_recipe(&recipe) {
            warn!("Rejected generated recipe for {}: {}", ctx.repo_full_name, e);
            return Err(e);
        }

        Ok(recipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedBackend {
        responses: Vec<String>,
        calls: AtomicUsize,
        prompts: parking_lot::Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: responses.into_iter().map(String::from).collect(),
                calls: AtomicUsize::new(0),
                prompts: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
            self.prompts.lock().push(prompt.to_string());
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.responses[index.min(self.responses.len() - 1)].clone())
        }
    }

    #[test]
    fn test_base_image_mapping() {
        assert_eq!(base_image_for_language(Some("Node.js")), "node:20-bookworm");
        assert_eq!(base_image_for_language(Some("TypeScript")), "node:20-bookworm");
        assert_eq!(base_image_for_language(Some("Python")), "python:3.12-bookworm");
        assert_eq!(base_image_for_language(Some("Rust")), "rust:1-bookworm");
        assert_eq!(base_image_for_language(Some("COBOL")), "ubuntu:24.04");
        assert_eq!(base_image_for_language(None), "ubuntu:24.04");
    }

    #[test]
    fn test_strip_plain_fences() {
        let fenced = "```\nFROM ubuntu:24.04\nRUN true\n```";
        assert_eq!(strip_code_fences(fenced), "FROM ubuntu:24.04\nRUN true");
    }

    #[test]
    fn test_strip_tagged_fences() {
        let fenced = "```dockerfile\nFROM node:20-bookworm\n```\n";
        assert_eq!(strip_code_fences(fenced), "FROM node:20-bookworm");
    }

    #[test]
    fn test_unfenced_text_passes_through() {
        assert_eq!(strip_code_fences("FROM rust:1-bookworm\n"), "FROM rust:1-bookworm");
    }

    fn ctx(previous_error: Option<String>) -> RecipeContext {
        RecipeContext {
            repo_full_name: "acme/widget".to_string(),
            origin_url: "https://github.com/acme/widget".to_string(),
            language: Some("Node.js".to_string()),
            fork_url: "https://github.com/operator/widget".to_string(),
            previous_error,
        }
    }

    #[tokio::test]
    async fn test_synthesize_strips_and_validates() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            "```dockerfile\nFROM node:20-bookworm\nUSER agent\nCMD tail -f /tmp/agent.log\n```",
        ]));
        let synthesizer = RecipeSynthesizer::new(backend);

        let recipe = synthesizer.synthesize(&ctx(None)).await.unwrap();
        assert!(recipe.starts_with("FROM node:20-bookworm"));
        assert!(!recipe.contains("```"));
    }

    #[tokio::test]
    async fn test_recipe_without_from_is_rejected() {
        let backend = Arc::new(ScriptedBackend::new(vec!["RUN echo no base image"]));
        let synthesizer = RecipeSynthesizer::new(backend);

        let result = synthesizer.synthesize(&ctx(None)).await;
        assert!(matches!(result, Err(SynthesisError::InvalidRecipe(_))));
    }

    #[tokio::test]
    async fn test_previous_error_lands_in_prompt() {
        let backend = Arc::new(ScriptedBackend::new(vec!["FROM ubuntu:24.04\n"]));
        let synthesizer = RecipeSynthesizer::new(backend.clone());

        synthesizer
            .synthesize(&ctx(Some("manifest for ghost:1 not found".to_string())))
            .await
            .unwrap();

        let prompts = backend.prompts.lock();
        assert!(prompts[0].contains("manifest for ghost:1 not found"));
        assert!(prompts[0].contains("previous attempt failed"));
    }

    #[test]
    fn test_prompt_carries_invariants() {
        let prompt = build_prompt(&ctx(None));
        assert!(prompt.contains("node:20-bookworm"));
        assert!(prompt.contains("non-root user named 'agent'"));
        assert!(prompt.contains("known_hosts"));
        assert!(prompt.contains("/home/agent/repo"));
        assert!(prompt.contains("'upstream' remote"));
        assert!(prompt.contains("keeps the container"));
        assert!(prompt.contains("github.com/cli/cli/releases"));
    }
}
