//! Subprocess implementation of the narrow `Git` boundary. Drives the `git`
//! binary in a fixed working directory; worktree creation is idempotent
//! (prune, remove, recreate).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use foreman_core::git::{Git, GitError, Revision};

pub struct CliGit {
    dir: PathBuf,
}

impl CliGit {
    /// `dir` is the checkout (or worktree) every command runs in.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        debug!(dir = %self.dir.display(), ?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .await
            .map_err(|e| GitError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(GitError::Command {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_ok(&self, args: &[&str]) -> Result<(), GitError> {
        self.run(args).await.map(|_| ())
    }
}

#[async_trait(?Send)]
impl Git for CliGit {
    #[instrument(skip(self), fields(dir = %worktree_dir.display()))]
    async fn create_worktree(
        &self,
        worktree_dir: &Path,
        branch: &str,
        revision: &str,
    ) -> Result<(), GitError> {
        self.run_ok(&["worktree", "prune"]).await?;

        let dir_str = worktree_dir.to_string_lossy().into_owned();
        if worktree_dir.exists() {
            // Recreate rather than fail: a stale worktree from a previous run
            // must not block provisioning.
            let _ = self
                .run_ok(&["worktree", "remove", "--force", &dir_str])
                .await;
            if worktree_dir.exists() {
                std::fs::remove_dir_all(worktree_dir)
                    .map_err(|e| GitError::Spawn(format!("remove stale worktree: {e}")))?;
            }
            self.run_ok(&["worktree", "prune"]).await?;
        }
        if let Some(parent) = worktree_dir.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GitError::Spawn(format!("create worktree parent: {e}")))?;
        }

        self.run_ok(&["worktree", "add", "-B", branch, &dir_str, revision])
            .await
    }

    async fn diff(&self) -> Result<String, GitError> {
        self.run(&["diff", "HEAD"]).await
    }

    async fn status(&self) -> Result<String, GitError> {
        self.run(&["status", "--porcelain"]).await
    }

    async fn commit_all(&self, message: &str) -> Result<Revision, GitError> {
        self.run_ok(&["add", "-A"]).await?;
        self.run_ok(&["commit", "-m", message, "--allow-empty"])
            .await?;
        self.last_revision().await
    }

    async fn last_revision(&self) -> Result<Revision, GitError> {
        Ok(self.run(&["rev-parse", "HEAD"]).await?.trim().to_owned())
    }

    async fn reset_hard_all(&self) -> Result<(), GitError> {
        self.run_ok(&["reset", "--hard"]).await
    }

    async fn uncommitted_changes(&self) -> Result<bool, GitError> {
        Ok(!self.status().await?.trim().is_empty())
    }
}
