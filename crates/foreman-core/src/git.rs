//! Narrow git boundary. The engine drives worktrees, diffs, and commits
//! through this trait; everything else about version control stays outside.

use std::path::Path;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("failed to run git: {0}")]
    Spawn(String),
}

/// Revision identifier as git prints it (full SHA).
pub type Revision = String;

#[async_trait(?Send)]
pub trait Git {
    /// Create a worktree at `worktree_dir` on `branch`, checked out at
    /// `revision`. Must be idempotent: an existing worktree at the same dir is
    /// pruned, removed, and recreated rather than erroring out.
    async fn create_worktree(
        &self,
        worktree_dir: &Path,
        branch: &str,
        revision: &str,
    ) -> Result<(), GitError>;

    async fn diff(&self) -> Result<String, GitError>;

    async fn status(&self) -> Result<String, GitError>;

    /// Stage everything and commit. Returns the new revision.
    async fn commit_all(&self, message: &str) -> Result<Revision, GitError>;

    async fn last_revision(&self) -> Result<Revision, GitError>;

    async fn reset_hard_all(&self) -> Result<(), GitError>;

    async fn uncommitted_changes(&self) -> Result<bool, GitError>;
}
