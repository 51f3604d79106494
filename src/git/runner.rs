use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{FlowError, Result};

/// Thin async wrapper over the `git` CLI, scoped to one working directory.
pub struct GitRunner {
    working_dir: PathBuf,
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowError::Git(git2::Error::from_str(&stderr)));
        }

        Ok(output)
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let refname = format!("refs/heads/{}", branch);
        let output = self.run(&["rev-parse", "--verify", "--quiet", &refname]).await?;
        Ok(output.status.success())
    }

    pub async fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        if self.branch_exists(branch).await? {
            // Reuse the branch for retry scenarios.
            self.run_checked(&["worktree", "add", &path_str, branch])
                .await?;
        } else {
            self.run_checked(&["worktree", "add", "-b", branch, &path_str, base])
                .await?;
        }
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path_str])
            .await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    pub async fn list_branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("refs/heads/{}/*", prefix);
        let output = self
            .run_checked(&["for-each-ref", "--format=%(refname:short)", &pattern])
            .await?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .collect())
    }
}
