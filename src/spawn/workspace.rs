use std::path::{Path, PathBuf};

use git2::{BranchType, Repository};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::git::GitRunner;

/// Provisions one isolated git worktree per worker under a shared directory.
pub struct WorktreeProvisioner {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
    base_branch: String,
    branch_prefix: String,
}

impl WorktreeProvisioner {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktrees_dir: impl Into<PathBuf>,
        base_branch: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            worktrees_dir: worktrees_dir.into(),
            base_branch: base_branch.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.repo_path)
    }

    pub fn branch_name(&self, worker_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, worker_id)
    }

    /// Create (or reuse) the worktree for a worker and return its path.
    pub async fn setup(&self, worker_id: &str, branch: &str) -> Result<PathBuf> {
        let worktree_path = self.worktrees_dir.join(worker_id);

        if worktree_path.exists() {
            debug!(path = %worktree_path.display(), "Worktree already exists, reusing");
            return Ok(worktree_path);
        }

        fs::create_dir_all(&self.worktrees_dir).await?;

        self.git()
            .worktree_add(&worktree_path, branch, &self.base_branch)
            .await?;

        info!(
            branch = %branch,
            path = %worktree_path.display(),
            "Created worker worktree"
        );
        Ok(worktree_path)
    }

    pub async fn cleanup(&self, worker_id: &str, delete_branch: bool) -> Result<()> {
        let worktree_path = self.worktrees_dir.join(worker_id);
        if worktree_path.exists() {
            self.git().worktree_remove(&worktree_path).await?;
            info!(path = %worktree_path.display(), "Removed worker worktree");
        }

        if delete_branch {
            let branch = self.branch_name(worker_id);
            if self.git().delete_branch(&branch).await? {
                debug!(branch = %branch, "Deleted worker branch");
            }
        }

        Ok(())
    }

    /// Remove worktrees left behind by workers that are no longer tracked,
    /// e.g. after a crash.
    pub async fn cleanup_orphaned(&self, active_worker_ids: &[String]) -> Result<()> {
        if !self.worktrees_dir.exists() {
            return Ok(());
        }

        let mut dir = fs::read_dir(&self.worktrees_dir).await?;
        let mut orphaned = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !active_worker_ids.contains(&name) {
                orphaned.push(entry.path());
            }
        }

        for path in orphaned {
            warn!(path = %path.display(), "Cleaning up orphaned worktree");
            if let Err(e) = self.git().worktree_remove(&path).await {
                debug!(path = %path.display(), error = %e, "Git worktree remove failed, using force remove");
                if let Err(e) = fs::remove_dir_all(&path).await {
                    warn!(path = %path.display(), error = %e, "Force remove failed");
                }
            }
        }

        Ok(())
    }

    /// Check whether the base branch exists in the repository.
    pub fn base_branch_exists(&self) -> Result<bool> {
        let repo = Repository::open(&self.repo_path)?;
        Ok(repo
            .find_branch(&self.base_branch, BranchType::Local)
            .is_ok())
    }
}
