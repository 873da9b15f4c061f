//! Source-control adapter. All operations shell out to `git`; a commit on a
//! clean tree is a no-op success and a failed push never fails a build.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{PackwrightError, Result};

/// Conventional commit type, rendered as `<type>(<scope>): <subject>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitType {
    Feat,
    Fix,
    Test,
    Docs,
    Chore,
    Refactor,
}

impl CommitType {
    fn as_str(&self) -> &'static str {
        match self {
            CommitType::Feat => "feat",
            CommitType::Fix => "fix",
            CommitType::Test => "test",
            CommitType::Docs => "docs",
            CommitType::Chore => "chore",
            CommitType::Refactor => "refactor",
        }
    }
}

/// Build a conventional-commit message. Downstream tooling parses this
/// grammar, so it is emitted exactly.
pub fn commit_message(kind: CommitType, scope: &str, subject: &str) -> String {
    format!("{}({}): {}", kind.as_str(), scope, subject)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NothingToCommit,
}

pub trait SourceControl: Send + Sync {
    fn configure_user(&self, repo: &Path, name: &str, email: &str) -> Result<()>;
    fn create_branch(&self, repo: &Path, branch: &str) -> Result<()>;
    fn commit(&self, repo: &Path, message: &str) -> Result<CommitOutcome>;
    fn push(&self, repo: &Path, remote: &str, branch: &str, force: bool) -> Result<()>;
    /// Paths with uncommitted changes, relative to the repo root.
    fn changed_paths(&self, repo: &Path) -> Result<Vec<PathBuf>>;
}

pub struct GitCli;

impl GitCli {
    fn run(&self, repo: &Path, args: &[&str]) -> Result<std::process::Output> {
        debug!("git {} (in {})", args.join(" "), repo.display());
        Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .map_err(|e| PackwrightError::VcsError(format!("failed to run git: {}", e)))
    }

    fn run_checked(&self, repo: &Path, args: &[&str]) -> Result<String> {
        let output = self.run(repo, args)?;
        if !output.status.success() {
            return Err(PackwrightError::VcsError(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl SourceControl for GitCli {
    fn configure_user(&self, repo: &Path, name: &str, email: &str) -> Result<()> {
        self.run_checked(repo, &["config", "user.name", name])?;
        self.run_checked(repo, &["config", "user.email", email])?;
        Ok(())
    }

    fn create_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        // -B: create or reset, so re-entry onto an existing branch works.
        self.run_checked(repo, &["checkout", "-B", branch])?;
        info!("on branch {}", branch);
        Ok(())
    }

    fn commit(&self, repo: &Path, message: &str) -> Result<CommitOutcome> {
        let status = self.run_checked(repo, &["status", "--porcelain"])?;
        if status.trim().is_empty() {
            debug!("nothing to commit in {}", repo.display());
            return Ok(CommitOutcome::NothingToCommit);
        }

        self.run_checked(repo, &["add", "-A"])?;
        self.run_checked(repo, &["commit", "-m", message])?;
        info!("committed: {}", message);
        Ok(CommitOutcome::Committed)
    }

    fn push(&self, repo: &Path, remote: &str, branch: &str, force: bool) -> Result<()> {
        let mut args = vec!["push", remote, branch];
        if force {
            args.push("--force");
        }
        let output = self.run(repo, &args)?;
        if !output.status.success() {
            return Err(PackwrightError::VcsError(format!(
                "push to {}/{} failed: {}",
                remote,
                branch,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn changed_paths(&self, repo: &Path) -> Result<Vec<PathBuf>> {
        let status = self.run_checked(repo, &["status", "--porcelain"])?;
        Ok(status
            .lines()
            .filter_map(|line| {
                // porcelain format: XY <path> (rename lines carry "old -> new")
                let path = line.get(3..)?;
                let path = path.rsplit(" -> ").next().unwrap_or(path);
                Some(PathBuf::from(path.trim()))
            })
            .collect())
    }
}

/// Commit helper used at pipeline checkpoints: failures are logged and
/// swallowed, an empty tree is a success.
pub fn checkpoint(vcs: &dyn SourceControl, repo: &Path, message: &str) {
    match vcs.commit(repo, message) {
        Ok(CommitOutcome::Committed) => {}
        Ok(CommitOutcome::NothingToCommit) => {
            debug!("checkpoint '{}': no changes", message);
        }
        Err(e) => {
            warn!("checkpoint commit '{}' failed: {}", message, e);
        }
    }
}
