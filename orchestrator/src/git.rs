//! Git checkpoint support for `commit_progress` (spec §4.7 table), adapted
//! from the teacher's `harness::git_manager::GitManager`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::GitStatus;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

pub struct GitManager {
    working_dir: PathBuf,
    commit_prefix: String,
    max_retries: u32,
}

impl GitManager {
    pub fn new(working_dir: impl AsRef<Path>, commit_prefix: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            commit_prefix: commit_prefix.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    fn run_git(&self, args: &[&str]) -> OrchestratorResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| OrchestratorError::filesystem("git", e.to_string()))?;

        if !output.status.success() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr),
                args = ?args,
                "git command failed"
            );
            return Err(OrchestratorError::SubprocessFailed {
                command: format!("git {}", args.join(" ")),
                exit_code: output.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Retries transient failures (lock contention, index races) with
    /// exponential backoff; a clean failure (e.g. nothing to commit) is
    /// never retried.
    fn run_git_with_retry(&self, args: &[&str]) -> OrchestratorResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run_git(args) {
                Ok(out) => return Ok(out),
                Err(e) if attempt < self.max_retries && e.is_recoverable() => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    std::thread::sleep(Duration::from_millis(delay));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| OrchestratorError::invalid_input("git retry exhausted")))
    }

    pub fn current_branch(&self) -> OrchestratorResult<String> {
        self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn current_commit(&self) -> OrchestratorResult<String> {
        self.run_git(&["rev-parse", "--short", "HEAD"])
    }

    pub fn has_uncommitted_changes(&self) -> OrchestratorResult<bool> {
        let status = self.run_git(&["status", "--porcelain"])?;
        Ok(!status.is_empty())
    }

    pub fn status(&self) -> OrchestratorResult<GitStatus> {
        Ok(GitStatus {
            branch: self.current_branch()?,
            commit: self.current_commit()?,
            has_uncommitted_changes: self.has_uncommitted_changes()?,
        })
    }

    pub fn diff_stat(&self, since_commit: &str) -> OrchestratorResult<String> {
        self.run_git(&["diff", "--stat", since_commit])
    }

    /// Stages everything and commits with a prefixed message. Returns the
    /// new commit hash, or `InvalidInput` if there is nothing to commit.
    pub fn create_checkpoint(&self, feature_id: &str, description: &str) -> OrchestratorResult<String> {
        self.run_git_with_retry(&["add", "-A"])?;
        if !self.has_uncommitted_changes()? {
            return Err(OrchestratorError::invalid_input(
                "nothing to commit for this feature",
            ));
        }
        let message = format!("{} {}: {}", self.commit_prefix, feature_id, description);
        self.run_git_with_retry(&["commit", "-m", &message])?;
        self.current_commit()
    }
}
