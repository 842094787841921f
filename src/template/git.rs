//! Repository metadata for the `git` template function.

use crate::core::error::FunctionError;
use crate::runner::CancelToken;
use crate::transport::{run_checked, Executor};
use std::path::{Path, PathBuf};

/// What the `git` function reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitAction {
    /// Full hash of HEAD
    CommitSha,
    /// Abbreviated hash of HEAD
    AbbrevCommitSha,
    /// Nearest tag, or the abbreviated hash when untagged
    Describe,
}

impl GitAction {
    /// Unknown actions fall back to `Describe`.
    pub fn parse(action: &str) -> Self {
        match action {
            "commitsha" => Self::CommitSha,
            "abbrevcommitsha" => Self::AbbrevCommitSha,
            _ => Self::Describe,
        }
    }

    pub fn args(self) -> Vec<String> {
        let args: &[&str] = match self {
            Self::CommitSha => &["git", "rev-list", "-1", "HEAD"],
            Self::AbbrevCommitSha => &["git", "rev-list", "-1", "HEAD", "--abbrev-commit"],
            Self::Describe => &["git", "describe", "--tags", "--always"],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

/// Directory git is queried in: `GIT_DIR`, then `PROJECT_ROOT`, then `fallback`.
pub fn repository_dir(fallback: &Path) -> PathBuf {
    ["GIT_DIR", "PROJECT_ROOT"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .find(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| fallback.to_path_buf())
}

/// Run the query and return its trimmed output.
pub fn query(executor: &dyn Executor, dir: &Path, action: &str) -> Result<String, FunctionError> {
    let args = GitAction::parse(action).args();
    run_checked(executor, &args, dir, &CancelToken::new())
        .map(|out| out.trim().to_string())
        .map_err(|source| FunctionError::Git {
            action: action.to_string(),
            source,
        })
}
