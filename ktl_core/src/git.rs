//! Git diff collaborator (§6.5). Absent git must degrade to "no changes"
//! rather than fail.

use crate::error::Result;
use std::path::{Path, PathBuf};
use std::process::Command;

pub trait GitRange {
    /// Changed paths in `A..B`, relative to the repository root.
    fn changed_paths(&self, range: &str) -> Result<Vec<PathBuf>>;
}

/// Shells out to the system `git`. If `git` is not on `PATH` or the directory
/// is not a repository, returns an empty change set instead of erroring.
pub struct SystemGit {
    pub repo_root: PathBuf,
}

impl GitRange for SystemGit {
    fn changed_paths(&self, range: &str) -> Result<Vec<PathBuf>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(["diff", "--name-only", range])
            .output();

        let Ok(output) = output else {
            return Ok(Vec::new());
        };
        if !output.status.success() {
            return Ok(Vec::new());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| self.repo_root.join(l.trim()))
            .collect())
    }
}

pub struct NoGit;

impl GitRange for NoGit {
    fn changed_paths(&self, _range: &str) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

pub fn within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}
