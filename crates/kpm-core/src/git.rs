//! Git clone collaborator.
//!
//! Dependencies from git are materialized with a shallow clone of the
//! requested ref, delegated to the `git` binary on the PATH.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Errors that can occur while cloning.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to clone '{url}' at '{tag}': {stderr}")]
    CloneFailed {
        url: String,
        tag: String,
        stderr: String,
    },
}

/// Shallow-clone `url` at `tag` into `dest`.
///
/// `tag` may be any ref the remote resolves (branch, tag). An empty tag
/// clones the default branch.
///
/// # Errors
///
/// Returns an error if git cannot be spawned or the clone fails.
pub fn clone(url: &str, tag: &str, dest: &Path) -> Result<(), GitError> {
    let mut cmd = Command::new("git");
    cmd.arg("clone").args(["--depth", "1"]);
    if !tag.is_empty() {
        cmd.args(["--branch", tag]);
    }
    cmd.arg(url).arg(dest);

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(GitError::CloneFailed {
            url: url.to_string(),
            tag: tag.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}
