//! Task workspace provisioning via git worktrees.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::exec::{CommandRunner, ExecError};
use crate::paths::{self, PathError};

/// Branch name for a task's workspace, e.g. `conveyor/<task_id>`.
pub fn branch_name(task_id: &str) -> String {
    format!("conveyor/{task_id}")
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace creation cancelled")]
    Cancelled,

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("git worktree add failed: {0}")]
    Git(String),

    #[error("workspace io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ExecError> for WorkspaceError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Cancelled => Self::Cancelled,
            other => Self::Git(other.to_string()),
        }
    }
}

/// Ensure a private, branched workspace exists for a task.
///
/// Idempotent: an existing directory at the derived workspace path is taken
/// as already provisioned. Otherwise the parent is created and
/// `git worktree add -b <branch> <path> <base>` runs from the repo root.
/// The default base is `HEAD`. Returns the absolute workspace path and the
/// combined git output (for the attempt log).
pub async fn ensure_workspace(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    repo_root: &Path,
    task_id: &str,
    base: Option<&str>,
) -> Result<(PathBuf, String), WorkspaceError> {
    paths::validate_task_id(task_id)?;
    let rel = paths::worktree_dir(task_id)?;
    let full = paths::safe_join(repo_root, &rel)?;

    if full.is_dir() {
        return Ok((full, "workspace already exists\n".to_string()));
    }

    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let branch = branch_name(task_id);
    let base = base.unwrap_or("HEAD");
    let argv = vec![
        "git".to_string(),
        "worktree".to_string(),
        "add".to_string(),
        "-b".to_string(),
        branch,
        full.to_string_lossy().into_owned(),
        base.to_string(),
    ];

    let mut out = Vec::new();
    let mut err = Vec::new();
    let code = runner
        .run(cancel, repo_root, &argv, &[], &mut out, &mut err)
        .await?;

    out.extend_from_slice(&err);
    let combined = String::from_utf8_lossy(&out).into_owned();
    if code != 0 {
        return Err(WorkspaceError::Git(format!(
            "exit code {code}: {}",
            combined.trim()
        )));
    }
    Ok((full, combined))
}
