//! Task-id validation and sandboxed path derivation.
//!
//! Every filesystem path the core touches is derived here from a validated
//! task id and joined against the repository root with [`safe_join`]. All
//! checks are lexical; nothing in this module touches the filesystem.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Directory under the repo root that holds all conveyor state.
pub const DOT_DIR: &str = ".conveyor";

/// Name of the SQLite storage file inside [`DOT_DIR`].
pub const DB_FILE: &str = "conveyor.db";

const MAX_TASK_ID_LEN: usize = 64;

/// Errors from id validation and path derivation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// Task id failed validation.
    #[error("invalid task id: {0}")]
    InvalidTaskId(&'static str),

    /// A join would land outside the repository root.
    #[error("path escapes repo root: {0}")]
    EscapesRoot(String),

    /// Absolute paths are never accepted as repo-relative inputs.
    #[error("relative path expected, got absolute: {0}")]
    AbsoluteInput(String),

    /// The repo root itself was empty.
    #[error("empty repo root")]
    EmptyRoot,
}

/// Maximum allowed task id length.
pub fn max_task_id_len() -> usize {
    MAX_TASK_ID_LEN
}

/// Validate a caller-supplied task id.
///
/// Allowed: ASCII letters, digits, `.`, `_`, `-`; 1..=64 bytes; no `..`
/// substring. This forbids path separators, drive letters, and traversal.
pub fn validate_task_id(id: &str) -> Result<(), PathError> {
    if id.is_empty() {
        return Err(PathError::InvalidTaskId("empty"));
    }
    if id.len() > MAX_TASK_ID_LEN {
        return Err(PathError::InvalidTaskId("too long"));
    }
    if id.contains("..") {
        return Err(PathError::InvalidTaskId("contains '..'"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(PathError::InvalidTaskId("disallowed character"));
    }
    Ok(())
}

/// Repo-relative artifacts root for a task, e.g. `.conveyor/runs/<id>`.
pub fn runs_dir(task_id: &str) -> Result<String, PathError> {
    validate_task_id(task_id)?;
    Ok(format!("{DOT_DIR}/runs/{task_id}"))
}

/// Repo-relative workspace path for a task, e.g. `.conveyor/worktrees/<id>`.
pub fn worktree_dir(task_id: &str) -> Result<String, PathError> {
    validate_task_id(task_id)?;
    Ok(format!("{DOT_DIR}/worktrees/{task_id}"))
}

/// Repo-relative artifacts dir for one attempt,
/// e.g. `.conveyor/runs/<id>/attempts/<attempt_id>`.
pub fn attempt_dir(task_id: &str, attempt_id: i64) -> Result<String, PathError> {
    validate_task_id(task_id)?;
    Ok(format!("{DOT_DIR}/runs/{task_id}/attempts/{attempt_id}"))
}

/// Join a repo-relative path against an absolute repo root, refusing any
/// result that would escape the root.
///
/// Rejects absolute inputs outright, then normalizes `.`/`..` components
/// lexically; a `..` that would pop past the root is an error.
pub fn safe_join(repo_root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    if repo_root.as_os_str().is_empty() {
        return Err(PathError::EmptyRoot);
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() || rel_path.has_root() {
        return Err(PathError::AbsoluteInput(rel.to_string()));
    }

    let mut depth: usize = 0;
    let mut joined = repo_root.to_path_buf();
    for comp in rel_path.components() {
        match comp {
            Component::Normal(part) => {
                joined.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(PathError::EscapesRoot(rel.to_string()));
                }
                joined.pop();
                depth -= 1;
            }
            // Prefix/RootDir only occur in absolute paths, rejected above,
            // but a stray drive-letter prefix on Windows still lands here.
            Component::Prefix(_) | Component::RootDir => {
                return Err(PathError::AbsoluteInput(rel.to_string()));
            }
        }
    }
    Ok(joined)
}
