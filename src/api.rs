//! Shared task and attempt types.
//!
//! These are the rows the store persists and the JSON bodies the HTTP
//! surface exchanges, so they live in one place.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Overall task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Cancelled,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

/// Pipeline stage a task currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Produce,
    Review,
    Finalize,
    Done,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Produce => "produce",
            Self::Review => "review",
            Self::Finalize => "finalize",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepare" => Ok(Self::Prepare),
            "produce" => Ok(Self::Produce),
            "review" => Ok(Self::Review),
            "finalize" => Ok(Self::Finalize),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("phase", other)),
        }
    }
}

/// Worker role; names both a stage worker and its attempt rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Prepare,
    Produce,
    Review,
    Finalize,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Produce => "produce",
            Self::Review => "review",
            Self::Finalize => "finalize",
        }
    }

    /// The phase whose tasks this role picks up.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Prepare => Phase::Prepare,
            Self::Produce => Phase::Produce,
            Self::Review => Phase::Review,
            Self::Finalize => Phase::Finalize,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepare" => Ok(Self::Prepare),
            "produce" => Ok(Self::Produce),
            "review" => Ok(Self::Review),
            "finalize" => Ok(Self::Finalize),
            other => Err(ParseEnumError::new("role", other)),
        }
    }
}

/// Status of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Ok,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "ok" => Ok(Self::Ok),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError::new("attempt status", other)),
        }
    }
}

/// A stored enum value did not match any known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub phase: Phase,
    pub created_at: String,
    pub updated_at: String,
    pub produce_budget: i64,
    pub review_stage_budget: i64,
    pub review_loop_budget: i64,
    pub produce_retries: i64,
    pub review_stage_retries: i64,
    pub review_loop_retries: i64,
    pub artifacts_root: String,
    pub workspace_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_attempt_id: Option<i64>,
}

/// Request body for task submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub task_id: String,
    pub prompt: String,
}

/// An attempt row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: i64,
    pub task_id: String,
    pub role: Role,
    pub attempt_num: i64,
    pub status: AttemptStatus,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    pub artifacts_dir: String,
}
