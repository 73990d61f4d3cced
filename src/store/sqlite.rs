//! SQLite implementation of the task/attempt store.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::warn;

use super::{now_rfc3339, StartedAttempt, StoreError};
use crate::api::{Attempt, AttemptStatus, CreateTaskRequest, Phase, Role, Task, TaskStatus};
use crate::config::RetryConfig;
use crate::paths;

const SCHEMA_VERSION: i64 = 1;

/// Lock-busy retries for multi-statement operations: 5 attempts, 10 ms
/// doubling backoff.
const BUSY_RETRIES: u32 = 5;
const BUSY_BASE_DELAY_MS: u64 = 10;

fn busy_delay(attempt: u32) -> Duration {
    Duration::from_millis(BUSY_BASE_DELAY_MS << attempt)
}

type TaskRow = (
    String,      // task_id
    String,      // prompt
    String,      // status
    String,      // phase
    String,      // created_at
    String,      // updated_at
    i64,         // produce_budget
    i64,         // review_stage_budget
    i64,         // review_loop_budget
    i64,         // produce_retries
    i64,         // review_stage_retries
    i64,         // review_loop_retries
    String,      // artifacts_root
    String,      // workspace_path
    Option<i64>, // current_attempt_id
);

const TASK_COLUMNS: &str = "task_id, prompt, status, phase, created_at, updated_at, \
     produce_budget, review_stage_budget, review_loop_budget, \
     produce_retries, review_stage_retries, review_loop_retries, \
     artifacts_root, workspace_path, current_attempt_id";

fn task_from_row(row: TaskRow) -> Result<Task, StoreError> {
    Ok(Task {
        task_id: row.0,
        prompt: row.1,
        status: row.2.parse::<TaskStatus>()?,
        phase: row.3.parse::<Phase>()?,
        created_at: row.4,
        updated_at: row.5,
        produce_budget: row.6,
        review_stage_budget: row.7,
        review_loop_budget: row.8,
        produce_retries: row.9,
        review_stage_retries: row.10,
        review_loop_retries: row.11,
        artifacts_root: row.12,
        workspace_path: row.13,
        current_attempt_id: row.14,
    })
}

type AttemptRow = (
    i64,            // id
    String,         // task_id
    String,         // role
    i64,            // attempt_num
    String,         // status
    String,         // started_at
    Option<String>, // finished_at
    Option<String>, // error_summary
    String,         // artifacts_dir
);

const ATTEMPT_COLUMNS: &str =
    "id, task_id, role, attempt_num, status, started_at, finished_at, error_summary, artifacts_dir";

fn attempt_from_row(row: AttemptRow) -> Result<Attempt, StoreError> {
    Ok(Attempt {
        id: row.0,
        task_id: row.1,
        role: row.2.parse::<Role>()?,
        attempt_num: row.3,
        status: row.4.parse::<AttemptStatus>()?,
        started_at: row.5,
        finished_at: row.6,
        error_summary: row.7,
        artifacts_dir: row.8,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

/// SQLite-backed store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run migrations keyed on `PRAGMA user_version`.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if version >= SCHEMA_VERSION {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                prompt TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                produce_budget INTEGER NOT NULL DEFAULT 3,
                review_stage_budget INTEGER NOT NULL DEFAULT 3,
                review_loop_budget INTEGER NOT NULL DEFAULT 2,
                produce_retries INTEGER NOT NULL DEFAULT 0,
                review_stage_retries INTEGER NOT NULL DEFAULT 0,
                review_loop_retries INTEGER NOT NULL DEFAULT 0,
                artifacts_root TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                current_attempt_id INTEGER
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL REFERENCES tasks(task_id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                attempt_num INTEGER NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error_summary TEXT,
                artifacts_dir TEXT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("PRAGMA user_version = 1")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Create a task, or return the existing row on a duplicate id.
    ///
    /// Budgets are snapshotted from `retry` at creation. The returned flag is
    /// `true` when the task already existed.
    pub async fn create_task(
        &self,
        req: &CreateTaskRequest,
        retry: &RetryConfig,
    ) -> Result<(Task, bool), StoreError> {
        // Validates the id as a side effect of deriving both paths.
        let artifacts_root = paths::runs_dir(&req.task_id)?;
        let workspace_path = paths::worktree_dir(&req.task_id)?;
        let now = now_rfc3339();

        let inserted = sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, prompt, status, phase, created_at, updated_at,
                produce_budget, review_stage_budget, review_loop_budget,
                artifacts_root, workspace_path
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&req.task_id)
        .bind(&req.prompt)
        .bind(TaskStatus::Running.as_str())
        .bind(Phase::Prepare.as_str())
        .bind(&now)
        .bind(&now)
        .bind(retry.produce_budget)
        .bind(retry.review_stage_budget)
        .bind(retry.review_loop_budget)
        .bind(&artifacts_root)
        .bind(&workspace_path)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok((self.get_task(&req.task_id).await?, false)),
            Err(err) if is_unique_violation(&err) => {
                Ok((self.get_task(&req.task_id).await?, true))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, StoreError> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?");
        let row: Option<TaskRow> = sqlx::query_as(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(task_from_row).ok_or(StoreError::NotFound)?
    }

    /// List tasks newest first. `limit <= 0` returns all.
    pub async fn list_tasks(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = if limit > 0 {
            let query =
                format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?");
            sqlx::query_as(&query)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
        } else {
            let query = format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC");
            sqlx::query_as(&query).fetch_all(&self.pool).await?
        };
        rows.into_iter().map(task_from_row).collect()
    }

    /// Whether a task is currently cancelled. `NotFound` for unknown ids.
    pub async fn is_cancelled(&self, task_id: &str) -> Result<bool, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        match status {
            Some(s) => Ok(s == TaskStatus::Cancelled.as_str()),
            None => Err(StoreError::NotFound),
        }
    }

    /// Set status to `cancelled` unless the task is already terminal.
    /// Returns `true` if the status changed.
    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let status = status.ok_or(StoreError::NotFound)?.parse::<TaskStatus>()?;
        if status.is_terminal() {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE task_id = ?")
            .bind(TaskStatus::Cancelled.as_str())
            .bind(now_rfc3339())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Update a task's phase and status, retrying transient lock contention.
    pub async fn update_phase_status(
        &self,
        task_id: &str,
        phase: Phase,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let mut last_err = None;
        for attempt in 0..BUSY_RETRIES {
            let result = sqlx::query(
                "UPDATE tasks SET phase = ?, status = ?, updated_at = ? WHERE task_id = ?",
            )
            .bind(phase.as_str())
            .bind(status.as_str())
            .bind(now_rfc3339())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from);

            match result {
                Ok(_) => return Ok(()),
                Err(err) if err.is_busy() => {
                    tokio::time::sleep(busy_delay(attempt)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.expect("at least one retry attempted"))
    }

    /// Create an attempt row and claim the task's single in-flight slot, all
    /// in one transaction.
    ///
    /// Fails with [`StoreError::InProgress`] (and persists nothing) when
    /// another attempt already holds the slot.
    pub async fn start_attempt(
        &self,
        task_id: &str,
        role: Role,
    ) -> Result<StartedAttempt, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound);
        }

        let max_num: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(attempt_num) FROM attempts WHERE task_id = ? AND role = ?",
        )
        .bind(task_id)
        .bind(role.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let attempt_num = max_num.unwrap_or(0) + 1;

        let started_at = now_rfc3339();
        let attempt_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO attempts (task_id, role, attempt_num, status, started_at, artifacts_dir)
            VALUES (?, ?, ?, ?, ?, '')
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(role.as_str())
        .bind(attempt_num)
        .bind(AttemptStatus::Running.as_str())
        .bind(&started_at)
        .fetch_one(&mut *tx)
        .await?;

        let artifacts_dir = paths::attempt_dir(task_id, attempt_id)?;
        sqlx::query("UPDATE attempts SET artifacts_dir = ? WHERE id = ?")
            .bind(&artifacts_dir)
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;

        // Conditional claim; zero rows means another attempt is in flight
        // and the whole transaction (including our insert) rolls back.
        let claimed = sqlx::query(
            "UPDATE tasks SET current_attempt_id = ? \
             WHERE task_id = ? AND current_attempt_id IS NULL",
        )
        .bind(attempt_id)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            return Err(StoreError::InProgress);
        }

        tx.commit().await?;
        Ok(StartedAttempt {
            attempt_id,
            artifacts_dir,
            attempt_num,
            started_at,
        })
    }

    /// Finish an attempt: set its terminal status, release the task's
    /// in-flight slot, and, for failed produce/review attempts, bump the
    /// role's retry counter, failing the task in the same transaction when
    /// the budget is exhausted.
    ///
    /// Returns the new retry count (0 when no counter was touched). The whole
    /// transaction is retried on transient lock contention.
    pub async fn finish_attempt(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        error_summary: &str,
    ) -> Result<i64, StoreError> {
        let mut last_err = None;
        for attempt in 0..BUSY_RETRIES {
            match self
                .finish_attempt_once(attempt_id, status, error_summary)
                .await
            {
                Ok(count) => return Ok(count),
                Err(err) if err.is_busy() => {
                    warn!(attempt_id, retry = attempt, "finish_attempt lock-busy, retrying");
                    tokio::time::sleep(busy_delay(attempt)).await;
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.expect("at least one retry attempted"))
    }

    async fn finish_attempt_once(
        &self,
        attempt_id: i64,
        status: AttemptStatus,
        error_summary: &str,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String, String)> =
            sqlx::query_as("SELECT task_id, role FROM attempts WHERE id = ?")
                .bind(attempt_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (task_id, role) = row.ok_or(StoreError::NotFound)?;
        let role = role.parse::<Role>()?;

        let mut new_count = 0i64;
        if status == AttemptStatus::Failed {
            let counter = match role {
                Role::Produce => Some(("produce_retries", "produce_budget")),
                Role::Review => Some(("review_stage_retries", "review_stage_budget")),
                // prepare and finalize have no retry budget; the loop
                // counter is incremented by the review worker, not here.
                Role::Prepare | Role::Finalize => None,
            };
            if let Some((retries_col, budget_col)) = counter {
                let update = format!(
                    "UPDATE tasks SET {retries_col} = {retries_col} + 1, updated_at = ? \
                     WHERE task_id = ?"
                );
                sqlx::query(&update)
                    .bind(now_rfc3339())
                    .bind(&task_id)
                    .execute(&mut *tx)
                    .await?;

                let select =
                    format!("SELECT {retries_col}, {budget_col} FROM tasks WHERE task_id = ?");
                let (count, budget): (i64, i64) = sqlx::query_as(&select)
                    .bind(&task_id)
                    .fetch_one(&mut *tx)
                    .await?;
                new_count = count;

                // Budget exhausted: fail the task here so it can never be
                // left stuck running if the worker dies after this call.
                if count >= budget {
                    sqlx::query(
                        "UPDATE tasks SET phase = ?, status = ?, updated_at = ? \
                         WHERE task_id = ?",
                    )
                    .bind(role.phase().as_str())
                    .bind(TaskStatus::Failed.as_str())
                    .bind(now_rfc3339())
                    .bind(&task_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        let summary = if error_summary.is_empty() {
            None
        } else {
            Some(error_summary)
        };
        sqlx::query(
            "UPDATE attempts SET status = ?, finished_at = ?, error_summary = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now_rfc3339())
        .bind(summary)
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE tasks SET current_attempt_id = NULL WHERE current_attempt_id = ?")
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(new_count)
    }

    /// Bump the review-loop counter (a `changes_requested` outcome) and
    /// return the new value.
    pub async fn increment_review_loop_retries(&self, task_id: &str) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE tasks SET review_loop_retries = review_loop_retries + 1, updated_at = ? \
             WHERE task_id = ?",
        )
        .bind(now_rfc3339())
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        let count: Option<i64> =
            sqlx::query_scalar("SELECT review_loop_retries FROM tasks WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let count = count.ok_or(StoreError::NotFound)?;
        tx.commit().await?;
        Ok(count)
    }

    pub async fn get_attempt(&self, task_id: &str, attempt_id: i64) -> Result<Attempt, StoreError> {
        let query =
            format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE task_id = ? AND id = ?");
        let row: Option<AttemptRow> = sqlx::query_as(&query)
            .bind(task_id)
            .bind(attempt_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(attempt_from_row).ok_or(StoreError::NotFound)?
    }

    pub async fn latest_attempt(&self, task_id: &str) -> Result<Attempt, StoreError> {
        let query = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE task_id = ? ORDER BY id DESC LIMIT 1"
        );
        let row: Option<AttemptRow> = sqlx::query_as(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(attempt_from_row).ok_or(StoreError::NotFound)?
    }

    pub async fn latest_attempt_by_role(
        &self,
        task_id: &str,
        role: Role,
    ) -> Result<Attempt, StoreError> {
        let query = format!(
            "SELECT {ATTEMPT_COLUMNS} FROM attempts \
             WHERE task_id = ? AND role = ? ORDER BY id DESC LIMIT 1"
        );
        let row: Option<AttemptRow> = sqlx::query_as(&query)
            .bind(task_id)
            .bind(role.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(attempt_from_row).ok_or(StoreError::NotFound)?
    }

    /// Convert stale in-flight state from a crashed process into recorded
    /// failures. Idempotent; safe to run on every startup.
    ///
    /// Marks every `running` attempt (and any attempt still referenced by a
    /// task's `current_attempt_id`) as failed with the crash-recovery
    /// sentinel, clears the task references, and best-effort writes
    /// `result.json` plus a crash note at the top of `log.txt`.
    pub async fn reconcile(&self, repo_root: &Path) -> Result<(), StoreError> {
        const CRASH_SUMMARY: &str = "crash recovery: restart";

        let mut tx = self.pool.begin().await?;

        struct Stale {
            id: i64,
            role: String,
            finished_at: Option<String>,
            error_summary: Option<String>,
            artifacts_dir: String,
        }

        let mut stale: HashMap<i64, Stale> = HashMap::new();

        let running: Vec<(i64, String, Option<String>, Option<String>, String)> =
            sqlx::query_as(
                "SELECT id, role, finished_at, error_summary, artifacts_dir \
                 FROM attempts WHERE status = 'running'",
            )
            .fetch_all(&mut *tx)
            .await?;
        for (id, role, finished_at, error_summary, artifacts_dir) in running {
            stale.insert(
                id,
                Stale {
                    id,
                    role,
                    finished_at,
                    error_summary,
                    artifacts_dir,
                },
            );
        }

        // Attempts still referenced by a task slot but not in the running
        // set; a dangling reference with no row is simply cleared.
        let referenced: Vec<i64> = sqlx::query_scalar(
            "SELECT current_attempt_id FROM tasks WHERE current_attempt_id IS NOT NULL",
        )
        .fetch_all(&mut *tx)
        .await?;
        for id in referenced {
            if stale.contains_key(&id) {
                continue;
            }
            let row: Option<(i64, String, Option<String>, Option<String>, String)> =
                sqlx::query_as(
                    "SELECT id, role, finished_at, error_summary, artifacts_dir \
                     FROM attempts WHERE id = ?",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            match row {
                Some((id, role, finished_at, error_summary, artifacts_dir)) => {
                    stale.insert(
                        id,
                        Stale {
                            id,
                            role,
                            finished_at,
                            error_summary,
                            artifacts_dir,
                        },
                    );
                }
                None => {
                    sqlx::query(
                        "UPDATE tasks SET current_attempt_id = NULL \
                         WHERE current_attempt_id = ?",
                    )
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        for attempt in stale.values() {
            let already = attempt.finished_at.is_some()
                && attempt
                    .error_summary
                    .as_deref()
                    .unwrap_or("")
                    .contains("crash recovery");
            if already {
                continue;
            }

            warn!(
                attempt_id = attempt.id,
                role = %attempt.role,
                "reconciling stale in-flight attempt"
            );

            sqlx::query(
                "UPDATE attempts SET status = ?, finished_at = ?, error_summary = ? \
                 WHERE id = ?",
            )
            .bind(AttemptStatus::Failed.as_str())
            .bind(now_rfc3339())
            .bind(CRASH_SUMMARY)
            .bind(attempt.id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE tasks SET current_attempt_id = NULL WHERE current_attempt_id = ?")
                .bind(attempt.id)
                .execute(&mut *tx)
                .await?;

            // Best-effort artifacts; never fails the reconcile.
            if !attempt.artifacts_dir.is_empty() {
                if let Ok(dir) = paths::safe_join(repo_root, &attempt.artifacts_dir) {
                    let _ = std::fs::create_dir_all(&dir);
                    let result = format!(
                        r#"{{"status":"failed","note":"crash recovery","role":"{}"}}"#,
                        attempt.role
                    );
                    let _ = std::fs::write(dir.join("result.json"), result);
                    let log_path = dir.join("log.txt");
                    let existing = std::fs::read(&log_path).unwrap_or_default();
                    let mut contents =
                        Vec::with_capacity(CRASH_SUMMARY.len() + 1 + existing.len());
                    contents.extend_from_slice(CRASH_SUMMARY.as_bytes());
                    contents.push(b'\n');
                    contents.extend_from_slice(&existing);
                    let _ = std::fs::write(&log_path, contents);
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}
