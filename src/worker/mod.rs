//! Stage workers and their shared scaffolding.
//!
//! The four polling loops (prepare, produce, review, finalize) share one
//! driver: every tick it lists tasks, claims an attempt for each task in its
//! phase, sets up the artifacts directory and cancellation scope, then hands
//! off to the role's [`StageHandler`]. All cross-worker state lives in the
//! store.

pub mod finalize;
pub mod prepare;
pub mod produce;
pub mod review;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{AttemptStatus, Phase, Role, Task, TaskStatus};
use crate::cancel::CancelRegistry;
use crate::config::{HooksConfig, WorkersConfig};
use crate::exec::{CommandRunner, ExecError};
use crate::paths;
use crate::store::{SqliteStore, StoreError};

/// Preamble line a new attempt logs when the previous attempt for the same
/// (task, role) died in a crash.
pub const CRASH_NOTE: &str = "previous run crashed; continue from artifacts\n";

/// Shared context for all four workers.
pub struct WorkerDeps {
    pub store: SqliteStore,
    pub runner: Arc<dyn CommandRunner>,
    pub registry: Arc<CancelRegistry>,
    pub repo_root: PathBuf,
    pub commands: WorkersConfig,
    pub hooks: HooksConfig,
    pub poll_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Everything a handler needs about the attempt it is running.
pub(crate) struct AttemptScope {
    pub attempt_id: i64,
    pub started_at: String,
    /// Absolute artifacts directory for this attempt.
    pub dir: PathBuf,
    /// Crash-recovery preamble, present when the prior attempt crashed.
    pub crash_note: Option<&'static str>,
    /// Cancelled by the registry (external cancel) or process shutdown.
    pub cancel: CancellationToken,
}

/// How an attempt ended, interpreted uniformly by the driver.
pub(crate) enum StageOutcome {
    /// Attempt ok; move the task to (phase, status).
    Advance {
        phase: Phase,
        status: TaskStatus,
        summary: &'static str,
    },
    /// Attempt failed. `finish_attempt` consumes retry budget for
    /// produce/review; `mark_task_failed` forces the task to
    /// (role phase, failed) for stages without a budget.
    Fail {
        summary: String,
        mark_task_failed: bool,
    },
    /// Attempt observed cancellation; task becomes cancelled in place.
    Cancelled,
}

/// Role-specific stage logic; one implementation per worker.
#[async_trait]
pub(crate) trait StageHandler: Send + Sync {
    fn role(&self) -> Role;

    async fn run_attempt(
        &self,
        deps: &WorkerDeps,
        task: &Task,
        scope: &AttemptScope,
    ) -> StageOutcome;
}

/// Poll loop shared by every worker: tick, list, claim, delegate.
pub(crate) async fn run_stage_loop<H: StageHandler>(deps: Arc<WorkerDeps>, handler: H) {
    let role = handler.role();
    let mut ticker = tokio::time::interval(deps.poll_interval);
    loop {
        tokio::select! {
            _ = deps.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let tasks = match deps.store.list_tasks(0).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%role, error = %err, "list tasks failed");
                continue;
            }
        };
        for task in tasks {
            if task.phase != role.phase() || task.status != TaskStatus::Running {
                continue;
            }
            process_task(&deps, &handler, &task).await;
        }
    }
}

async fn process_task<H: StageHandler>(deps: &Arc<WorkerDeps>, handler: &H, task: &Task) {
    let role = handler.role();
    let crash_note = crash_note(&deps.store, &task.task_id, role).await;

    let started = match deps.store.start_attempt(&task.task_id, role).await {
        Ok(started) => started,
        // Another attempt holds the slot; try again next tick.
        Err(StoreError::InProgress) => return,
        Err(err) => {
            warn!(task_id = %task.task_id, %role, error = %err, "start attempt failed");
            update_phase_logged(&deps.store, &task.task_id, role.phase(), TaskStatus::Failed)
                .await;
            return;
        }
    };

    let dir = match paths::safe_join(&deps.repo_root, &started.artifacts_dir) {
        Ok(dir) => dir,
        Err(err) => {
            // Unsafe artifacts path: record the failure without touching disk.
            let _ = deps
                .store
                .finish_attempt(started.attempt_id, AttemptStatus::Failed, &err.to_string())
                .await;
            return;
        }
    };
    if let Err(err) = tokio::fs::create_dir_all(&dir).await {
        let _ = deps
            .store
            .finish_attempt(started.attempt_id, AttemptStatus::Failed, &err.to_string())
            .await;
        update_phase_logged(&deps.store, &task.task_id, role.phase(), TaskStatus::Failed).await;
        return;
    }

    // Cancel that landed before the attempt started.
    if deps
        .store
        .is_cancelled(&task.task_id)
        .await
        .unwrap_or(false)
    {
        write_result(&dir, &json!({"status": "cancelled", "role": role.as_str()})).await;
        let mut log = String::new();
        if let Some(note) = crash_note {
            log.push_str(note);
        }
        log.push_str("cancelled\n");
        let _ = tokio::fs::write(dir.join("log.txt"), log).await;
        let _ = deps
            .store
            .finish_attempt(started.attempt_id, AttemptStatus::Cancelled, "cancelled")
            .await;
        return;
    }

    let meta = json!({
        "task_id": task.task_id,
        "attempt_id": started.attempt_id,
        "role": role.as_str(),
        "attempt_num": started.attempt_num,
        "status": "running",
        "started_at": started.started_at,
    });
    if let Ok(bytes) = serde_json::to_vec(&meta) {
        let _ = tokio::fs::write(dir.join("meta.json"), bytes).await;
    }

    let cancel = deps.shutdown.child_token();
    let guard = deps.registry.register(&task.task_id, cancel.clone());
    let scope = AttemptScope {
        attempt_id: started.attempt_id,
        started_at: started.started_at.clone(),
        dir,
        crash_note,
        cancel,
    };
    debug!(task_id = %task.task_id, %role, attempt_id = scope.attempt_id, "attempt started");
    let outcome = handler.run_attempt(deps, task, &scope).await;
    drop(guard);

    match outcome {
        StageOutcome::Advance {
            phase,
            status,
            summary,
        } => {
            let _ = deps
                .store
                .finish_attempt(scope.attempt_id, AttemptStatus::Ok, summary)
                .await;
            update_phase_logged(&deps.store, &task.task_id, phase, status).await;
        }
        StageOutcome::Fail {
            summary,
            mark_task_failed,
        } => {
            // finish_attempt applies the budget rule atomically; if the
            // budget is exhausted the task is already failed by the time
            // this returns.
            let _ = deps
                .store
                .finish_attempt(scope.attempt_id, AttemptStatus::Failed, &summary)
                .await;
            if mark_task_failed {
                update_phase_logged(&deps.store, &task.task_id, role.phase(), TaskStatus::Failed)
                    .await;
            }
        }
        StageOutcome::Cancelled => {
            write_result(
                &scope.dir,
                &json!({"status": "cancelled", "role": role.as_str()}),
            )
            .await;
            let _ = deps
                .store
                .finish_attempt(scope.attempt_id, AttemptStatus::Cancelled, "cancelled")
                .await;
            // Status flips to cancelled; the phase stays where it died.
            update_phase_logged(&deps.store, &task.task_id, task.phase, TaskStatus::Cancelled)
                .await;
        }
    }
}

/// Crash-recovery preamble for the next attempt, if the latest prior attempt
/// of this role carries the reconcile sentinel.
async fn crash_note(store: &SqliteStore, task_id: &str, role: Role) -> Option<&'static str> {
    match store.latest_attempt_by_role(task_id, role).await {
        Ok(prev)
            if prev
                .error_summary
                .as_deref()
                .unwrap_or("")
                .contains("crash recovery") =>
        {
            Some(CRASH_NOTE)
        }
        _ => None,
    }
}

/// Phase/status update where failure is logged, not raised; the store has
/// already absorbed transient contention.
pub(crate) async fn update_phase_logged(
    store: &SqliteStore,
    task_id: &str,
    phase: Phase,
    status: TaskStatus,
) {
    if let Err(err) = store.update_phase_status(task_id, phase, status).await {
        warn!(task_id, %phase, %status, error = %err, "update task phase/status failed");
    }
}

/// Best-effort `result.json` write.
pub(crate) async fn write_result(dir: &Path, value: &serde_json::Value) {
    if let Ok(bytes) = serde_json::to_vec(value) {
        let _ = tokio::fs::write(dir.join("result.json"), bytes).await;
    }
}

/// Absolute workspace path for a task, `None` when unset or unsafe.
pub(crate) fn workspace_full_path(deps: &WorkerDeps, task: &Task) -> Option<PathBuf> {
    if task.workspace_path.is_empty() {
        return None;
    }
    paths::safe_join(&deps.repo_root, &task.workspace_path).ok()
}

/// The attempt's `log.txt`, streamed as the stage runs.
pub(crate) struct AttemptLog {
    file: tokio::fs::File,
    path: PathBuf,
}

impl AttemptLog {
    pub async fn create(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join("log.txt");
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw text.
    pub async fn raw(&mut self, text: &str) {
        let _ = self.file.write_all(text.as_bytes()).await;
    }

    /// Append one line.
    pub async fn line(&mut self, text: &str) {
        let _ = self.file.write_all(text.as_bytes()).await;
        let _ = self.file.write_all(b"\n").await;
    }

    /// Run a command with both output streams appended to this log.
    pub async fn stream_command(
        &mut self,
        runner: &dyn CommandRunner,
        cancel: &CancellationToken,
        dir: &Path,
        argv: &[String],
    ) -> Result<i32, ExecError> {
        self.file.flush().await?;
        let mut out = self.file.try_clone().await?;
        let mut err = self.file.try_clone().await?;
        let result = runner.run(cancel, dir, argv, &[], &mut out, &mut err).await;
        let _ = out.flush().await;
        let _ = err.flush().await;
        result
    }

    pub async fn flush(&mut self) {
        let _ = self.file.flush().await;
    }
}

/// Outcome of an optional stage hook.
pub(crate) enum HookStatus {
    /// No hook configured or file absent.
    Skipped,
    /// Hook ran and exited zero.
    Ran,
    /// Hook ran and exited non-zero.
    Failed(i32),
}

/// Run a repo-relative hook script in `workdir`, appending its combined
/// output and any skip notes to the attempt log.
///
/// Scripts are skipped with a note on Windows, and when present but not
/// executable.
pub(crate) async fn run_hook(
    deps: &WorkerDeps,
    cancel: &CancellationToken,
    hook_rel: &str,
    workdir: &Path,
    log: &mut AttemptLog,
) -> Result<HookStatus, ExecError> {
    if !deps.hooks.enabled || hook_rel.is_empty() {
        return Ok(HookStatus::Skipped);
    }
    let hook_path = match paths::safe_join(&deps.repo_root, hook_rel) {
        Ok(path) => path,
        Err(err) => {
            log.line(&format!("hook path rejected: {err}")).await;
            return Ok(HookStatus::Skipped);
        }
    };
    let meta = match std::fs::metadata(&hook_path) {
        Ok(meta) => meta,
        Err(_) => return Ok(HookStatus::Skipped),
    };

    log.line("hook found").await;
    if cfg!(windows) {
        log.line(&format!("skipped {hook_rel} on windows")).await;
        return Ok(HookStatus::Skipped);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            log.line(&format!("{hook_rel} exists but not executable, skipping"))
                .await;
            return Ok(HookStatus::Skipped);
        }
    }
    let _ = meta;

    let argv = vec![
        "/bin/sh".to_string(),
        "-x".to_string(),
        hook_path.to_string_lossy().into_owned(),
    ];
    let code = log
        .stream_command(deps.runner.as_ref(), cancel, workdir, &argv)
        .await?;
    if code != 0 {
        return Ok(HookStatus::Failed(code));
    }
    Ok(HookStatus::Ran)
}
