//! Prepare worker: provisions the task workspace.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{
    run_hook, run_stage_loop, write_result, AttemptLog, AttemptScope, HookStatus, StageHandler,
    StageOutcome, WorkerDeps,
};
use crate::api::{Phase, Role, Task, TaskStatus};
use crate::workspace::{ensure_workspace, WorkspaceError};

/// Run the prepare worker until shutdown.
pub async fn run(deps: Arc<WorkerDeps>) {
    run_stage_loop(deps, PrepareHandler).await;
}

struct PrepareHandler;

#[async_trait]
impl StageHandler for PrepareHandler {
    fn role(&self) -> Role {
        Role::Prepare
    }

    async fn run_attempt(
        &self,
        deps: &WorkerDeps,
        task: &Task,
        scope: &AttemptScope,
    ) -> StageOutcome {
        let mut log = match AttemptLog::create(&scope.dir).await {
            Ok(log) => log,
            Err(err) => {
                return StageOutcome::Fail {
                    summary: err.to_string(),
                    mark_task_failed: true,
                }
            }
        };
        if let Some(note) = scope.crash_note {
            log.raw(note).await;
        }

        let workspace = match ensure_workspace(
            deps.runner.as_ref(),
            &scope.cancel,
            &deps.repo_root,
            &task.task_id,
            None,
        )
        .await
        {
            Ok((path, git_output)) => {
                log.line("workspace ensured").await;
                log.raw(&git_output).await;
                path
            }
            Err(WorkspaceError::Cancelled) => {
                log.line("cancelled").await;
                log.flush().await;
                return StageOutcome::Cancelled;
            }
            Err(err) => {
                log.line(&err.to_string()).await;
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "prepare"}),
                )
                .await;
                // No retry budget at this stage.
                return StageOutcome::Fail {
                    summary: err.to_string(),
                    mark_task_failed: true,
                };
            }
        };

        let hooks_prepare = deps.hooks.prepare_path.clone();
        match run_hook(deps, &scope.cancel, &hooks_prepare, &workspace, &mut log).await {
            Ok(HookStatus::Skipped | HookStatus::Ran) => {}
            Ok(HookStatus::Failed(code)) => {
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "prepare"}),
                )
                .await;
                return StageOutcome::Fail {
                    summary: format!("prepare hook exit code {code}"),
                    mark_task_failed: true,
                };
            }
            Err(crate::exec::ExecError::Cancelled) => {
                log.line("cancelled").await;
                log.flush().await;
                return StageOutcome::Cancelled;
            }
            Err(err) => {
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "prepare"}),
                )
                .await;
                return StageOutcome::Fail {
                    summary: err.to_string(),
                    mark_task_failed: true,
                };
            }
        }

        log.flush().await;
        write_result(&scope.dir, &json!({"status": "ok", "role": "prepare"})).await;
        StageOutcome::Advance {
            phase: Phase::Produce,
            status: TaskStatus::Running,
            summary: "",
        }
    }
}
