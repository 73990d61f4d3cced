//! Produce worker: runs the configured produce command in the workspace.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{
    run_stage_loop, workspace_full_path, write_result, AttemptLog, AttemptScope, StageHandler,
    StageOutcome, WorkerDeps,
};
use crate::api::{Phase, Role, Task, TaskStatus};
use crate::exec::ExecError;
use crate::store::now_rfc3339;

/// Run the produce worker until shutdown.
pub async fn run(deps: Arc<WorkerDeps>) {
    run_stage_loop(deps, ProduceHandler).await;
}

struct ProduceHandler;

#[async_trait]
impl StageHandler for ProduceHandler {
    fn role(&self) -> Role {
        Role::Produce
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

        let argv = &deps.commands.produce_command;
        log.line(&format!("command: {}", argv.join(" "))).await;
        log.line(&format!("workdir: {}", task.workspace_path)).await;
        log.line(&format!("started_at: {}", scope.started_at)).await;
        if let Some(note) = scope.crash_note {
            log.raw(note).await;
        }

        let Some(workspace) = workspace_full_path(deps, task) else {
            log.line("missing workspace").await;
            log.flush().await;
            write_result(
                &scope.dir,
                &json!({"status": "failed", "role": "produce", "exit_code": -1}),
            )
            .await;
            return StageOutcome::Fail {
                summary: "missing workspace".to_string(),
                mark_task_failed: true,
            };
        };

        let run = log
            .stream_command(deps.runner.as_ref(), &scope.cancel, &workspace, argv)
            .await;

        match run {
            Err(ExecError::Cancelled) => {
                log.flush().await;
                StageOutcome::Cancelled
            }
            Err(err) => {
                log.line(&format!("finished_at: {}", now_rfc3339())).await;
                log.line("exit_code: -1").await;
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "produce", "exit_code": -1}),
                )
                .await;
                // Budget accounting happens inside finish_attempt.
                StageOutcome::Fail {
                    summary: err.to_string(),
                    mark_task_failed: false,
                }
            }
            Ok(code) => {
                log.line(&format!("finished_at: {}", now_rfc3339())).await;
                log.line(&format!("exit_code: {code}")).await;
                log.flush().await;
                if code == 0 {
                    write_result(
                        &scope.dir,
                        &json!({"status": "ok", "role": "produce", "exit_code": 0}),
                    )
                    .await;
                    StageOutcome::Advance {
                        phase: Phase::Review,
                        status: TaskStatus::Running,
                        summary: "",
                    }
                } else {
                    write_result(
                        &scope.dir,
                        &json!({"status": "failed", "role": "produce", "exit_code": code}),
                    )
                    .await;
                    StageOutcome::Fail {
                        summary: format!("exit code {code}"),
                        mark_task_failed: false,
                    }
                }
            }
        }
    }
}
