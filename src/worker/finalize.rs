//! Finalize worker: commits workspace changes and publishes them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{
    run_hook, run_stage_loop, workspace_full_path, write_result, AttemptLog, AttemptScope,
    HookStatus, StageHandler, StageOutcome, WorkerDeps,
};
use crate::api::{Phase, Role, Task, TaskStatus};
use crate::exec::ExecError;
use crate::store::now_rfc3339;
use crate::workspace::branch_name;

/// Run the finalize worker until shutdown.
pub async fn run(deps: Arc<WorkerDeps>) {
    run_stage_loop(deps, FinalizeHandler).await;
}

/// First stdout line that looks like a URL, if any.
fn first_url_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("http://") || line.starts_with("https://"))
        .map(str::to_string)
}

struct FinalizeHandler;

impl FinalizeHandler {
    fn failed(summary: impl Into<String>) -> StageOutcome {
        StageOutcome::Fail {
            summary: summary.into(),
            mark_task_failed: true,
        }
    }
}

#[async_trait]
impl StageHandler for FinalizeHandler {
    fn role(&self) -> Role {
        Role::Finalize
    }

    async fn run_attempt(
        &self,
        deps: &WorkerDeps,
        task: &Task,
        scope: &AttemptScope,
    ) -> StageOutcome {
        let mut log = match AttemptLog::create(&scope.dir).await {
            Ok(log) => log,
            Err(err) => return Self::failed(err.to_string()),
        };
        log.line(&format!("started_at: {}", scope.started_at)).await;
        if let Some(note) = scope.crash_note {
            log.raw(note).await;
        }

        let Some(workspace) = workspace_full_path(deps, task) else {
            log.line("missing workspace").await;
            log.flush().await;
            write_result(
                &scope.dir,
                &json!({"status": "failed", "role": "finalize", "exit_code": -1}),
            )
            .await;
            return Self::failed("missing workspace");
        };

        // Branch create-or-reuse: create new, force-reset create, checkout
        // existing; first success wins.
        let branch = branch_name(&task.task_id);
        let candidates: [Vec<String>; 3] = [
            vec!["git".into(), "checkout".into(), "-b".into(), branch.clone()],
            vec!["git".into(), "checkout".into(), "-B".into(), branch.clone()],
            vec!["git".into(), "checkout".into(), branch.clone()],
        ];
        let mut checked_out = false;
        for argv in &candidates {
            match log
                .stream_command(deps.runner.as_ref(), &scope.cancel, &workspace, argv)
                .await
            {
                Err(ExecError::Cancelled) => {
                    log.flush().await;
                    return StageOutcome::Cancelled;
                }
                Ok(0) => {
                    checked_out = true;
                    break;
                }
                Ok(_) | Err(_) => {}
            }
        }
        if !checked_out {
            log.line("branch error: checkout failed").await;
            log.flush().await;
            write_result(
                &scope.dir,
                &json!({"status": "failed", "role": "finalize", "error_summary": "branch failed"}),
            )
            .await;
            return Self::failed(format!("branch {branch} checkout failed"));
        }

        // Stage and commit pending changes, if any.
        let mut status_out = Vec::new();
        let mut status_err = Vec::new();
        let status_argv: Vec<String> = vec!["git".into(), "status".into(), "--porcelain".into()];
        match deps
            .runner
            .run(
                &scope.cancel,
                &workspace,
                &status_argv,
                &[],
                &mut status_out,
                &mut status_err,
            )
            .await
        {
            Err(ExecError::Cancelled) => {
                log.flush().await;
                return StageOutcome::Cancelled;
            }
            Err(err) => {
                log.line(&format!("git status error: {err}")).await;
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "finalize", "error_summary": "git status failed"}),
                )
                .await;
                return Self::failed(err.to_string());
            }
            Ok(code) if code != 0 => {
                log.line(&format!("git status exit code {code}")).await;
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "finalize", "error_summary": "git status failed"}),
                )
                .await;
                return Self::failed("git status failed");
            }
            Ok(_) => {}
        }

        if !String::from_utf8_lossy(&status_out).trim().is_empty() {
            log.line("changes detected, committing").await;
            let add: Vec<String> = vec!["git".into(), "add".into(), "-A".into()];
            let _ = log
                .stream_command(deps.runner.as_ref(), &scope.cancel, &workspace, &add)
                .await;
            let commit: Vec<String> = vec![
                "git".into(),
                "commit".into(),
                "-m".into(),
                format!("conveyor: {}", task.task_id),
            ];
            match log
                .stream_command(deps.runner.as_ref(), &scope.cancel, &workspace, &commit)
                .await
            {
                Err(ExecError::Cancelled) => {
                    log.flush().await;
                    return StageOutcome::Cancelled;
                }
                Err(err) => {
                    log.flush().await;
                    write_result(
                        &scope.dir,
                        &json!({"status": "failed", "role": "finalize", "error_summary": "git commit failed"}),
                    )
                    .await;
                    return Self::failed(err.to_string());
                }
                Ok(code) if code != 0 => {
                    log.flush().await;
                    write_result(
                        &scope.dir,
                        &json!({"status": "failed", "role": "finalize", "error_summary": "git commit failed"}),
                    )
                    .await;
                    return Self::failed(format!("git commit exit code {code}"));
                }
                Ok(_) => {}
            }
        } else {
            log.line("no changes to commit").await;
        }

        // Publish command; its stdout carries the publish URL.
        let mut pub_out = Vec::new();
        let mut pub_err = Vec::new();
        let publish = deps
            .runner
            .run(
                &scope.cancel,
                &workspace,
                &deps.commands.finalize_command,
                &[],
                &mut pub_out,
                &mut pub_err,
            )
            .await;
        let stdout = String::from_utf8_lossy(&pub_out).into_owned();
        let stderr = String::from_utf8_lossy(&pub_err).into_owned();
        log.line(&format!("finished_at: {}", now_rfc3339())).await;
        log.line(&format!("stdout:\n{stdout}")).await;
        log.line(&format!("stderr:\n{stderr}")).await;
        log.flush().await;

        match publish {
            Err(ExecError::Cancelled) => return StageOutcome::Cancelled,
            Err(err) => {
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "finalize", "error_summary": stderr}),
                )
                .await;
                return Self::failed(err.to_string());
            }
            Ok(code) if code != 0 => {
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "finalize", "error_summary": stderr}),
                )
                .await;
                return Self::failed(format!("publish exit code {code}"));
            }
            Ok(_) => {}
        }

        let hook_path = deps.hooks.finalize_path.clone();
        match run_hook(deps, &scope.cancel, &hook_path, &workspace, &mut log).await {
            Ok(HookStatus::Skipped | HookStatus::Ran) => {}
            Ok(HookStatus::Failed(code)) => {
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "finalize"}),
                )
                .await;
                return Self::failed(format!("finalize hook exit code {code}"));
            }
            Err(ExecError::Cancelled) => {
                log.flush().await;
                return StageOutcome::Cancelled;
            }
            Err(err) => {
                log.flush().await;
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "finalize"}),
                )
                .await;
                return Self::failed(err.to_string());
            }
        }

        let mut result = json!({"status": "ok", "role": "finalize"});
        if let Some(url) = first_url_line(&stdout) {
            result["pr_url"] = json!(url);
        }
        write_result(&scope.dir, &result).await;

        StageOutcome::Advance {
            phase: Phase::Done,
            status: TaskStatus::Completed,
            summary: "",
        }
    }
}
