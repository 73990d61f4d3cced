//! Review worker: runs the review command and interprets its decision.

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

/// Run the review worker until shutdown.
pub async fn run(deps: Arc<WorkerDeps>) {
    run_stage_loop(deps, ReviewHandler).await;
}

/// First line whose first non-whitespace byte opens a JSON object or array,
/// falling back to the whole trimmed input.
fn parse_decision(raw: &[u8]) -> Option<serde_json::Value> {
    for line in raw.split(|b| *b == b'\n') {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed[0] == b'{' || trimmed[0] == b'[' {
            if let Ok(value) = serde_json::from_slice(trimmed) {
                return Some(value);
            }
            break;
        }
    }
    serde_json::from_slice(raw.trim_ascii()).ok()
}

struct ReviewHandler;

#[async_trait]
impl StageHandler for ReviewHandler {
    fn role(&self) -> Role {
        Role::Review
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

        let argv = &deps.commands.review_command;
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
                &json!({"status": "failed", "role": "review", "exit_code": -1}),
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
        log.line(&format!("finished_at: {}", now_rfc3339())).await;
        if let Ok(code) = &run {
            log.line(&format!("exit_code: {code}")).await;
        }
        log.flush().await;

        match run {
            Err(ExecError::Cancelled) => return StageOutcome::Cancelled,
            Err(err) => {
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "review", "exit_code": -1}),
                )
                .await;
                return StageOutcome::Fail {
                    summary: err.to_string(),
                    mark_task_failed: false,
                };
            }
            Ok(code) if code != 0 => {
                write_result(
                    &scope.dir,
                    &json!({"status": "failed", "role": "review", "exit_code": code}),
                )
                .await;
                return StageOutcome::Fail {
                    summary: format!("exit code {code}"),
                    mark_task_failed: false,
                };
            }
            Ok(_) => {}
        }

        // The command's output is in the log; the decision is the first
        // JSON-looking line of it.
        let captured = tokio::fs::read(log.path()).await.unwrap_or_default();
        let Some(decision) = parse_decision(&captured) else {
            write_result(
                &scope.dir,
                &json!({"status": "failed", "role": "review", "note": "invalid decision"}),
            )
            .await;
            return StageOutcome::Fail {
                summary: "invalid decision".to_string(),
                mark_task_failed: true,
            };
        };

        // result.json for review is the decision object itself.
        write_result(&scope.dir, &decision).await;

        match decision.get("decision").and_then(|v| v.as_str()) {
            Some("approved") => StageOutcome::Advance {
                phase: Phase::Finalize,
                status: TaskStatus::Running,
                summary: "approved",
            },
            Some("changes_requested") => {
                // Loop-back is a non-error outcome of a successful attempt,
                // so the counter is bumped here rather than by the budget
                // rule in finish_attempt.
                let count = match deps
                    .store
                    .increment_review_loop_retries(&task.task_id)
                    .await
                {
                    Ok(count) => count,
                    Err(err) => {
                        return StageOutcome::Fail {
                            summary: format!("increment review loop retries: {err}"),
                            mark_task_failed: true,
                        }
                    }
                };
                if count > task.review_loop_budget {
                    StageOutcome::Advance {
                        phase: Phase::Review,
                        status: TaskStatus::Failed,
                        summary: "changes requested",
                    }
                } else {
                    StageOutcome::Advance {
                        phase: Phase::Produce,
                        status: TaskStatus::Running,
                        summary: "changes requested",
                    }
                }
            }
            Some("rejected") => StageOutcome::Fail {
                summary: "rejected".to_string(),
                mark_task_failed: true,
            },
            _ => StageOutcome::Fail {
                summary: "unknown decision".to_string(),
                mark_task_failed: true,
            },
        }
    }
}
