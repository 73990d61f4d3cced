//! HTTP surface for the orchestrator.
//!
//! Maps the REST endpoints onto store operations and the in-process
//! cancellation registry. All state changes flow through the store; the only
//! side channel is triggering a running attempt's cancel handle.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use conveyor::config::RetryConfig;
use conveyor::paths;
use conveyor::{CancelRegistry, CreateTaskRequest, Role, SqliteStore, StoreError};

/// Default listen address for the daemon.
pub const DEFAULT_ADDR: &str = "127.0.0.1:7077";

/// Hard cap on log bytes served by the logs endpoint.
const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Shared state for the HTTP surface.
pub struct AppState {
    pub store: SqliteStore,
    pub registry: Arc<CancelRegistry>,
    pub repo_root: PathBuf,
    pub retry: RetryConfig,
}

/// Create the router for the orchestrator API.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/{task_id}", get(get_task))
        .route("/v1/tasks/{task_id}/cancel", post(cancel_task))
        .route("/v1/tasks/{task_id}/logs", get(get_task_logs))
        .route("/v1/tasks/{task_id}/cleanup", post(cleanup_task))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

type ApiError = (StatusCode, String);

fn bad_request(msg: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, msg.to_string())
}

fn map_store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
        StoreError::Path(err) => (StatusCode::BAD_REQUEST, err.to_string()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

#[derive(Deserialize)]
struct CreateBody {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    prompt: String,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBody>,
) -> Result<Response, ApiError> {
    if body.task_id.is_empty() || body.prompt.is_empty() {
        return Err(bad_request("task_id and prompt are required"));
    }
    paths::validate_task_id(&body.task_id).map_err(|_| bad_request("invalid task_id"))?;

    let req = CreateTaskRequest {
        task_id: body.task_id,
        prompt: body.prompt,
    };
    let (task, existed) = state
        .store
        .create_task(&req, &state.retry)
        .await
        .map_err(map_store_error)?;

    let code = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((code, Json(task)).into_response())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    paths::validate_task_id(&task_id).map_err(|_| bad_request("invalid task_id"))?;
    let task = state
        .store
        .get_task(&task_id)
        .await
        .map_err(map_store_error)?;
    Ok(Json(task).into_response())
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let tasks = state
        .store
        .list_tasks(query.limit.unwrap_or(0))
        .await
        .map_err(map_store_error)?;
    Ok(Json(tasks).into_response())
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    paths::validate_task_id(&task_id).map_err(|_| bad_request("invalid task_id"))?;
    let changed = state
        .store
        .cancel_task(&task_id)
        .await
        .map_err(map_store_error)?;
    // Interrupt the in-flight command, if any, without waiting for a poll.
    state.registry.cancel(&task_id);
    Ok(if changed { "cancelled" } else { "no-op" }.into_response())
}

#[derive(Deserialize)]
struct LogsQuery {
    role: Option<String>,
    attempt_id: Option<i64>,
    tail: Option<i64>,
}

async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    paths::validate_task_id(&task_id).map_err(|_| bad_request("invalid task_id"))?;
    state
        .store
        .get_task(&task_id)
        .await
        .map_err(map_store_error)?;

    // Selection precedence: attempt_id > role > latest.
    let attempt = if let Some(id) = query.attempt_id {
        if id <= 0 {
            return Err(bad_request("invalid attempt_id"));
        }
        state.store.get_attempt(&task_id, id).await
    } else if let Some(role) = &query.role {
        let role: Role = role.parse().map_err(|_| bad_request("invalid role"))?;
        state.store.latest_attempt_by_role(&task_id, role).await
    } else {
        state.store.latest_attempt(&task_id).await
    }
    .map_err(map_store_error)?;

    let dir = paths::safe_join(&state.repo_root, &attempt.artifacts_dir)
        .map_err(|err| bad_request(&err.to_string()))?;
    let log_path = dir.join("log.txt");

    match tokio::fs::metadata(&log_path).await {
        Ok(meta) if meta.len() > MAX_LOG_BYTES => {
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                "log too large".to_string(),
            ));
        }
        _ => {}
    }

    let contents = match tokio::fs::read_to_string(&log_path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err((StatusCode::NOT_FOUND, "not found".to_string()));
        }
        Err(err) => return Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    };

    let body = match query.tail {
        Some(n) if n < 0 => return Err(bad_request("invalid tail")),
        Some(n) => tail_lines(&contents, n as usize),
        None => contents,
    };

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::HeaderName::from_static("x-attempt-id"),
                attempt.id.to_string(),
            ),
            (
                header::HeaderName::from_static("x-role"),
                attempt.role.to_string(),
            ),
        ],
        body,
    )
        .into_response())
}

async fn cleanup_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    paths::validate_task_id(&task_id).map_err(|_| bad_request("invalid task_id"))?;
    let task = state
        .store
        .get_task(&task_id)
        .await
        .map_err(map_store_error)?;

    for rel in [&task.workspace_path, &task.artifacts_root] {
        if rel.is_empty() {
            continue;
        }
        let full = paths::safe_join(&state.repo_root, rel)
            .map_err(|err| bad_request(&err.to_string()))?;
        match tokio::fs::remove_dir_all(&full).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err((StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
        }
    }
    Ok("cleaned".into_response())
}

/// Last `n` newline-separated lines of `s`. `n = 0` is empty; `n` covering
/// the whole log returns it unchanged, trailing newline and all.
fn tail_lines(s: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let normalized = s.replace("\r\n", "\n");
    let had_trailing = normalized.ends_with('\n');
    let mut lines: Vec<&str> = normalized.split('\n').collect();
    if had_trailing {
        lines.pop();
    }
    if n >= lines.len() {
        return normalized;
    }
    let mut out = lines[lines.len() - n..].join("\n");
    if had_trailing {
        out.push('\n');
    }
    out
}
