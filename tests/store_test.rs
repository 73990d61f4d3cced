//! Store semantics: creation, claims, budgets, cancellation.

mod common;

use common::setup_store;
use conveyor::config::RetryConfig;
use conveyor::{AttemptStatus, CreateTaskRequest, Phase, Role, StoreError, TaskStatus};

fn req(task_id: &str) -> CreateTaskRequest {
    CreateTaskRequest {
        task_id: task_id.to_string(),
        prompt: "p".to_string(),
    }
}

fn budgets() -> RetryConfig {
    RetryConfig::default()
}

#[tokio::test]
async fn create_starts_in_prepare_running() {
    let store = setup_store().await;
    let (task, existed) = store.create_task(&req("t1"), &budgets()).await.unwrap();

    assert!(!existed);
    assert_eq!(task.phase, Phase::Prepare);
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.produce_budget, 3);
    assert_eq!(task.review_loop_budget, 2);
    assert_eq!(task.produce_retries, 0);
    assert_eq!(task.artifacts_root, ".conveyor/runs/t1");
    assert_eq!(task.workspace_path, ".conveyor/worktrees/t1");
    assert_eq!(task.current_attempt_id, None);
}

#[tokio::test]
async fn duplicate_create_returns_existing() {
    let store = setup_store().await;
    let (first, _) = store.create_task(&req("t1"), &budgets()).await.unwrap();
    let (second, existed) = store.create_task(&req("t1"), &budgets()).await.unwrap();

    assert!(existed);
    assert_eq!(second.task_id, first.task_id);
    assert_eq!(second.created_at, first.created_at);
}

#[tokio::test]
async fn create_rejects_invalid_id() {
    let store = setup_store().await;
    let result = store.create_task(&req("../x"), &budgets()).await;
    assert!(matches!(result, Err(StoreError::Path(_))));
    // nothing persisted
    assert!(store.list_tasks(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_orders_newest_first_and_honors_limit() {
    let store = setup_store().await;
    for id in ["a", "b", "c"] {
        store.create_task(&req(id), &budgets()).await.unwrap();
        // created_at has nanosecond precision; a tick keeps the order stable
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let all = store.list_tasks(0).await.unwrap();
    let ids: Vec<_> = all.iter().map(|t| t.task_id.as_str()).collect();
    assert_eq!(ids, ["c", "b", "a"]);

    let limited = store.list_tasks(2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].task_id, "c");
}

#[tokio::test]
async fn start_attempt_claims_single_slot() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();

    let started = store.start_attempt("t1", Role::Prepare).await.unwrap();
    assert_eq!(started.attempt_num, 1);
    assert_eq!(
        started.artifacts_dir,
        format!(".conveyor/runs/t1/attempts/{}", started.attempt_id)
    );

    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.current_attempt_id, Some(started.attempt_id));

    // second claim loses, and its attempt row is rolled back
    let second = store.start_attempt("t1", Role::Prepare).await;
    assert!(matches!(second, Err(StoreError::InProgress)));
    let latest = store.latest_attempt("t1").await.unwrap();
    assert_eq!(latest.id, started.attempt_id);
}

#[tokio::test]
async fn start_attempt_unknown_task_is_not_found() {
    let store = setup_store().await;
    assert!(matches!(
        store.start_attempt("nope", Role::Prepare).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn attempt_numbers_are_monotonic_per_role() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();

    let first = store.start_attempt("t1", Role::Produce).await.unwrap();
    store
        .finish_attempt(first.attempt_id, AttemptStatus::Ok, "")
        .await
        .unwrap();
    let second = store.start_attempt("t1", Role::Produce).await.unwrap();
    store
        .finish_attempt(second.attempt_id, AttemptStatus::Ok, "")
        .await
        .unwrap();
    // a different role starts from 1 again
    let other = store.start_attempt("t1", Role::Review).await.unwrap();

    assert_eq!(first.attempt_num, 1);
    assert_eq!(second.attempt_num, 2);
    assert_eq!(other.attempt_num, 1);
}

#[tokio::test]
async fn finish_attempt_clears_slot_and_sets_terminal_fields() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();
    let started = store.start_attempt("t1", Role::Prepare).await.unwrap();

    store
        .finish_attempt(started.attempt_id, AttemptStatus::Ok, "")
        .await
        .unwrap();

    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.current_attempt_id, None);

    let attempt = store.get_attempt("t1", started.attempt_id).await.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Ok);
    assert!(attempt.finished_at.is_some());
    assert_eq!(attempt.error_summary, None);
}

#[tokio::test]
async fn failed_produce_attempts_exhaust_budget_atomically() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();
    store
        .update_phase_status("t1", Phase::Produce, TaskStatus::Running)
        .await
        .unwrap();

    for expected in 1..=3 {
        let started = store.start_attempt("t1", Role::Produce).await.unwrap();
        let count = store
            .finish_attempt(started.attempt_id, AttemptStatus::Failed, "exit code 1")
            .await
            .unwrap();
        assert_eq!(count, expected);
    }

    // third failure met the budget inside the same transaction
    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.produce_retries, 3);
    assert_eq!(task.phase, Phase::Produce);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.current_attempt_id, None);
}

#[tokio::test]
async fn failed_prepare_attempt_touches_no_counter() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();
    let started = store.start_attempt("t1", Role::Prepare).await.unwrap();

    let count = store
        .finish_attempt(started.attempt_id, AttemptStatus::Failed, "boom")
        .await
        .unwrap();
    assert_eq!(count, 0);

    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.produce_retries, 0);
    assert_eq!(task.review_stage_retries, 0);
    // finish_attempt alone does not fail budgetless stages
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn cancelled_attempts_never_consume_budget() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();
    store
        .update_phase_status("t1", Phase::Produce, TaskStatus::Running)
        .await
        .unwrap();

    let started = store.start_attempt("t1", Role::Produce).await.unwrap();
    let count = store
        .finish_attempt(started.attempt_id, AttemptStatus::Cancelled, "cancelled")
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(store.get_task("t1").await.unwrap().produce_retries, 0);
}

#[tokio::test]
async fn increment_review_loop_retries_counts_up() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();

    assert_eq!(store.increment_review_loop_retries("t1").await.unwrap(), 1);
    assert_eq!(store.increment_review_loop_retries("t1").await.unwrap(), 2);
    assert!(matches!(
        store.increment_review_loop_retries("nope").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn cancel_twice_is_idempotent() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();

    assert!(store.cancel_task("t1").await.unwrap());
    assert!(!store.cancel_task("t1").await.unwrap());
    assert!(store.is_cancelled("t1").await.unwrap());

    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    // phase preserved
    assert_eq!(task.phase, Phase::Prepare);
}

#[tokio::test]
async fn cancel_does_not_resurrect_terminal_tasks() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();
    store
        .update_phase_status("t1", Phase::Done, TaskStatus::Completed)
        .await
        .unwrap();

    assert!(!store.cancel_task("t1").await.unwrap());
    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn cancel_unknown_task_is_not_found() {
    let store = setup_store().await;
    assert!(matches!(
        store.cancel_task("nope").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn latest_attempt_queries_select_by_role_and_recency() {
    let store = setup_store().await;
    store.create_task(&req("t1"), &budgets()).await.unwrap();

    let produce = store.start_attempt("t1", Role::Produce).await.unwrap();
    store
        .finish_attempt(produce.attempt_id, AttemptStatus::Ok, "")
        .await
        .unwrap();
    let review = store.start_attempt("t1", Role::Review).await.unwrap();
    store
        .finish_attempt(review.attempt_id, AttemptStatus::Ok, "approved")
        .await
        .unwrap();

    assert_eq!(store.latest_attempt("t1").await.unwrap().id, review.attempt_id);
    assert_eq!(
        store
            .latest_attempt_by_role("t1", Role::Produce)
            .await
            .unwrap()
            .id,
        produce.attempt_id
    );
    assert!(matches!(
        store.latest_attempt_by_role("t1", Role::Finalize).await,
        Err(StoreError::NotFound)
    ));
}
