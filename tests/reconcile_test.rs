//! Crash recovery: stale in-flight attempts become recorded failures.

mod common;

use common::{setup_store, test_config, Harness, Script};
use conveyor::config::RetryConfig;
use conveyor::{AttemptStatus, CreateTaskRequest, Phase, Role, TaskStatus};

async fn seed_crashed_produce_attempt(
    store: &conveyor::SqliteStore,
    task_id: &str,
) -> conveyor::StartedAttempt {
    let req = CreateTaskRequest {
        task_id: task_id.to_string(),
        prompt: "p".to_string(),
    };
    store
        .create_task(&req, &RetryConfig::default())
        .await
        .unwrap();
    store
        .update_phase_status(task_id, Phase::Produce, TaskStatus::Running)
        .await
        .unwrap();
    // claimed but never finished, as after a process crash
    store.start_attempt(task_id, Role::Produce).await.unwrap()
}

#[tokio::test]
async fn reconcile_fails_stale_attempts_and_writes_artifacts() {
    let store = setup_store().await;
    let repo_root = tempfile::tempdir().unwrap();
    let started = seed_crashed_produce_attempt(&store, "t1").await;

    // pre-existing partial log survives, prefixed with the crash note
    let dir = repo_root.path().join(&started.artifacts_dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("log.txt"), "partial output\n").unwrap();

    store.reconcile(repo_root.path()).await.unwrap();

    let attempt = store.get_attempt("t1", started.attempt_id).await.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert!(attempt
        .error_summary
        .as_deref()
        .unwrap()
        .contains("crash recovery"));
    assert!(attempt.finished_at.is_some());

    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.current_attempt_id, None);
    // the task itself is untouched; the next poll re-attempts it
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.phase, Phase::Produce);

    let log = std::fs::read_to_string(dir.join("log.txt")).unwrap();
    assert!(log.starts_with("crash recovery: restart\n"), "log: {log}");
    assert!(log.contains("partial output"), "log: {log}");

    let result: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.join("result.json")).unwrap()).unwrap();
    assert_eq!(result["status"], "failed");
    assert_eq!(result["note"], "crash recovery");
    assert_eq!(result["role"], "produce");
}

#[tokio::test]
async fn reconcile_twice_changes_nothing() {
    let store = setup_store().await;
    let repo_root = tempfile::tempdir().unwrap();
    let started = seed_crashed_produce_attempt(&store, "t1").await;

    store.reconcile(repo_root.path()).await.unwrap();
    let first = store.get_attempt("t1", started.attempt_id).await.unwrap();
    let dir = repo_root.path().join(&started.artifacts_dir);
    let first_log = std::fs::read_to_string(dir.join("log.txt")).unwrap();

    store.reconcile(repo_root.path()).await.unwrap();
    let second = store.get_attempt("t1", started.attempt_id).await.unwrap();
    let second_log = std::fs::read_to_string(dir.join("log.txt")).unwrap();

    assert_eq!(first.finished_at, second.finished_at);
    assert_eq!(first.error_summary, second.error_summary);
    // no second crash-note prefix
    assert_eq!(first_log, second_log);
}

#[tokio::test]
async fn reconcile_with_no_stale_state_is_a_noop() {
    let store = setup_store().await;
    let repo_root = tempfile::tempdir().unwrap();
    let req = CreateTaskRequest {
        task_id: "t1".to_string(),
        prompt: "p".to_string(),
    };
    store
        .create_task(&req, &RetryConfig::default())
        .await
        .unwrap();

    store.reconcile(repo_root.path()).await.unwrap();
    let task = store.get_task("t1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
}

#[tokio::test]
async fn next_attempt_after_crash_logs_the_recovery_preamble() {
    let mut harness = Harness::new(test_config()).await;

    // seed a crashed produce attempt before any worker runs
    harness.submit("t1").await;
    harness
        .store
        .update_phase_status("t1", Phase::Produce, TaskStatus::Running)
        .await
        .unwrap();
    harness
        .store
        .start_attempt("t1", Role::Produce)
        .await
        .unwrap();

    harness.runner.push("produce", Script::ok(""));
    harness
        .runner
        .push("review", Script::ok("{\"decision\":\"approved\"}\n"));

    // "new process": the coordinator reconciles before the workers start
    harness.start_workers().await;

    let task = harness
        .wait_for("t1", |t| t.status != TaskStatus::Running)
        .await;
    assert_eq!(task.status, TaskStatus::Completed);

    // the produce attempt that followed the crash opens with the preamble
    let attempt = harness
        .store
        .latest_attempt_by_role("t1", Role::Produce)
        .await
        .unwrap();
    assert_eq!(attempt.attempt_num, 2);
    let log_path = harness
        .repo_root
        .path()
        .join(&attempt.artifacts_dir)
        .join("log.txt");
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(
        log.contains("previous run crashed; continue from artifacts"),
        "log was: {log}"
    );

    harness.shutdown().await;
}
