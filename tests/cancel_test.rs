//! Mid-attempt cancellation through the registry.

mod common;

use std::time::{Duration, Instant};

use common::{test_config, Harness, Script};
use conveyor::{AttemptStatus, Phase, Role, TaskStatus};

#[tokio::test]
async fn cancel_interrupts_a_running_produce_attempt() {
    let harness = Harness::start(test_config()).await;
    // the produce command hangs until its cancellation token fires
    harness.runner.push("produce", Script::Block);

    harness.submit("t1").await;

    // wait until the produce attempt is in flight
    harness
        .wait_for("t1", |t| {
            t.phase == Phase::Produce && t.current_attempt_id.is_some()
        })
        .await;

    // what the HTTP cancel handler does: flip the store, trigger the handle
    let cancelled_at = Instant::now();
    assert!(harness.store.cancel_task("t1").await.unwrap());
    assert!(harness.registry.cancel("t1"));

    let task = harness
        .wait_for("t1", |t| t.current_attempt_id.is_none())
        .await;
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(1),
        "cancel took {:?}",
        cancelled_at.elapsed()
    );

    assert_eq!(task.status, TaskStatus::Cancelled);
    // phase preserved
    assert_eq!(task.phase, Phase::Produce);

    let attempt = harness
        .store
        .latest_attempt_by_role("t1", Role::Produce)
        .await
        .unwrap();
    assert_eq!(attempt.status, AttemptStatus::Cancelled);
    assert_eq!(attempt.error_summary.as_deref(), Some("cancelled"));

    // never counted against the budget
    assert_eq!(task.produce_retries, 0);

    // the attempt log kept the partial output written before the cancel
    let log_path = harness
        .repo_root
        .path()
        .join(&attempt.artifacts_dir)
        .join("log.txt");
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("command: produce"), "log was: {log}");

    let result_path = harness
        .repo_root
        .path()
        .join(&attempt.artifacts_dir)
        .join("result.json");
    let result: serde_json::Value =
        serde_json::from_slice(&std::fs::read(result_path).unwrap()).unwrap();
    assert_eq!(result["status"], "cancelled");

    harness.shutdown().await;
}

#[tokio::test]
async fn cancelled_task_is_never_picked_up_again() {
    let harness = Harness::start(test_config()).await;
    harness.runner.push("produce", Script::Block);

    harness.submit("t1").await;
    harness
        .wait_for("t1", |t| {
            t.phase == Phase::Produce && t.current_attempt_id.is_some()
        })
        .await;
    harness.store.cancel_task("t1").await.unwrap();
    harness.registry.cancel("t1");
    harness
        .wait_for("t1", |t| t.status == TaskStatus::Cancelled)
        .await;

    // give the workers a few ticks; no new attempt may appear
    tokio::time::sleep(Duration::from_millis(100)).await;
    let attempt = harness
        .store
        .latest_attempt_by_role("t1", Role::Produce)
        .await
        .unwrap();
    assert_eq!(attempt.attempt_num, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn registry_cancel_without_running_attempt_is_noop() {
    let harness = Harness::start(test_config()).await;
    assert!(!harness.registry.cancel("nothing-running"));
    harness.shutdown().await;
}
