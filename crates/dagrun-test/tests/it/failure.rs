use std::time::Duration;

use dagrun_core::entity::{DagInstanceStatus, TaskInstanceStatus};
use dagrun_test::*;

#[tokio::test]
async fn failed_branch_skips_dependents_but_not_siblings() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    // t2 fails immediately; t3 keeps running on the independent branch and
    // must still succeed. Only the join behind the failure is skipped.
    let dag = crate::dag(
        "partial-failure",
        vec![
            crate::task("t1", NOOP, &[]),
            crate::task("t2", FAIL, &["t1"]),
            crate::sleep_task("t3", &["t1"], 1100),
            crate::task("t4", NOOP, &["t2", "t3"]),
        ],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Failed,
        Duration::from_secs(15),
    )
    .await;
    assert!(done.reason.contains("t2"), "reason was: {}", done.reason);

    let t2 = task_instance(&cluster.store, &ins.base.id, "t2").await.unwrap();
    let t3 = task_instance(&cluster.store, &ins.base.id, "t3").await.unwrap();
    let t4 = task_instance(&cluster.store, &ins.base.id, "t4").await.unwrap();
    assert_eq!(t2.status, TaskInstanceStatus::Failed);
    assert!(t2.reason.contains("boom"));
    assert_eq!(t3.status, TaskInstanceStatus::Success);
    assert_eq!(t4.status, TaskInstanceStatus::Skipped);

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn unregistered_action_fails_the_instance_at_parse() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let dag = crate::dag("ghost", vec![crate::task("t1", "no-such-action", &[])]);
    let ins = submit(&cluster, dag).await.unwrap();

    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Failed,
        Duration::from_secs(10),
    )
    .await;
    assert!(
        done.reason.contains("no-such-action"),
        "reason was: {}",
        done.reason
    );
    // Validation failed before materialization, so no task rows exist.
    assert!(task_instances(&cluster.store, &ins.base.id).await.is_empty());

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn task_timeout_fails_with_timeout_reason() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let mut slow = crate::sleep_task("t1", &[], 10_000);
    slow.timeout_secs = 1;
    let dag = crate::dag("timeout", vec![slow]);
    let ins = submit(&cluster, dag).await.unwrap();

    wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Failed,
        Duration::from_secs(15),
    )
    .await;

    let t1 = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    assert_eq!(t1.status, TaskInstanceStatus::Failed);
    assert_eq!(t1.reason, "Timeout");

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}
