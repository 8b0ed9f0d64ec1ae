use std::time::Duration;

use dagrun_core::entity::{DagInstanceStatus, PreCheck, PreCheckAct, PreCheckCondition, PreCheckOp, PreCheckSource, TaskInstanceStatus};
use dagrun_core::store::{DagInsField, Store};
use dagrun_test::*;

#[tokio::test]
async fn cancel_mid_run_cancels_running_and_skips_downstream() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let dag = crate::dag(
        "cancel",
        vec![
            crate::task("t1", NOOP, &[]),
            crate::sleep_task("t2", &["t1"], 30_000),
            crate::task("t3", NOOP, &["t2"]),
        ],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    wait_task_status(
        &cluster.store,
        &ins.base.id,
        "t2",
        TaskInstanceStatus::Running,
        Duration::from_secs(10),
    )
    .await;

    let mut row = cluster.store.get_dag_instance(&ins.base.id).await.unwrap();
    row.cancel(vec![]).unwrap();
    cluster
        .store
        .patch_dag_ins(&row, &[DagInsField::Cmd])
        .await
        .unwrap();

    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Failed,
        Duration::from_secs(10),
    )
    .await;
    assert!(done.reason.contains("cancel"), "reason was: {}", done.reason);

    let t1 = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    let t2 = task_instance(&cluster.store, &ins.base.id, "t2").await.unwrap();
    let t3 = task_instance(&cluster.store, &ins.base.id, "t3").await.unwrap();
    assert_eq!(t1.status, TaskInstanceStatus::Success);
    assert_eq!(t2.status, TaskInstanceStatus::Canceled);
    assert_eq!(t3.status, TaskInstanceStatus::Skipped);

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn retry_revives_a_failed_instance() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let dag = crate::dag(
        "retry",
        vec![
            crate::task("t1", FLAKY, &[]),
            crate::task("t2", NOOP, &["t1"]),
        ],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    // First attempt fails and cascades.
    let failed = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Failed,
        Duration::from_secs(10),
    )
    .await;
    assert!(failed.worker.is_empty());
    let t2 = task_instance(&cluster.store, &ins.base.id, "t2").await.unwrap();
    assert_eq!(t2.status, TaskInstanceStatus::Skipped);

    // Retry with empty targets resets the failed task and its skipped
    // dependents; some worker re-claims the revived instance.
    let mut row = cluster.store.get_dag_instance(&ins.base.id).await.unwrap();
    row.retry(vec![]).unwrap();
    cluster
        .store
        .patch_dag_ins(&row, &[DagInsField::Cmd])
        .await
        .unwrap();

    wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(10),
    )
    .await;

    let t1 = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    let t2 = task_instance(&cluster.store, &ins.base.id, "t2").await.unwrap();
    assert_eq!(t1.status, TaskInstanceStatus::Success);
    assert_eq!(t2.status, TaskInstanceStatus::Success);
    assert_eq!(t1.depend_on, Vec::<String>::new());
    assert_eq!(t2.depend_on, vec!["t1".to_string()]);
    // Traces survive the retry, with a divider between the attempts.
    assert!(t1.traces.iter().any(|tr| tr.message.contains("retry requested")));
    assert!(t1
        .traces
        .iter()
        .any(|tr| tr.message.contains("second attempt succeeded")));

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn continue_releases_a_blocked_task() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let mut gated = crate::task("t1", NOOP, &[]);
    gated.pre_checks.insert(
        "hold".to_string(),
        PreCheck {
            act: PreCheckAct::Block,
            conditions: vec![PreCheckCondition {
                source: PreCheckSource::Vars,
                op: PreCheckOp::In,
                key: "gate".to_string(),
                values: vec!["hold".to_string()],
            }],
        },
    );
    let dag = crate::dag_with_var(
        "continue",
        ("gate", "hold"),
        vec![gated, crate::task("t2", NOOP, &["t1"])],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    let blocked = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Blocked,
        Duration::from_secs(10),
    )
    .await;
    // A blocked instance keeps its owner so the command has a serving
    // worker.
    assert_eq!(blocked.worker, "w1");
    let t1 = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    assert_eq!(t1.status, TaskInstanceStatus::Blocked);

    let mut row = cluster.store.get_dag_instance(&ins.base.id).await.unwrap();
    row.continue_run(vec![t1.base.id.clone()]).unwrap();
    cluster
        .store
        .patch_dag_ins(&row, &[DagInsField::Cmd])
        .await
        .unwrap();

    wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(10),
    )
    .await;
    let t2 = task_instance(&cluster.store, &ins.base.id, "t2").await.unwrap();
    assert_eq!(t2.status, TaskInstanceStatus::Success);

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn command_with_unknown_targets_is_cleared_without_effect() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let dag = crate::dag(
        "bogus-target",
        vec![crate::sleep_task("t1", &[], 1200)],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    wait_task_status(
        &cluster.store,
        &ins.base.id,
        "t1",
        TaskInstanceStatus::Running,
        Duration::from_secs(10),
    )
    .await;

    let mut row = cluster.store.get_dag_instance(&ins.base.id).await.unwrap();
    row.cancel(vec!["not-a-task-instance".to_string()]).unwrap();
    cluster
        .store
        .patch_dag_ins(&row, &[DagInsField::Cmd])
        .await
        .unwrap();

    // The command is consumed without touching the run.
    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(10),
    )
    .await;
    assert!(done.cmd.is_none());

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}
