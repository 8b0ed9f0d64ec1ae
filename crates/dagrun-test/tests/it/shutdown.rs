use std::time::{Duration, Instant};

use dagrun_core::entity::TaskInstanceStatus;
use dagrun_test::*;

#[tokio::test]
async fn shutdown_is_prompt_when_idle() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    // Give the engine a chance to start up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn shutdown_abandons_a_task_that_ignores_the_grace() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let mut slow = crate::sleep_task("t1", &[], 60_000);
    slow.timeout_secs = 120;
    let dag = crate::dag("stubborn", vec![slow]);
    let ins = submit(&cluster, dag).await.unwrap();

    wait_task_status(
        &cluster.store,
        &ins.base.id,
        "t1",
        TaskInstanceStatus::Running,
        Duration::from_secs(10),
    )
    .await;

    let started = Instant::now();
    worker.shutdown(Duration::from_secs(8)).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(8),
        "shutdown took {:?}",
        started.elapsed()
    );

    // The abandoned row stays Running for the watchdog on the next worker;
    // shutdown does not forge a terminal state for work it did not finish.
    let t1 = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    assert_eq!(t1.status, TaskInstanceStatus::Running);
}
