use std::time::{Duration, Instant};

use dagrun_core::entity::{DagInstanceStatus, TaskInstanceStatus};
use dagrun_core::store::Store;
use dagrun_test::*;

#[tokio::test]
async fn instance_claimed_by_a_dead_worker_is_reclaimed_and_completed() {
    let cluster = TestCluster::new();

    let dag = crate::dag(
        "failover",
        vec![
            crate::task("t1", NOOP, &[]),
            crate::task("t2", NOOP, &["t1"]),
        ],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    // A worker claims the instance and dies before doing anything with it,
    // heartbeat left to expire.
    let ghost = cluster.dead_worker("ghost");
    assert!(cluster.store.claim_dag_ins(&ins.base.id, "ghost").await.unwrap());
    ghost.stop_heartbeat();

    let started = Instant::now();
    let survivor = cluster.spawn_worker("survivor");

    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(10),
    )
    .await;
    assert!(done.worker.is_empty());
    assert!(
        started.elapsed() < HEARTBEAT_TTL * 2 + Duration::from_secs(3),
        "reclaim took {:?}",
        started.elapsed()
    );

    for ti in task_instances(&cluster.store, &ins.base.id).await {
        assert_eq!(ti.status, TaskInstanceStatus::Success);
    }

    survivor.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn task_abandoned_mid_run_is_failed_as_worker_lost() {
    let cluster = TestCluster::new();

    let mut slow = crate::sleep_task("t1", &[], 120_000);
    slow.timeout_secs = 1;
    let dag = crate::dag("abandoned", vec![slow]);
    let ins = submit(&cluster, dag).await.unwrap();

    let victim = cluster.spawn_worker("victim");
    wait_task_status(
        &cluster.store,
        &ins.base.id,
        "t1",
        TaskInstanceStatus::Running,
        Duration::from_secs(10),
    )
    .await;
    victim.kill();

    let survivor = cluster.spawn_worker("survivor");

    // The watchdog reclaims the instance; on re-claim the new owner adopts
    // the orphaned running row and finalizes it as WorkerLost.
    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Failed,
        Duration::from_secs(30),
    )
    .await;
    assert!(
        done.reason.contains("WorkerLost"),
        "reason was: {}",
        done.reason
    );

    let t1 = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    assert_eq!(t1.status, TaskInstanceStatus::Failed);
    assert_eq!(t1.reason, "WorkerLost");

    survivor.shutdown(Duration::from_secs(5)).await.unwrap();
}
