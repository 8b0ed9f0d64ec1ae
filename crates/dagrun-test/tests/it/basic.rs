use std::time::Duration;

use dagrun_core::entity::{DagInstanceStatus, TaskInstanceStatus};
use dagrun_test::*;

#[tokio::test]
async fn linear_chain_runs_to_success() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let dag = crate::dag(
        "linear",
        vec![
            crate::task("t1", NOOP, &[]),
            crate::task("t2", NOOP, &["t1"]),
            crate::task("t3", NOOP, &["t2"]),
        ],
    );
    let template_tasks = dag.tasks.clone();
    let ins = submit(&cluster, dag).await.unwrap();

    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(10),
    )
    .await;
    assert!(done.worker.is_empty(), "terminal instance keeps no owner");

    // Exactly one task instance per template task, dependencies mirrored.
    let tasks = task_instances(&cluster.store, &ins.base.id).await;
    assert_eq!(tasks.len(), template_tasks.len());
    for t in &template_tasks {
        let ti = tasks
            .iter()
            .find(|ti| ti.task_id == t.id)
            .unwrap_or_else(|| panic!("no task instance for `{}`", t.id));
        assert_eq!(ti.depend_on, t.depend_on);
        assert_eq!(ti.status, TaskInstanceStatus::Success);
        assert!(ti.base.created_at <= ti.base.updated_at);
        assert!(
            ti.traces.iter().any(|tr| tr.message.contains("noop ran")),
            "persist-after-action traces should have been flushed"
        );
    }

    let t1 = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    let t2 = task_instance(&cluster.store, &ins.base.id, "t2").await.unwrap();
    let t3 = task_instance(&cluster.store, &ins.base.id, "t3").await.unwrap();
    assert!(t1.base.updated_at <= t2.base.updated_at);
    assert!(t2.base.updated_at <= t3.base.updated_at);

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn diamond_join_runs_after_both_branches() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    // Sleeps cross second boundaries so the unix-second timestamps order
    // strictly.
    let dag = crate::dag(
        "diamond",
        vec![
            crate::task("t1", NOOP, &[]),
            crate::sleep_task("t2", &["t1"], 1100),
            crate::sleep_task("t3", &["t1"], 2100),
            crate::sleep_task("t4", &["t2", "t3"], 1100),
        ],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(20),
    )
    .await;

    let t2 = task_instance(&cluster.store, &ins.base.id, "t2").await.unwrap();
    let t3 = task_instance(&cluster.store, &ins.base.id, "t3").await.unwrap();
    let t4 = task_instance(&cluster.store, &ins.base.id, "t4").await.unwrap();
    assert!(t2.base.updated_at < t4.base.updated_at);
    assert!(t3.base.updated_at < t4.base.updated_at);

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn share_data_flows_between_tasks() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let dag = crate::dag(
        "share",
        vec![
            crate::task_with_params(
                "producer",
                SHARE_SET,
                &[],
                serde_json::json!({ "key": "color", "value": "green" }),
            ),
            crate::task_with_params(
                "consumer",
                SHARE_ECHO,
                &["producer"],
                serde_json::json!({ "key": "color" }),
            ),
        ],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    let done = wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(10),
    )
    .await;
    assert_eq!(done.share_data.get("color"), Some("green"));

    let consumer = task_instance(&cluster.store, &ins.base.id, "consumer")
        .await
        .unwrap();
    assert!(consumer
        .traces
        .iter()
        .any(|tr| tr.message.contains("color=green")));

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn params_are_rendered_from_instance_vars() {
    let cluster = TestCluster::new();
    let worker = cluster.spawn_worker("w1");

    let dag = crate::dag_with_var(
        "templated",
        ("region", "eu-west-1"),
        vec![crate::task_with_params(
            "t1",
            NOOP,
            &[],
            serde_json::json!({ "note": "deploying to {{region}}" }),
        )],
    );
    let ins = submit(&cluster, dag).await.unwrap();

    wait_instance_status(
        &cluster.store,
        &ins.base.id,
        DagInstanceStatus::Success,
        Duration::from_secs(10),
    )
    .await;

    let ti = task_instance(&cluster.store, &ins.base.id, "t1").await.unwrap();
    assert_eq!(ti.params["note"], "deploying to eu-west-1");

    worker.shutdown(Duration::from_secs(5)).await.unwrap();
}
