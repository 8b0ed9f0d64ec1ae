use dagrun_core::store::Store;
use dagrun_core::{Error, ValidationError};
use dagrun_test::*;

#[tokio::test]
async fn cyclic_template_is_rejected_with_nothing_persisted() {
    let cluster = TestCluster::new();

    let mut dag = crate::dag(
        "cycle",
        vec![
            crate::task("a", NOOP, &["b"]),
            crate::task("b", NOOP, &["a"]),
        ],
    );
    let err = cluster.store.create_dag(&mut dag).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::CycleDetected(_))
    ));
    assert!(cluster.store.get_dag(&dag.base.id).await.is_err());
}

#[tokio::test]
async fn unknown_dependency_is_rejected() {
    let cluster = TestCluster::new();

    let mut dag = crate::dag("dangling", vec![crate::task("a", NOOP, &["ghost"])]);
    let err = cluster.store.create_dag(&mut dag).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::UnknownDependency { .. })
    ));
}

#[tokio::test]
async fn duplicate_task_ids_are_rejected() {
    let cluster = TestCluster::new();

    let mut dag = crate::dag(
        "dupes",
        vec![crate::task("a", NOOP, &[]), crate::task("a", NOOP, &[])],
    );
    let err = cluster.store.create_dag(&mut dag).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::DuplicateTaskId(_))
    ));
}

#[tokio::test]
async fn empty_task_list_is_rejected() {
    let cluster = TestCluster::new();

    let mut dag = crate::dag("empty", vec![]);
    let err = cluster.store.create_dag(&mut dag).await.unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::Empty)));
}
