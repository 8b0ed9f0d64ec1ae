//! Shared harness for the integration tests.
//!
//! A [`TestCluster`] is one in-process "deployment": a shared event bus,
//! mem store and mem cluster. Spawning a worker gives back a guard that can
//! shut the engine down gracefully or kill it the way a crash would.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dagrun_core::action::{Action, ExecuteContext, TraceOp, Typed, TypedAction};
use dagrun_core::entity::{Dag, DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus};
use dagrun_core::event::EventBus;
use dagrun_core::store::{ListTaskInstanceInput, Store};
use dagrun_mem::{MemCluster, MemKeeper, MemStore};
use dagrun_runtime::{Config, EngineBuilder, EngineHandle};
use serde::Deserialize;

#[ctor::ctor]
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer().without_time())
        .try_init();
}

/// Tight intervals so scenarios finish in seconds rather than minutes.
pub fn test_config() -> Config {
    Config {
        parser_workers_cnt: 4,
        executor_worker_cnt: 8,
        executor_timeout: Duration::from_secs(10),
        stage_budget: Duration::from_secs(5),
        read_timeout: Duration::from_secs(2),
        instance_refresh_interval: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(100),
        claim_batch_size: 32,
        watchdog_interval: Duration::from_millis(250),
        stale_grace: Duration::from_millis(500),
        shutdown_grace: Duration::from_secs(2),
        finished_retention: None,
    }
}

/// Liveness TTL used by the test clusters; worker-loss scenarios are sized
/// against it.
pub const HEARTBEAT_TTL: Duration = Duration::from_millis(500);

pub struct TestCluster {
    pub cluster: Arc<MemCluster>,
    pub bus: EventBus,
    pub store: Arc<MemStore>,
}

impl TestCluster {
    pub fn new() -> Self {
        register_test_actions();
        let bus = EventBus::default();
        Self {
            cluster: MemCluster::new(HEARTBEAT_TTL),
            store: Arc::new(MemStore::new(bus.clone())),
            bus,
        }
    }

    pub fn spawn_worker(&self, key: &str) -> WorkerGuard {
        let keeper = MemKeeper::start(
            self.cluster.clone(),
            key,
            test_config().heartbeat_interval,
        );
        let mut engine = EngineBuilder::new()
            .config(test_config())
            .store(self.store.clone())
            .keeper(keeper.clone())
            .bus(self.bus.clone())
            .build()
            .expect("engine builds with a complete test cluster");
        let handle = engine.handle();
        let join = tokio::spawn(async move { engine.run().await });

        WorkerGuard {
            handle,
            keeper,
            join,
        }
    }

    /// Registers a worker in the cluster that claims nothing and then dies
    /// without cleanup, leaving its claims for the watchdog.
    pub fn dead_worker(&self, key: &str) -> Arc<MemKeeper> {
        let keeper = MemKeeper::start(
            self.cluster.clone(),
            key,
            test_config().heartbeat_interval,
        );
        keeper
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WorkerGuard {
    pub handle: EngineHandle,
    pub keeper: Arc<MemKeeper>,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl WorkerGuard {
    /// Graceful shutdown; fails the test if the engine does not stop in
    /// `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> anyhow::Result<()> {
        self.handle.shutdown();
        let result = tokio::time::timeout(timeout, self.join)
            .await
            .context("engine did not shut down within the deadline")?;
        self.keeper.close();
        result.context("engine task panicked")?
    }

    /// Simulates a crash: the engine future is dropped mid-flight and the
    /// keeper stops heartbeating without deregistering.
    pub fn kill(self) {
        self.join.abort();
        self.keeper.stop_heartbeat();
    }
}

/// Creates the template and submits one manual instance of it.
pub async fn submit(cluster: &TestCluster, mut dag: Dag) -> anyhow::Result<DagInstance> {
    cluster.store.create_dag(&mut dag).await?;
    let mut ins = dag.run(dagrun_core::entity::Trigger::Manual, None)?;
    cluster.store.create_dag_ins(&mut ins).await?;
    Ok(ins)
}

pub async fn wait_instance_status(
    store: &MemStore,
    ins_id: &str,
    status: DagInstanceStatus,
    timeout: Duration,
) -> DagInstance {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(ins) = store.get_dag_instance(ins_id).await {
            if ins.status == status {
                return ins;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "dag instance `{ins_id}` never reached {status:?}; stuck at {:?} ({})",
                    ins.status, ins.reason
                );
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("dag instance `{ins_id}` never reached {status:?}; row is gone");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_task_status(
    store: &MemStore,
    dag_ins_id: &str,
    task_id: &str,
    status: TaskInstanceStatus,
    timeout: Duration,
) -> TaskInstance {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let ti = task_instance(store, dag_ins_id, task_id).await;
        match ti {
            Some(ti) if ti.status == status => return ti,
            other => {
                if tokio::time::Instant::now() >= deadline {
                    panic!(
                        "task `{task_id}` of `{dag_ins_id}` never reached {status:?}; at {:?}",
                        other.map(|ti| ti.status)
                    );
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn task_instances(store: &MemStore, dag_ins_id: &str) -> Vec<TaskInstance> {
    store
        .list_task_instance(&ListTaskInstanceInput {
            dag_ins_id: Some(dag_ins_id.to_string()),
            ..Default::default()
        })
        .await
        .expect("listing task instances of a test store")
}

pub async fn task_instance(
    store: &MemStore,
    dag_ins_id: &str,
    task_id: &str,
) -> Option<TaskInstance> {
    task_instances(store, dag_ins_id)
        .await
        .into_iter()
        .find(|ti| ti.task_id == task_id)
}

// ---------------------------------------------------------------------------
// Test actions
// ---------------------------------------------------------------------------

pub const NOOP: &str = "noop";
pub const SLEEP: &str = "sleep";
pub const FAIL: &str = "fail";
pub const FLAKY: &str = "flaky";
pub const SHARE_SET: &str = "share-set";
pub const SHARE_ECHO: &str = "share-echo";

static REGISTER: std::sync::Once = std::sync::Once::new();

/// Registers every test action exactly once per test binary; the registry is
/// process-wide.
pub fn register_test_actions() {
    REGISTER.call_once(|| {
        let actions: Vec<Arc<dyn Action>> = vec![
            Arc::new(NoopAction),
            Arc::new(Typed(SleepAction)),
            Arc::new(FailAction),
            Arc::new(FlakyAction::default()),
            Arc::new(Typed(ShareSetAction)),
            Arc::new(Typed(ShareEchoAction)),
        ];
        dagrun_runtime::register_actions(actions);
    });
}

struct NoopAction;

#[async_trait]
impl Action for NoopAction {
    fn name(&self) -> &str {
        NOOP
    }

    async fn run(&self, ctx: &dyn ExecuteContext, _params: &serde_json::Value) -> anyhow::Result<()> {
        ctx.trace_with("noop ran", TraceOp::PersistAfterAction);
        Ok(())
    }
}

#[derive(Deserialize)]
struct SleepParams {
    millis: u64,
}

struct SleepAction;

#[async_trait]
impl TypedAction for SleepAction {
    type Params = SleepParams;

    fn name(&self) -> &str {
        SLEEP
    }

    async fn run(&self, ctx: &dyn ExecuteContext, params: &SleepParams) -> anyhow::Result<()> {
        ctx.trace(&format!("sleeping for {}ms", params.millis));
        tokio::time::sleep(Duration::from_millis(params.millis)).await;
        Ok(())
    }
}

struct FailAction;

#[async_trait]
impl Action for FailAction {
    fn name(&self) -> &str {
        FAIL
    }

    async fn run(&self, _ctx: &dyn ExecuteContext, _params: &serde_json::Value) -> anyhow::Result<()> {
        anyhow::bail!("boom")
    }
}

/// Fails the first attempt of every task instance and succeeds afterwards,
/// for retry scenarios.
#[derive(Default)]
struct FlakyAction {
    seen: parking_lot::Mutex<HashSet<String>>,
}

#[async_trait]
impl Action for FlakyAction {
    fn name(&self) -> &str {
        FLAKY
    }

    async fn run(&self, ctx: &dyn ExecuteContext, _params: &serde_json::Value) -> anyhow::Result<()> {
        let first = self.seen.lock().insert(ctx.task().base.id.clone());
        if first {
            anyhow::bail!("first attempt always fails")
        }
        ctx.trace_with("second attempt succeeded", TraceOp::PersistAfterAction);
        Ok(())
    }
}

#[derive(Deserialize)]
struct ShareSetParams {
    key: String,
    value: String,
}

struct ShareSetAction;

#[async_trait]
impl TypedAction for ShareSetAction {
    type Params = ShareSetParams;

    fn name(&self) -> &str {
        SHARE_SET
    }

    async fn run(&self, ctx: &dyn ExecuteContext, params: &ShareSetParams) -> anyhow::Result<()> {
        ctx.share_set(&params.key, &params.value).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ShareEchoParams {
    key: String,
}

struct ShareEchoAction;

#[async_trait]
impl TypedAction for ShareEchoAction {
    type Params = ShareEchoParams;

    fn name(&self) -> &str {
        SHARE_ECHO
    }

    async fn run(&self, ctx: &dyn ExecuteContext, params: &ShareEchoParams) -> anyhow::Result<()> {
        match ctx.share_get(&params.key).await? {
            Some(value) => {
                ctx.trace_with(&format!("{}={value}", params.key), TraceOp::PersistAfterAction);
                Ok(())
            }
            None => anyhow::bail!("share data has no `{}`", params.key),
        }
    }
}
