use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use dagrun_core::entity::{DagInstance, DagInstanceStatus, TaskInstance};
use dagrun_core::event::EventBus;
use dagrun_core::keeper::Keeper;
use dagrun_core::store::Store;
use dagrun_core::Result;
use futures_concurrency::future::Join;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::flag::ShutdownFlag;
use crate::parser::Router;
use crate::{executor, metric, parser, watchdog, Config};

/// State shared by every engine loop.
pub(crate) struct SharedState {
    pub shutdown: ShutdownFlag,
    pub store: Arc<dyn Store>,
    pub keeper: Arc<dyn Keeper>,
    pub bus: EventBus,
    pub config: Config,
    pub exec_tx: mpsc::UnboundedSender<TaskInstance>,

    /// Cancellation tokens of task instances currently executing here,
    /// keyed by task instance id.
    running: Mutex<HashMap<String, CancellationToken>>,
    /// Per-instance locks serializing share-data access inside this worker.
    share_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SharedState {
    pub fn worker_key(&self) -> &str {
        self.keeper.worker_key()
    }

    pub fn register_running(&self, task_ins_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.running
            .lock()
            .insert(task_ins_id.to_string(), token.clone());
        token
    }

    pub fn deregister_running(&self, task_ins_id: &str) {
        self.running.lock().remove(task_ins_id);
    }

    /// Cancels a task executing on this worker. Returns `false` when the
    /// task is not actually running here (the caller finalizes the row
    /// itself in that case).
    pub fn cancel_running(&self, task_ins_id: &str) -> bool {
        match self.running.lock().get(task_ins_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all_running(&self) {
        for token in self.running.lock().values() {
            token.cancel();
        }
    }

    pub fn share_lock(&self, dag_ins_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.share_locks
            .lock()
            .entry(dag_ins_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops per-instance state once the instance reached a terminal status
    /// or left this worker.
    pub fn release_instance(&self, dag_ins_id: &str) {
        self.share_locks.lock().remove(dag_ins_id);
    }

    /// Moves an instance to `Failed` with a reason and releases ownership.
    pub async fn fail_instance(&self, ins: &mut DagInstance, reason: String) -> Result<()> {
        tracing::warn!(dag_ins = %ins.base.id, "failing dag instance: {reason}");
        ins.status = DagInstanceStatus::Failed;
        ins.reason = reason;
        ins.worker.clear();
        self.store.update_dag_ins(ins).await?;
        self.release_instance(&ins.base.id);
        metric::instance_transition(DagInstanceStatus::Failed);
        Ok(())
    }
}

pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    keeper: Option<Arc<dyn Keeper>>,
    bus: Option<EventBus>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            store: None,
            keeper: None,
            bus: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn keeper(mut self, keeper: Arc<dyn Keeper>) -> Self {
        self.keeper = Some(keeper);
        self
    }

    /// The bus the store publishes on. Must be the same instance, otherwise
    /// the engine only ever wakes from its periodic sweep.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> anyhow::Result<Engine> {
        let store = self.store.context("an engine needs a store")?;
        let keeper = self.keeper.context("an engine needs a keeper")?;
        let bus = self
            .bus
            .context("an engine needs the event bus its store publishes on")?;

        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        Ok(Engine {
            shared: Arc::new(SharedState {
                shutdown: ShutdownFlag::new(),
                store,
                keeper,
                bus,
                config: self.config,
                exec_tx,
                running: Mutex::new(HashMap::new()),
                share_locks: Mutex::new(HashMap::new()),
            }),
            exec_rx: Some(exec_rx),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Engine {
    shared: Arc<SharedState>,
    exec_rx: Option<mpsc::UnboundedReceiver<TaskInstance>>,
}

pub struct EngineHandle {
    shared: Arc<SharedState>,
}

impl EngineHandle {
    pub fn shutdown(&self) {
        self.shared.shutdown.raise();
    }
}

impl Engine {
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs every engine loop until shutdown: the parser pump and workers,
    /// the executor pool and the watchdog. They share one shutdown flag, so
    /// one loop dying takes the whole engine down instead of leaving a
    /// half-alive worker.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let exec_rx = self.exec_rx.take().context("an engine can only run once")?;
        self.shared.shutdown.reset();
        tracing::info!(worker = %self.shared.worker_key(), "dagrun engine starting");

        let (router, receivers) = Router::new(self.shared.config.parser_workers_cnt);
        let router = Arc::new(router);

        let pump = parser::pump(self.shared.clone(), router.clone());
        let workers = futures_util::future::try_join_all(
            receivers
                .into_iter()
                .map(|rx| parser::worker_loop(self.shared.clone(), rx)),
        );
        let pool = executor::run(self.shared.clone(), exec_rx);
        let watchdog = watchdog::run(self.shared.clone());

        let (pump, workers, pool, watchdog) = (pump, workers, pool, watchdog).join().await;
        pump?;
        workers?;
        pool?;
        watchdog?;

        tracing::info!(worker = %self.shared.worker_key(), "dagrun engine stopped");
        Ok(())
    }
}
