//! Turns dag instances into materialized task instances and keeps them
//! moving.
//!
//! One pump loop per engine watches the event bus and runs the periodic
//! sweep; actual work is routed to `parser_workers_cnt` worker loops by
//! hashing the instance id, so everything that happens to one instance
//! happens on one worker, in order.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dagrun_core::entity::{DagInstance, DagInstanceStatus, TaskInstance, TaskInstanceStatus};
use dagrun_core::event::Event;
use dagrun_core::graph::TaskGraph;
use dagrun_core::store::{ListDagInstanceInput, ListTaskInstanceInput, TaskInsField};
use dagrun_core::{template, Error, Result, ValidationError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::engine::SharedState;
use crate::flag::ShutdownGuard;
use crate::{dispatcher, metric, registry};

pub(crate) const CLAIM_MUTEX: &str = "dagrun:parser-claim";

pub(crate) struct Router {
    queues: Vec<mpsc::UnboundedSender<String>>,
}

impl Router {
    pub fn new(workers: usize) -> (Self, Vec<mpsc::UnboundedReceiver<String>>) {
        let workers = workers.max(1);
        let mut queues = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            receivers.push(rx);
        }
        (Self { queues }, receivers)
    }

    pub fn route(&self, ins_id: &str) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        ins_id.hash(&mut hasher);
        let idx = (hasher.finish() % self.queues.len() as u64) as usize;
        // A closed queue means we are shutting down; dropping the wake-up is
        // fine, nothing will read it.
        let _ = self.queues[idx].send(ins_id.to_string());
    }
}

/// Event pump: wake sources are bus events for this worker, the periodic
/// sweep and startup (the first sweep fires immediately).
pub(crate) async fn pump(shared: Arc<SharedState>, router: Arc<Router>) -> anyhow::Result<()> {
    let _guard = ShutdownGuard::new(&shared.shutdown);
    let mut shutdown = std::pin::pin!(shared.shutdown.wait());

    let mut events = shared.bus.subscribe();
    let mut next = Instant::now();

    'outer: loop {
        tokio::select! {
            biased;

            _ = shutdown.as_mut() => break 'outer,
            _ = tokio::time::sleep_until(next) => {
                match sweep(&shared, &router).await {
                    Ok(()) => {}
                    Err(Error::KeeperDown) => {
                        tracing::debug!("sweep paused: keeper is down");
                    }
                    Err(e) => tracing::warn!("parser sweep failed: {e:#}"),
                }
                next = Instant::now() + shared.config.instance_refresh_interval;
            }
            event = events.recv() => match event {
                Ok(Event::DagInstanceUpdated(ev)) if ev.worker == shared.worker_key() => {
                    router.route(&ev.id);
                }
                Ok(Event::DagInstancePatched(ev)) if ev.worker == shared.worker_key() => {
                    router.route(&ev.id);
                }
                Ok(Event::TaskInstanceUpdated(ev)) => router.route(&ev.dag_ins_id),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    // We do not know what we missed; sweep everything.
                    tracing::warn!("event bus lagged by {missed} events, forcing a sweep");
                    next = Instant::now();
                }
                Err(RecvError::Closed) => break 'outer,
            },
        }
    }

    Ok(())
}

/// Lists everything this worker owns and claims a batch of unowned work.
/// Fails with [`Error::KeeperDown`] while heartbeats are not getting
/// through; the engine neither claims nor dispatches until they do.
async fn sweep(shared: &Arc<SharedState>, router: &Router) -> Result<()> {
    if !shared.keeper.is_connected() {
        return Err(Error::KeeperDown);
    }

    let owned = shared
        .store
        .list_dag_instance(&ListDagInstanceInput {
            worker: Some(shared.worker_key().to_string()),
            status: vec![
                DagInstanceStatus::Init,
                DagInstanceStatus::Scheduled,
                DagInstanceStatus::Running,
                DagInstanceStatus::Blocked,
            ],
            ..Default::default()
        })
        .await?;
    for ins in &owned {
        router.route(&ins.base.id);
    }

    // Owned instances carrying a command in a status the filter above does
    // not cover (a failed instance waiting on Retry).
    let commanded = shared
        .store
        .list_dag_instance(&ListDagInstanceInput {
            worker: Some(shared.worker_key().to_string()),
            has_cmd: Some(true),
            ..Default::default()
        })
        .await?;
    for ins in &commanded {
        router.route(&ins.base.id);
    }

    claim(shared, router).await
}

/// The claim pass: under the cluster-wide parser mutex, CAS-claim up to
/// `claim_batch_size` unowned instances for this worker.
async fn claim(shared: &Arc<SharedState>, router: &Router) -> Result<()> {
    let mutex = shared.keeper.new_mutex(CLAIM_MUTEX);
    match mutex.lock(shared.config.read_timeout).await {
        Ok(()) => {}
        // Another worker is mid-claim; our turn comes on a later sweep.
        Err(Error::Timeout(_)) => return Ok(()),
        Err(e) => return Err(e),
    }

    let result = claim_locked(shared, router).await;
    if let Err(e) = mutex.unlock().await {
        tracing::warn!("failed to release the parser claim mutex: {e:#}");
    }
    result
}

async fn claim_locked(shared: &Arc<SharedState>, router: &Router) -> Result<()> {
    let mut candidates = shared
        .store
        .list_dag_instance(&ListDagInstanceInput {
            worker: Some(String::new()),
            status: vec![DagInstanceStatus::Init, DagInstanceStatus::Scheduled],
            limit: Some(shared.config.claim_batch_size),
            ..Default::default()
        })
        .await?;

    // Unowned instances waiting on a command also need a serving worker.
    let commanded = shared
        .store
        .list_dag_instance(&ListDagInstanceInput {
            worker: Some(String::new()),
            has_cmd: Some(true),
            limit: Some(shared.config.claim_batch_size),
            ..Default::default()
        })
        .await?;
    let seen: HashSet<String> = candidates.iter().map(|ins| ins.base.id.clone()).collect();
    candidates.extend(
        commanded
            .into_iter()
            .filter(|ins| !seen.contains(&ins.base.id)),
    );

    let mut claimed = 0usize;
    for ins in candidates.iter().take(shared.config.claim_batch_size) {
        if shared
            .store
            .claim_dag_ins(&ins.base.id, shared.worker_key())
            .await?
        {
            claimed += 1;
            router.route(&ins.base.id);
        }
    }

    if claimed > 0 {
        tracing::debug!("claimed {claimed} dag instances");
        metrics::counter!(metric::PARSER_CLAIMS).increment(claimed as u64);
    }
    Ok(())
}

/// One parser worker: drains its queue, handling each instance end to end.
pub(crate) async fn worker_loop(
    shared: Arc<SharedState>,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> anyhow::Result<()> {
    let _guard = ShutdownGuard::new(&shared.shutdown);
    let mut shutdown = std::pin::pin!(shared.shutdown.wait());

    loop {
        let ins_id = tokio::select! {
            biased;

            _ = shutdown.as_mut() => break,
            item = rx.recv() => match item {
                Some(id) => id,
                None => break,
            },
        };

        match handle_instance(&shared, &ins_id).await {
            Ok(()) => {}
            Err(Error::KeeperDown) => {
                tracing::debug!(dag_ins = %ins_id, "dispatch paused: keeper is down");
            }
            Err(e) => {
                tracing::warn!(dag_ins = %ins_id, "failed to handle dag instance: {e:#}");
            }
        }
    }

    Ok(())
}

async fn handle_instance(shared: &Arc<SharedState>, ins_id: &str) -> Result<()> {
    // Dispatch pauses while the keeper is down; the sweep re-routes
    // everything this worker owns once heartbeats get through again.
    if !shared.keeper.is_connected() {
        return Err(Error::KeeperDown);
    }

    let mut ins = match shared.store.get_dag_instance(ins_id).await {
        Ok(ins) => ins,
        // Deleted underneath us (garbage collection); nothing to do.
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if ins.worker != shared.worker_key() {
        return Ok(());
    }

    match ins.status {
        DagInstanceStatus::Init | DagInstanceStatus::Scheduled => {
            materialize(shared, &mut ins).await?;
            if ins.status == DagInstanceStatus::Running {
                dispatcher::dispatch(shared, &mut ins).await?;
            }
            Ok(())
        }
        DagInstanceStatus::Running | DagInstanceStatus::Blocked => {
            dispatcher::dispatch(shared, &mut ins).await
        }
        // A failed instance is only interesting again once a Retry command
        // is attached.
        DagInstanceStatus::Failed if ins.cmd.is_some() => {
            dispatcher::dispatch(shared, &mut ins).await
        }
        DagInstanceStatus::Failed | DagInstanceStatus::Success => Ok(()),
    }
}

/// Validates the claimed instance against its template and creates one task
/// instance per template task.
///
/// Recovery path: an instance that already has task instances (a previous
/// owner crashed mid-run) only gets the missing rows created; existing state
/// is handed to the dispatcher untouched.
async fn materialize(shared: &Arc<SharedState>, ins: &mut DagInstance) -> Result<()> {
    let dag = match shared.store.get_dag(&ins.dag_id).await {
        Ok(dag) => dag,
        Err(e) if e.is_not_found() => {
            return shared
                .fail_instance(ins, format!("dag template `{}` is gone", ins.dag_id))
                .await;
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = TaskGraph::build(&dag.tasks) {
        return shared
            .fail_instance(ins, format!("dag template `{}` is invalid: {e}", dag.base.id))
            .await;
    }
    for task in &dag.tasks {
        if !registry::has_action(&task.action_name) {
            let e = ValidationError::UnknownAction(task.action_name.clone());
            return shared
                .fail_instance(ins, format!("task `{}`: {e}", task.id))
                .await;
        }
    }

    let mut existing = shared
        .store
        .list_task_instance(&ListTaskInstanceInput {
            dag_ins_id: Some(ins.base.id.clone()),
            ..Default::default()
        })
        .await?;

    // Claims only succeed on rows whose worker field was cleared, so any
    // in-flight task found here was abandoned by a dead owner. Finalize it;
    // a Retry command can rerun it under the at-least-once contract.
    for ti in existing.iter_mut().filter(|ti| ti.status.is_in_flight()) {
        ti.status = TaskInstanceStatus::Failed;
        ti.reason = "WorkerLost".to_string();
        ti.append_trace("worker lost while the task was in flight");
        shared
            .store
            .patch_task_ins(
                ti,
                &[TaskInsField::Status, TaskInsField::Reason, TaskInsField::Traces],
            )
            .await?;
        metric::task_outcome(TaskInstanceStatus::Failed);
    }

    let have: HashSet<&str> = existing.iter().map(|ti| ti.task_id.as_str()).collect();

    let vars = template::resolve_vars(&dag, ins);
    let mut fresh: Vec<TaskInstance> =
        Vec::with_capacity(dag.tasks.len().saturating_sub(have.len()));
    for task in dag.tasks.iter().filter(|t| !have.contains(t.id.as_str())) {
        let mut unresolved = Vec::new();
        let params = template::render_params(&task.params, &vars, &mut unresolved);
        let mut ti = TaskInstance::from_task(&ins.base.id, task, params);
        for name in unresolved {
            ti.append_trace(format!("variable `{name}` is not defined, rendered empty"));
        }
        fresh.push(ti);
    }
    if !fresh.is_empty() {
        shared.store.batch_creat_task_ins(&mut fresh).await?;
    }

    ins.status = DagInstanceStatus::Running;
    shared.store.update_dag_ins(ins).await?;
    metric::instance_transition(DagInstanceStatus::Running);
    Ok(())
}
