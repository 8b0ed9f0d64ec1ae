//! Reassigns abandoned work and collects finished state.
//!
//! Runs on a fixed interval guarded by a named distributed mutex, so across
//! the whole cluster only one worker acts per pass. The mutex is held for
//! the duration of one pass and never across action execution.

use std::time::Duration;

use dagrun_core::entity::{now_secs, DagInstanceStatus, TaskInstanceStatus};
use dagrun_core::event::{DagInstanceUpdated, Event};
use dagrun_core::store::{
    DagInsField, ListDagInstanceInput, ListTaskInstanceInput, TaskInsField,
};
use dagrun_core::{Error, Result};
use tokio::time::Instant;

use crate::engine::SharedState;
use crate::flag::ShutdownGuard;
use crate::metric;

pub(crate) const WATCHDOG_MUTEX: &str = "dagrun:watchdog";

/// How long a Running instance whose tasks are all terminal may sit before
/// the watchdog re-raises it to the dispatcher.
const ENDED_STALE_SECS: i64 = 5;

pub(crate) async fn run(shared: std::sync::Arc<SharedState>) -> anyhow::Result<()> {
    let _guard = ShutdownGuard::new(&shared.shutdown);
    let mut shutdown = std::pin::pin!(shared.shutdown.wait());
    let mut next = Instant::now();

    'outer: loop {
        tokio::select! {
            biased;

            _ = shutdown.as_mut() => break 'outer,
            _ = tokio::time::sleep_until(next) => (),
        }
        next = Instant::now() + shared.config.watchdog_interval;

        // Do not take the cluster-wide mutex while our own heartbeats are
        // failing; a partitioned worker holding it would stall its peers.
        if !shared.keeper.is_connected() {
            tracing::debug!("watchdog paused: keeper is down");
            continue;
        }

        let mutex = shared.keeper.new_mutex(WATCHDOG_MUTEX);
        match mutex.lock(shared.config.read_timeout).await {
            Ok(()) => {}
            // Another worker holds the pass; skip this round.
            Err(Error::Timeout(_)) => continue,
            Err(e) => {
                tracing::warn!("watchdog could not take its mutex: {e:#}");
                continue;
            }
        }

        let result = pass(&shared).await;
        if let Err(e) = mutex.unlock().await {
            tracing::warn!("failed to release the watchdog mutex: {e:#}");
        }
        match result {
            Ok(()) => {}
            // The keeper went down mid-pass; liveness answers are not
            // trustworthy, so nothing was reclaimed.
            Err(Error::KeeperDown) => {
                tracing::debug!("watchdog pass aborted: keeper went down");
            }
            Err(e) => tracing::warn!("watchdog pass failed: {e:#}"),
        }
    }

    Ok(())
}

async fn pass(shared: &SharedState) -> Result<()> {
    let alive = shared.keeper.alive_workers().await?;
    metrics::gauge!(metric::ALIVE_WORKERS).set(alive.len() as f64);

    reclaim_lost(shared, &alive).await?;
    reraise_ended(shared).await?;
    fail_abandoned_tasks(shared).await?;
    collect_finished(shared).await?;
    Ok(())
}

/// Instances whose owner disappeared go back to `Scheduled` without an
/// owner; the parsers' claim pass picks them up.
async fn reclaim_lost(shared: &SharedState, alive: &[String]) -> Result<()> {
    let suspects = shared
        .store
        .list_dag_instance(&ListDagInstanceInput {
            status: vec![
                DagInstanceStatus::Scheduled,
                DagInstanceStatus::Running,
                DagInstanceStatus::Blocked,
            ],
            ..Default::default()
        })
        .await?;

    for mut ins in suspects {
        if ins.worker.is_empty() || alive.iter().any(|w| w == &ins.worker) {
            continue;
        }
        tracing::info!(
            dag_ins = %ins.base.id,
            worker = %ins.worker,
            "reclaiming instance from a dead worker"
        );
        ins.worker.clear();
        ins.status = DagInstanceStatus::Scheduled;
        shared
            .store
            .patch_dag_ins(&ins, &[DagInsField::Worker, DagInsField::Status])
            .await?;
        metrics::counter!(metric::WATCHDOG_RECLAIMS).increment(1);
    }
    Ok(())
}

/// A Running instance whose task instances are all terminal but that has not
/// been updated for a while lost its wake-up; force a re-evaluation.
async fn reraise_ended(shared: &SharedState) -> Result<()> {
    let running = shared
        .store
        .list_dag_instance(&ListDagInstanceInput {
            status: vec![DagInstanceStatus::Running],
            updated_end: Some(now_secs() - ENDED_STALE_SECS),
            ..Default::default()
        })
        .await?;

    for ins in running {
        let tasks = shared
            .store
            .list_task_instance(&ListTaskInstanceInput {
                dag_ins_id: Some(ins.base.id.clone()),
                ..Default::default()
            })
            .await?;
        if tasks.is_empty() || !tasks.iter().all(|ti| ti.status.is_terminal()) {
            continue;
        }
        shared.bus.publish(Event::DagInstanceUpdated(DagInstanceUpdated {
            id: ins.base.id.clone(),
            worker: ins.worker.clone(),
            status: ins.status,
        }));
    }
    Ok(())
}

/// Running task rows stale past their whole budget whose owner is gone are
/// failed with `WorkerLost`; a live owner is left to finalize its own work.
async fn fail_abandoned_tasks(shared: &SharedState) -> Result<()> {
    let stale = shared
        .store
        .list_task_instance(&ListTaskInstanceInput {
            status: vec![TaskInstanceStatus::Running, TaskInstanceStatus::Ending],
            expired: true,
            ..Default::default()
        })
        .await?;
    let now = now_secs();

    for mut ti in stale {
        let budget = Duration::from_secs(ti.timeout_secs)
            .max(shared.config.executor_timeout)
            + shared.config.stale_grace;
        if ti.base.updated_at > now - budget.as_secs() as i64 {
            continue;
        }

        let owner_alive = match shared.store.get_dag_instance(&ti.dag_ins_id).await {
            Ok(ins) if !ins.worker.is_empty() => shared.keeper.is_alive(&ins.worker).await?,
            Ok(_) => false,
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        if owner_alive {
            continue;
        }

        tracing::info!(task_ins = %ti.base.id, "failing task abandoned by a lost worker");
        ti.status = TaskInstanceStatus::Failed;
        ti.reason = "WorkerLost".to_string();
        ti.append_trace("worker lost while the task was running");
        shared
            .store
            .patch_task_ins(
                &ti,
                &[TaskInsField::Status, TaskInsField::Reason, TaskInsField::Traces],
            )
            .await?;
        metric::task_outcome(TaskInstanceStatus::Failed);
    }
    Ok(())
}

/// Deletes terminal instances older than the retention window, together with
/// their task instances.
async fn collect_finished(shared: &SharedState) -> Result<()> {
    let Some(retention) = shared.config.finished_retention else {
        return Ok(());
    };

    let finished = shared
        .store
        .list_dag_instance(&ListDagInstanceInput {
            status: vec![DagInstanceStatus::Success, DagInstanceStatus::Failed],
            updated_end: Some(now_secs() - retention.as_secs() as i64),
            ..Default::default()
        })
        .await?;
    if finished.is_empty() {
        return Ok(());
    }

    let mut task_ids = Vec::new();
    let mut ins_ids = Vec::with_capacity(finished.len());
    for ins in &finished {
        let tasks = shared
            .store
            .list_task_instance(&ListTaskInstanceInput {
                dag_ins_id: Some(ins.base.id.clone()),
                ..Default::default()
            })
            .await?;
        task_ids.extend(tasks.into_iter().map(|ti| ti.base.id));
        ins_ids.push(ins.base.id.clone());
    }

    shared.store.batch_delete_task_ins(&task_ids).await?;
    shared.store.batch_delete_dag_ins(&ins_ids).await?;
    tracing::info!(
        "collected {} finished dag instances ({} task instances)",
        ins_ids.len(),
        task_ids.len()
    );
    Ok(())
}
