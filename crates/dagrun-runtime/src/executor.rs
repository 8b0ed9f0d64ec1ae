//! Bounded-concurrency task runner.
//!
//! One loop pulls task instances off the dispatch queue and spawns each onto
//! a joinset behind a semaphore capped at `executor_worker_cnt`. A task runs
//! its action pipeline `run_before -> run -> run_after`; a non-nil error
//! from any stage aborts the remainder. Only `run` gets the task's own
//! timeout; the hooks get the fixed stage budget.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dagrun_core::action::{ExecuteContext, TraceOp};
use dagrun_core::entity::{now_secs, TaskInstance, TaskInstanceStatus, TaskTrace};
use dagrun_core::event::{Event, TaskInstanceUpdated};
use dagrun_core::store::TaskInsField;
use dagrun_core::{Error, Result};
use futures_util::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::engine::SharedState;
use crate::flag::ShutdownGuard;
use crate::{metric, registry, util};

const PATCH_ATTEMPTS: usize = 3;
const PATCH_BACKOFF: Duration = Duration::from_millis(25);

pub(crate) async fn run(
    shared: Arc<SharedState>,
    mut rx: mpsc::UnboundedReceiver<TaskInstance>,
) -> anyhow::Result<()> {
    let _guard = ShutdownGuard::new(&shared.shutdown);
    let mut shutdown = std::pin::pin!(shared.shutdown.wait());

    let semaphore = Arc::new(Semaphore::new(shared.config.executor_worker_cnt));
    let mut tasks = JoinSet::new();

    'outer: loop {
        tokio::select! {
            biased;

            _ = shutdown.as_mut() => break 'outer,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {
                while tasks.try_join_next().is_some() {}
            }
            item = rx.recv() => {
                let Some(ti) = item else { break 'outer };
                let permit = tokio::select! {
                    biased;

                    _ = shared.shutdown.wait() => break 'outer,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'outer,
                    },
                };

                let shared = shared.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    run_task(shared, ti).await;
                });
            }
        }
    }

    // Give in-flight stages a chance to finish, then cancel their contexts.
    // Whatever still does not return is abandoned for the watchdog.
    let grace = shared.config.shutdown_grace;
    if !tasks.is_empty() {
        tracing::info!("executor draining {} in-flight tasks", tasks.len());
    }
    if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
        shared.cancel_all_running();
        if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
            tracing::warn!("abandoning {} tasks that ignored cancellation", tasks.len());
            tasks.abort_all();
            drain(&mut tasks).await;
        }
    }

    Ok(())
}

async fn drain(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

/// Deregisters the task's cancellation token when execution ends.
struct RunningGuard {
    shared: Arc<SharedState>,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.shared.deregister_running(&self.id);
    }
}

async fn run_task(shared: Arc<SharedState>, ti: TaskInstance) {
    let task_ins_id = ti.base.id.clone();
    let token = shared.register_running(&task_ins_id);
    let _guard = RunningGuard {
        shared: shared.clone(),
        id: task_ins_id.clone(),
    };

    let result = AssertUnwindSafe(execute(&shared, ti, token)).catch_unwind().await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(task_ins = %task_ins_id, "task execution errored: {e:#}");
        }
        Err(payload) => {
            let message: &str = if let Some(message) = payload.downcast_ref::<String>() {
                message
            } else if let Some(message) = payload.downcast_ref::<&str>() {
                message
            } else {
                "Box<dyn Any>"
            };
            tracing::error!(task_ins = %task_ins_id, "action panicked: {message}");

            if let Ok(mut row) = shared.store.get_task_ins(&task_ins_id).await {
                row.status = TaskInstanceStatus::Failed;
                row.reason = format!("action panicked: {message}");
                row.append_trace(row.reason.clone());
                let _ = finish(&shared, &row).await;
            }
        }
    }
}

/// Runs one action stage under its budget, mapping the ways it can go wrong
/// onto the engine's error kinds: `Canceled`, `Timeout`, `Action`.
async fn stage<F>(token: &CancellationToken, budget: Duration, fut: F) -> Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    tokio::select! {
        biased;

        _ = token.cancelled() => Err(Error::Canceled),
        result = tokio::time::timeout(budget, fut) => match result {
            Err(_) => Err(Error::Timeout(budget)),
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Action(e)),
        },
    }
}

async fn execute(
    shared: &Arc<SharedState>,
    mut ti: TaskInstance,
    token: CancellationToken,
) -> Result<()> {
    let Some(action) = registry::get_action(&ti.action_name) else {
        ti.status = TaskInstanceStatus::Failed;
        ti.reason = format!("no action registered under `{}`", ti.action_name);
        return finish(shared, &ti).await;
    };

    let dag_ins = match shared.store.get_dag_instance(&ti.dag_ins_id).await {
        Ok(ins) => ins,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if dag_ins.worker != shared.worker_key() {
        // Ownership moved while this task sat in the queue.
        return Ok(());
    }

    let ctx = ExecContext {
        shared: shared.clone(),
        task: ti.clone(),
        vars: dag_ins
            .vars
            .iter()
            .map(|(name, var)| (name.clone(), var.value.clone()))
            .collect(),
        token: token.clone(),
        traces: parking_lot::Mutex::new(TraceState::default()),
    };
    let params = ti.params.clone();

    if let Err(e) = stage(&token, shared.config.stage_budget, action.run_before(&ctx, &params)).await
    {
        return fail_stage(shared, ti, &ctx, "run_before", e).await;
    }

    let run_budget = if ti.timeout_secs > 0 {
        Duration::from_secs(ti.timeout_secs)
    } else {
        shared.config.executor_timeout
    };
    if let Err(e) = stage(&token, run_budget, action.run(&ctx, &params)).await {
        return fail_stage(shared, ti, &ctx, "run", e).await;
    }

    // Record the intermediate state while the finalization hook runs, so a
    // crash in between is visible to recovery. The accumulated traces flush
    // here when the action asked for persist-after-action.
    ti.status = TaskInstanceStatus::Ending;
    let mut fields = vec![TaskInsField::Status];
    if ctx.take_flush_request() {
        ti.traces.extend(ctx.drain_traces());
        fields.push(TaskInsField::Traces);
    }
    util::retry(PATCH_ATTEMPTS, PATCH_BACKOFF, || {
        shared.store.patch_task_ins(&ti, &fields)
    })
    .await?;

    if let Err(e) = stage(&token, shared.config.stage_budget, action.run_after(&ctx, &params)).await
    {
        return fail_stage(shared, ti, &ctx, "run_after", e).await;
    }

    ti.status = TaskInstanceStatus::Success;
    if ctx.take_flush_request() {
        ti.traces.extend(ctx.drain_traces());
    }
    finish(shared, &ti).await
}

async fn fail_stage(
    shared: &Arc<SharedState>,
    mut ti: TaskInstance,
    ctx: &ExecContext,
    stage: &str,
    error: Error,
) -> Result<()> {
    // The tail of buffered traces always flushes on failure.
    ti.traces.extend(ctx.drain_traces());

    match &error {
        Error::Canceled => {
            if shared.shutdown.is_raised() {
                // Shutting down: leave the row untouched so the watchdog can
                // hand the instance to a live worker.
                return Ok(());
            }
            ti.status = TaskInstanceStatus::Canceled;
            ti.reason = "user cancel".to_string();
            ti.append_trace(format!("{stage} canceled"));
        }
        Error::Timeout(_) => {
            ti.status = TaskInstanceStatus::Failed;
            ti.reason = "Timeout".to_string();
            ti.append_trace(format!("{stage}: {error}"));
        }
        _ => {
            ti.status = TaskInstanceStatus::Failed;
            ti.reason = error.to_string();
            ti.append_trace(format!("{stage}: {error}"));
        }
    }

    finish(shared, &ti).await
}

/// Patches the terminal row and wakes the dispatcher.
async fn finish(shared: &Arc<SharedState>, ti: &TaskInstance) -> Result<()> {
    // A cancel may have finalized the row while this task was still
    // executing; the canceled state wins over whatever we produced.
    if ti.status != TaskInstanceStatus::Canceled {
        if let Ok(stored) = shared.store.get_task_ins(&ti.base.id).await {
            if stored.status == TaskInstanceStatus::Canceled {
                return Ok(());
            }
        }
    }

    util::retry(PATCH_ATTEMPTS, PATCH_BACKOFF, || {
        shared.store.patch_task_ins(
            ti,
            &[TaskInsField::Status, TaskInsField::Reason, TaskInsField::Traces],
        )
    })
    .await?;

    metric::task_outcome(ti.status);
    shared.bus.publish(Event::TaskInstanceUpdated(TaskInstanceUpdated {
        id: ti.base.id.clone(),
        dag_ins_id: ti.dag_ins_id.clone(),
        status: ti.status,
    }));
    Ok(())
}

#[derive(Default)]
struct TraceState {
    buffered: Vec<TaskTrace>,
    flush_requested: bool,
}

/// The execution environment handed to actions. Share-data access funnels
/// through the per-instance lock owned by the engine's shared state.
struct ExecContext {
    shared: Arc<SharedState>,
    task: TaskInstance,
    vars: HashMap<String, String>,
    token: CancellationToken,
    traces: parking_lot::Mutex<TraceState>,
}

impl ExecContext {
    fn drain_traces(&self) -> Vec<TaskTrace> {
        std::mem::take(&mut self.traces.lock().buffered)
    }

    fn take_flush_request(&self) -> bool {
        std::mem::take(&mut self.traces.lock().flush_requested)
    }
}

#[async_trait]
impl ExecuteContext for ExecContext {
    fn trace_with(&self, message: &str, op: TraceOp) {
        let mut state = self.traces.lock();
        state.buffered.push(TaskTrace {
            ts: now_secs(),
            message: message.to_string(),
        });
        if op == TraceOp::PersistAfterAction {
            state.flush_requested = true;
        }
    }

    async fn share_get(&self, key: &str) -> Result<Option<String>> {
        let lock = self.shared.share_lock(&self.task.dag_ins_id);
        let _guard = lock.lock().await;
        let ins = self.shared.store.get_dag_instance(&self.task.dag_ins_id).await?;
        Ok(ins.share_data.get(key).map(str::to_string))
    }

    async fn share_set(&self, key: &str, value: &str) -> Result<()> {
        let lock = self.shared.share_lock(&self.task.dag_ins_id);
        let _guard = lock.lock().await;
        let mut ins = self.shared.store.get_dag_instance(&self.task.dag_ins_id).await?;
        ins.share_data.set(key, value);
        util::retry(PATCH_ATTEMPTS, PATCH_BACKOFF, || {
            self.shared
                .store
                .patch_dag_ins(&ins, &[dagrun_core::store::DagInsField::ShareData])
        })
        .await
    }

    fn var_value(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }

    fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    fn task(&self) -> &TaskInstance {
        &self.task
    }
}
