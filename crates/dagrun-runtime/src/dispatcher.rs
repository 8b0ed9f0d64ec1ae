//! Scheduling over one dag instance.
//!
//! The dispatcher owns every decision between "task instances exist" and
//! "the instance reached an outcome": applying pending commands, cascading
//! skips, computing the runnable frontier, handing work to the executor and
//! aggregating the instance status. It always runs on the parser worker the
//! instance hashes to, so decisions for one instance are serialized.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use dagrun_core::entity::{
    Command, CommandName, DagInstance, DagInstanceStatus, PreCheckAct, PreCheckSource,
    TaskInstance, TaskInstanceStatus,
};
use dagrun_core::graph::TaskGraph;
use dagrun_core::store::{DagInsField, ListTaskInstanceInput, TaskInsField};
use dagrun_core::{template, Result};

use crate::engine::SharedState;
use crate::{metric, util};

const PATCH_ATTEMPTS: usize = 3;
const PATCH_BACKOFF: Duration = Duration::from_millis(25);

/// Divider left in the traces when a `Continue` command releases a blocked
/// task. Its presence tells the planner the pre-check gate was already
/// consumed, otherwise the task would block again on the next evaluation.
const CONTINUE_MARK: &str = "continue requested";

/// Re-evaluates one owned instance. `ins` must be freshly loaded.
pub(crate) async fn dispatch(shared: &SharedState, ins: &mut DagInstance) -> Result<()> {
    let started = Instant::now();

    let dag = match shared.store.get_dag(&ins.dag_id).await {
        Ok(dag) => dag,
        Err(e) if e.is_not_found() => {
            return shared
                .fail_instance(ins, format!("dag template `{}` is gone", ins.dag_id))
                .await;
        }
        Err(e) => return Err(e),
    };
    let graph = match TaskGraph::build(&dag.tasks) {
        Ok(graph) => graph,
        Err(e) => {
            return shared
                .fail_instance(ins, format!("dag template `{}` is invalid: {e}", ins.dag_id))
                .await;
        }
    };

    let mut tasks = shared
        .store
        .list_task_instance(&ListTaskInstanceInput {
            dag_ins_id: Some(ins.base.id.clone()),
            ..Default::default()
        })
        .await?;
    if tasks.is_empty() {
        // Not materialized yet; the parser gets there first.
        return Ok(());
    }
    // Keep frontier evaluation in declaration order regardless of how the
    // store happens to return rows.
    let position: HashMap<&str, usize> = graph
        .order()
        .iter()
        .enumerate()
        .map(|(pos, id)| (id.as_str(), pos))
        .collect();
    tasks.sort_by_key(|ti| position.get(ti.task_id.as_str()).copied().unwrap_or(usize::MAX));

    if let Some(cmd) = ins.cmd.take() {
        apply_command(shared, ins, &graph, &mut tasks, cmd).await?;
    }

    let vars = template::resolve_vars(&dag, ins);
    let decision = plan(&graph, &tasks, &vars, &ins.share_data.dict);

    for (i, reason) in &decision.skip {
        tasks[*i].status = TaskInstanceStatus::Skipped;
        tasks[*i].reason = reason.clone();
        patch_task(shared, &tasks[*i], &[TaskInsField::Status, TaskInsField::Reason]).await?;
        metric::task_outcome(TaskInstanceStatus::Skipped);
    }
    for (i, reason) in &decision.block {
        tasks[*i].status = TaskInstanceStatus::Blocked;
        tasks[*i].reason = reason.clone();
        patch_task(shared, &tasks[*i], &[TaskInsField::Status, TaskInsField::Reason]).await?;
    }
    for i in &decision.run {
        tasks[*i].status = TaskInstanceStatus::Running;
        patch_task(shared, &tasks[*i], &[TaskInsField::Status]).await?;
        if shared.exec_tx.send(tasks[*i].clone()).is_err() {
            // Executor is gone; we are shutting down.
            return Ok(());
        }
    }

    match decision.outcome {
        Some(Outcome::Success) => {
            ins.status = DagInstanceStatus::Success;
            ins.reason.clear();
            ins.worker.clear();
            shared.store.update_dag_ins(ins).await?;
            shared.release_instance(&ins.base.id);
            metric::instance_transition(DagInstanceStatus::Success);
        }
        Some(Outcome::Failed(reason)) => {
            ins.status = DagInstanceStatus::Failed;
            ins.reason = reason;
            ins.worker.clear();
            shared.store.update_dag_ins(ins).await?;
            shared.release_instance(&ins.base.id);
            metric::instance_transition(DagInstanceStatus::Failed);
        }
        Some(Outcome::Blocked) => {
            if ins.status != DagInstanceStatus::Blocked {
                ins.status = DagInstanceStatus::Blocked;
                shared
                    .store
                    .patch_dag_ins(ins, &[DagInsField::Status])
                    .await?;
                metric::instance_transition(DagInstanceStatus::Blocked);
            }
        }
        None => {}
    }

    metric::dispatch_latency(started.elapsed());
    Ok(())
}

/// Applies a pending command to the loaded task set, persists the touched
/// rows and clears the command from the instance. Runs strictly before any
/// new dispatch decision for the same instance.
async fn apply_command(
    shared: &SharedState,
    ins: &mut DagInstance,
    graph: &TaskGraph,
    tasks: &mut [TaskInstance],
    cmd: Command,
) -> Result<()> {
    let explicit = !cmd.target_task_ins_ids.is_empty();
    let targets = resolve_targets(&cmd, tasks);
    if explicit && targets.is_empty() {
        ins.reason = format!("{:?} command matched no eligible task", cmd.name);
    }

    match cmd.name {
        CommandName::Cancel => {
            let reason = ins
                .cmd_options
                .as_ref()
                .and_then(|o| o.reason.clone())
                .unwrap_or_else(|| "user cancel".to_string());
            // With empty targets, only tasks that actually started (or are
            // holding) are canceled outright; everything downstream of them
            // falls to the skip cascade instead.
            let targets = if explicit {
                targets
            } else {
                let mut shadowed: HashSet<String> = HashSet::new();
                for &i in &targets {
                    shadowed.extend(graph.descendants(&tasks[i].task_id));
                }
                targets
                    .into_iter()
                    .filter(|&i| !shadowed.contains(&tasks[i].task_id))
                    .collect()
            };
            for i in targets {
                let ti = &mut tasks[i];
                if ti.status.is_in_flight() {
                    // The executor owns in-flight rows; ask it to stop. A row
                    // that is Running only on paper (executor lost it) is
                    // finalized here instead.
                    if shared.cancel_running(&ti.base.id) {
                        continue;
                    }
                }
                ti.status = TaskInstanceStatus::Canceled;
                ti.reason = reason.clone();
                ti.append_trace(format!("canceled: {reason}"));
                patch_task(
                    shared,
                    ti,
                    &[TaskInsField::Status, TaskInsField::Reason, TaskInsField::Traces],
                )
                .await?;
                metric::task_outcome(TaskInstanceStatus::Canceled);
            }
        }
        CommandName::Retry => {
            let by_id: HashMap<String, usize> = tasks
                .iter()
                .enumerate()
                .map(|(i, ti)| (ti.task_id.clone(), i))
                .collect();
            for i in targets {
                reset_task(shared, &mut tasks[i], "retry requested").await?;
                let task_id = tasks[i].task_id.clone();
                for dep in graph.descendants(&task_id) {
                    if let Some(&j) = by_id.get(&dep) {
                        if tasks[j].status == TaskInstanceStatus::Skipped {
                            reset_task(shared, &mut tasks[j], "upstream retry").await?;
                        }
                    }
                }
            }
            ins.status = DagInstanceStatus::Running;
            ins.reason.clear();
        }
        CommandName::Continue => {
            for i in targets {
                reset_task(shared, &mut tasks[i], CONTINUE_MARK).await?;
            }
            ins.status = DagInstanceStatus::Running;
        }
    }

    ins.cmd = None;
    ins.cmd_options = None;
    shared
        .store
        .patch_dag_ins(
            ins,
            &[DagInsField::Cmd, DagInsField::Status, DagInsField::Reason],
        )
        .await
}

/// Maps command targets to indexes of eligible tasks. Empty targets mean
/// "every eligible task". Unknown ids are ignored with a trace in the log.
fn resolve_targets(cmd: &Command, tasks: &[TaskInstance]) -> Vec<usize> {
    let eligible = |status: TaskInstanceStatus| match cmd.name {
        CommandName::Cancel => !status.is_terminal(),
        CommandName::Retry => status == TaskInstanceStatus::Failed,
        CommandName::Continue => status == TaskInstanceStatus::Blocked,
    };

    if cmd.target_task_ins_ids.is_empty() {
        return (0..tasks.len()).filter(|&i| eligible(tasks[i].status)).collect();
    }

    let mut out = Vec::new();
    for id in &cmd.target_task_ins_ids {
        match tasks.iter().position(|ti| &ti.base.id == id) {
            Some(i) if eligible(tasks[i].status) => out.push(i),
            Some(i) => tracing::warn!(
                task_ins = %id,
                status = ?tasks[i].status,
                "command target is not eligible for {:?}; ignoring",
                cmd.name,
            ),
            None => tracing::warn!(
                task_ins = %id,
                "command target does not belong to this instance; ignoring"
            ),
        }
    }
    out
}

async fn reset_task(shared: &SharedState, ti: &mut TaskInstance, note: &str) -> Result<()> {
    ti.status = TaskInstanceStatus::Init;
    ti.reason.clear();
    // Traces are retained; the divider marks where the next attempt starts.
    ti.append_trace(format!("---- {note}; resetting to init ----"));
    patch_task(
        shared,
        ti,
        &[TaskInsField::Status, TaskInsField::Reason, TaskInsField::Traces],
    )
    .await
}

async fn patch_task(
    shared: &SharedState,
    ti: &TaskInstance,
    fields: &[TaskInsField],
) -> Result<()> {
    util::retry(PATCH_ATTEMPTS, PATCH_BACKOFF, || {
        shared.store.patch_task_ins(ti, fields)
    })
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Planned {
    Run,
    Skip,
    Block,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// (task index, reason), cascaded skips and pre-check skips.
    pub skip: Vec<(usize, String)>,
    /// (task index, reason), pre-check blocks.
    pub block: Vec<(usize, String)>,
    /// Indexes to enqueue, in template declaration order.
    pub run: Vec<usize>,
    pub outcome: Option<Outcome>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failed(String),
    Blocked,
}

/// Pure frontier computation over a loaded task set.
///
/// A failed or canceled task never cancels independent branches; it only
/// cascades `Skipped` through its transitive dependents. An `Init` task is
/// runnable once every upstream ended `Success`, or `Skipped` by something
/// other than that cascade (a pre-check skip does not poison dependents).
pub(crate) fn plan(
    graph: &TaskGraph,
    tasks: &[TaskInstance],
    vars: &HashMap<String, String>,
    share: &HashMap<String, String>,
) -> Plan {
    let index_of: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, ti)| (ti.task_id.as_str(), i))
        .collect();

    let mut planned: Vec<Option<Planned>> = vec![None; tasks.len()];
    let mut plan = Plan::default();

    // Cascade skips from every failed/canceled task first.
    for ti in tasks {
        let verb = match ti.status {
            TaskInstanceStatus::Failed => "failed",
            TaskInstanceStatus::Canceled => "canceled",
            _ => continue,
        };
        for dep in graph.descendants(&ti.task_id) {
            let Some(&i) = index_of.get(dep.as_str()) else {
                continue;
            };
            if planned[i].is_none()
                && matches!(
                    tasks[i].status,
                    TaskInstanceStatus::Init | TaskInstanceStatus::Blocked
                )
            {
                planned[i] = Some(Planned::Skip);
                plan.skip
                    .push((i, format!("skipped: upstream task `{}` {verb}", ti.task_id)));
            }
        }
    }

    let effective = |i: usize, planned: &[Option<Planned>]| match planned[i] {
        Some(Planned::Skip) => TaskInstanceStatus::Skipped,
        Some(Planned::Block) => TaskInstanceStatus::Blocked,
        Some(Planned::Run) => TaskInstanceStatus::Running,
        None => tasks[i].status,
    };

    // Grow the frontier to a fixpoint: a pre-check skip decided in one pass
    // can make its dependents runnable in the next.
    loop {
        let mut progressed = false;
        for id in graph.order() {
            let Some(&i) = index_of.get(id.as_str()) else {
                continue;
            };
            if planned[i].is_some() || tasks[i].status != TaskInstanceStatus::Init {
                continue;
            }
            let deps_satisfied = graph.upstream(id).iter().all(|up| {
                index_of.get(up.as_str()).map_or(false, |&j| {
                    matches!(
                        effective(j, &planned),
                        TaskInstanceStatus::Success | TaskInstanceStatus::Skipped
                    )
                })
            });
            if !deps_satisfied {
                continue;
            }

            let gate = if was_continued(&tasks[i]) {
                None
            } else {
                eval_pre_checks(&tasks[i], vars, share)
            };
            match gate {
                Some((name, PreCheckAct::Block)) => {
                    planned[i] = Some(Planned::Block);
                    plan.block.push((i, format!("blocked by pre-check `{name}`")));
                }
                Some((name, PreCheckAct::Skip)) => {
                    planned[i] = Some(Planned::Skip);
                    plan.skip.push((i, format!("skipped by pre-check `{name}`")));
                }
                None => {
                    planned[i] = Some(Planned::Run);
                    plan.run.push(i);
                }
            }
            progressed = true;
        }
        if !progressed {
            break;
        }
    }

    let in_flight = tasks.iter().any(|ti| ti.status.is_in_flight());
    if plan.run.is_empty() && !in_flight {
        let mut all_terminal = true;
        let mut failures = Vec::new();
        for (i, ti) in tasks.iter().enumerate() {
            match effective(i, &planned) {
                TaskInstanceStatus::Failed => {
                    failures.push(format!("task `{}` failed: {}", ti.task_id, ti.reason))
                }
                TaskInstanceStatus::Canceled => {
                    failures.push(format!("task `{}` canceled: {}", ti.task_id, ti.reason))
                }
                TaskInstanceStatus::Success | TaskInstanceStatus::Skipped => {}
                _ => all_terminal = false,
            }
        }
        plan.outcome = Some(if !all_terminal {
            Outcome::Blocked
        } else if failures.is_empty() {
            Outcome::Success
        } else {
            Outcome::Failed(failures.join("; "))
        });
    }

    plan
}

/// Whether a `Continue` command already released this task once.
fn was_continued(ti: &TaskInstance) -> bool {
    ti.traces.iter().any(|tr| tr.message.contains(CONTINUE_MARK))
}

/// Returns the first (by name) pre-check whose conditions all hold.
fn eval_pre_checks(
    ti: &TaskInstance,
    vars: &HashMap<String, String>,
    share: &HashMap<String, String>,
) -> Option<(String, PreCheckAct)> {
    let mut names: Vec<&String> = ti.pre_checks.keys().collect();
    names.sort();

    for name in names {
        let check = &ti.pre_checks[name];
        if check.conditions.is_empty() {
            continue;
        }
        let holds = check.conditions.iter().all(|cond| {
            let value = match cond.source {
                PreCheckSource::Vars => vars.get(&cond.key),
                PreCheckSource::ShareData => share.get(&cond.key),
            };
            cond.matches(value.map(String::as_str))
        });
        if holds {
            return Some((name.clone(), check.act));
        }
    }
    None
}
