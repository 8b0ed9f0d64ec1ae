//! Metric names and recording helpers.
//!
//! The engine records through the `metrics` facade; wiring an exporter (and
//! the HTTP transport it scrapes over) is left to the embedding process.

use dagrun_core::entity::{DagInstanceStatus, TaskInstanceStatus};

pub const DAG_INSTANCE_TRANSITIONS: &str = "dagrun_dag_instance_transitions_total";
pub const TASK_OUTCOMES: &str = "dagrun_task_outcomes_total";
pub const DISPATCH_SECONDS: &str = "dagrun_dispatch_seconds";
pub const PARSER_CLAIMS: &str = "dagrun_parser_claims_total";
pub const WATCHDOG_RECLAIMS: &str = "dagrun_watchdog_reclaims_total";
pub const ALIVE_WORKERS: &str = "dagrun_alive_workers";

pub(crate) fn instance_transition(status: DagInstanceStatus) {
    metrics::counter!(DAG_INSTANCE_TRANSITIONS, "status" => status_label(status)).increment(1);
}

pub(crate) fn task_outcome(status: TaskInstanceStatus) {
    metrics::counter!(TASK_OUTCOMES, "status" => task_label(status)).increment(1);
}

pub(crate) fn dispatch_latency(elapsed: std::time::Duration) {
    metrics::histogram!(DISPATCH_SECONDS).record(elapsed.as_secs_f64());
}

fn status_label(status: DagInstanceStatus) -> &'static str {
    match status {
        DagInstanceStatus::Init => "init",
        DagInstanceStatus::Scheduled => "scheduled",
        DagInstanceStatus::Running => "running",
        DagInstanceStatus::Blocked => "blocked",
        DagInstanceStatus::Success => "success",
        DagInstanceStatus::Failed => "failed",
    }
}

fn task_label(status: TaskInstanceStatus) -> &'static str {
    match status {
        TaskInstanceStatus::Init => "init",
        TaskInstanceStatus::Running => "running",
        TaskInstanceStatus::Ending => "ending",
        TaskInstanceStatus::Retrying => "retrying",
        TaskInstanceStatus::Success => "success",
        TaskInstanceStatus::Failed => "failed",
        TaskInstanceStatus::Canceled => "canceled",
        TaskInstanceStatus::Blocked => "blocked",
        TaskInstanceStatus::Skipped => "skipped",
    }
}
