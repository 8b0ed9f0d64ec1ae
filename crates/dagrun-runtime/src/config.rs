use std::time::Duration;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fan-out of the parser. All work for one dag instance is routed to the
    /// same parser worker so per-instance transitions stay serialized.
    pub parser_workers_cnt: usize,

    /// Maximum number of task instances executing concurrently.
    pub executor_worker_cnt: usize,

    /// Budget for an action's `run` stage when the task declares no timeout
    /// of its own.
    pub executor_timeout: Duration,

    /// Budget for the `run_before` and `run_after` stages. These are meant
    /// for cheap setup/teardown and get a small fixed allowance.
    pub stage_budget: Duration,

    /// Upper bound for store reads, keeper calls and distributed mutex
    /// acquisition inside engine loops.
    pub read_timeout: Duration,

    /// Period of the parser's full sweep. The sweep backs up the event bus:
    /// anything missed through lag or a lost event is picked up here.
    pub instance_refresh_interval: Duration,

    /// Advisory heartbeat period handed to keeper implementations.
    pub heartbeat_interval: Duration,

    /// How many unowned instances one claim pass will take at most.
    pub claim_batch_size: usize,

    /// Period of the watchdog pass. Each pass runs under the cluster-wide
    /// watchdog mutex, so across the cluster roughly one pass per interval
    /// happens regardless of worker count.
    pub watchdog_interval: Duration,

    /// Extra allowance on top of a task's own timeout before the watchdog
    /// considers a `Running` row abandoned.
    pub stale_grace: Duration,

    /// How long shutdown waits for in-flight task stages before cancelling
    /// their contexts.
    pub shutdown_grace: Duration,

    /// Terminal dag instances older than this are garbage-collected together
    /// with their task instances. `None` disables collection.
    pub finished_retention: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parser_workers_cnt: 10,
            executor_worker_cnt: 50,
            executor_timeout: Duration::from_secs(600),
            stage_budget: Duration::from_secs(30),
            read_timeout: Duration::from_secs(15),
            instance_refresh_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            claim_batch_size: 32,
            watchdog_interval: Duration::from_secs(15),
            stale_grace: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            finished_retention: Some(Duration::from_secs(7 * 24 * 3600)),
        }
    }
}
