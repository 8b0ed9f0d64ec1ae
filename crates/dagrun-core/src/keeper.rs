//! Worker membership and coordination contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// The coordination layer every worker process plugs in.
///
/// Implementations heartbeat on their own schedule (the engine's
/// `heartbeat_interval` is advisory) with a liveness TTL; after three
/// consecutive heartbeat failures they must report `is_connected() == false`
/// so the engine stops claiming work, and flip back on the next success.
/// Transport errors are retried with jittered backoff inside the
/// implementation; they never surface to the engine as anything other than
/// a paused `is_connected`.
#[async_trait]
pub trait Keeper: Send + Sync {
    /// Stable identifier of this process. Used as the ownership key on
    /// claimed dag instances.
    fn worker_key(&self) -> &str;

    /// Whether heartbeats are currently getting through.
    fn is_connected(&self) -> bool;

    /// Workers whose heartbeat is within the liveness TTL.
    async fn alive_workers(&self) -> Result<Vec<String>>;

    async fn is_alive(&self, key: &str) -> Result<bool>;

    /// A named lock that is mutually exclusive across every worker sharing
    /// the backing store.
    fn new_mutex(&self, name: &str) -> Box<dyn DistributedMutex>;
}

/// A cluster-wide named mutex.
///
/// Held only for short critical sections (one watchdog pass, one parser
/// claim pass) and never across action execution. Locks carry an expiry so
/// a crashed holder cannot wedge the cluster.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Acquires the lock, waiting at most `timeout`. Fails with
    /// [`Error::Timeout`](crate::Error::Timeout) when contended past the
    /// deadline and [`Error::Canceled`](crate::Error::Canceled) when the
    /// surrounding context is torn down.
    async fn lock(&self, timeout: Duration) -> Result<()>;

    /// Releases the lock. Unlocking a lock this worker does not hold is an
    /// error.
    async fn unlock(&self) -> Result<()>;
}
