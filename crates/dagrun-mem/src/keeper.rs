use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dagrun_core::keeper::{DistributedMutex, Keeper};
use dagrun_core::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;

/// Liveness registry and named locks shared by every in-process worker.
///
/// This is the in-memory stand-in for whatever backing store a production
/// keeper would heartbeat against; the expiry and lock-stealing semantics
/// are the same.
pub struct MemCluster {
    ttl: Duration,
    inner: Mutex<ClusterInner>,
}

#[derive(Default)]
struct ClusterInner {
    workers: std::collections::HashMap<String, Instant>,
    locks: std::collections::HashMap<String, LockEntry>,
    partitioned: std::collections::HashSet<String>,
}

struct LockEntry {
    owner: String,
    expires_at: Instant,
}

impl MemCluster {
    /// `ttl` is the liveness window: a worker whose last heartbeat is older
    /// than this is treated as dead. Locks expire on the same window so a
    /// crashed holder cannot wedge the cluster.
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            inner: Mutex::new(ClusterInner::default()),
        })
    }

    /// Simulates a transport outage: the worker's heartbeats fail until
    /// [`heal`](Self::heal) is called. Its registration stays and expires on
    /// the normal TTL, exactly like a worker cut off from a real backend.
    pub fn partition(&self, key: &str) {
        self.inner.lock().partitioned.insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        self.inner.lock().partitioned.remove(key);
    }

    fn beat(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.partitioned.contains(key) {
            return Err(Error::Transient(format!(
                "worker `{key}` cannot reach the cluster"
            )));
        }
        inner.workers.insert(key.to_string(), Instant::now());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.inner.lock().workers.remove(key);
    }

    pub fn alive(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let ttl = self.ttl;
        inner.workers.retain(|_, beat| beat.elapsed() <= ttl);
        let mut keys: Vec<String> = inner.workers.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn try_lock(&self, name: &str, owner: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.locks.get(name) {
            Some(entry) if entry.expires_at > Instant::now() && entry.owner != owner => false,
            _ => {
                inner.locks.insert(
                    name.to_string(),
                    LockEntry {
                        owner: owner.to_string(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                true
            }
        }
    }

    fn unlock(&self, name: &str, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.locks.get(name) {
            Some(entry) if entry.owner == owner => {
                inner.locks.remove(name);
                Ok(())
            }
            Some(_) => Err(Error::Internal(format!(
                "mutex `{name}` is not held by `{owner}`"
            ))),
            None => Err(Error::Internal(format!("mutex `{name}` is not locked"))),
        }
    }
}

/// After this many consecutive heartbeat failures the keeper reports
/// `Disconnected` and the engine pauses claiming and dispatch.
const MAX_MISSED_HEARTBEATS: u32 = 3;

/// A keeper registered in a [`MemCluster`].
///
/// Heartbeats run on a background task with the same downward jitter the
/// production keepers apply. A beat fails while the worker is partitioned
/// from the cluster; the loop counts consecutive failures, flips
/// `is_connected()` after [`MAX_MISSED_HEARTBEATS`] of them and reconnects
/// on the next success. [`MemKeeper::stop_heartbeat`] simulates a crashed
/// worker instead: the registration stays until the TTL expires, exactly
/// like a process that died without cleanup.
pub struct MemKeeper {
    cluster: Arc<MemCluster>,
    key: String,
    connected: Arc<AtomicBool>,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MemKeeper {
    /// Registers `key` and starts heartbeating. Must be called from within a
    /// tokio runtime.
    pub fn start(cluster: Arc<MemCluster>, key: &str, interval: Duration) -> Arc<Self> {
        let connected = Arc::new(AtomicBool::new(cluster.beat(key).is_ok()));

        let beat_task = {
            let cluster = cluster.clone();
            let connected = connected.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                let mut failures = 0u32;
                loop {
                    // The loop cadence doubles as the retry backoff, jittered
                    // downwards by up to a quarter like the teacher's.
                    let jitter = rand::thread_rng()
                        .gen_range(0..(interval / 4).as_nanos().max(1));
                    tokio::time::sleep(interval - Duration::from_nanos(jitter as u64)).await;
                    match cluster.beat(&key) {
                        Ok(()) => {
                            failures = 0;
                            connected.store(true, Ordering::Release);
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(
                                worker = %key,
                                "heartbeat failed ({failures} in a row): {e}"
                            );
                            if failures >= MAX_MISSED_HEARTBEATS {
                                connected.store(false, Ordering::Release);
                            }
                        }
                    }
                }
            })
        };

        Arc::new(Self {
            cluster,
            key: key.to_string(),
            connected,
            heartbeat: Mutex::new(Some(beat_task)),
        })
    }

    /// Stops heartbeating without deregistering, as a crashed process would.
    pub fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        self.connected.store(false, Ordering::Release);
    }

    /// Graceful shutdown: stop heartbeating and remove the registration so
    /// peers do not have to wait out the TTL.
    pub fn close(&self) {
        self.stop_heartbeat();
        self.cluster.remove(&self.key);
    }
}

#[async_trait]
impl Keeper for MemKeeper {
    fn worker_key(&self) -> &str {
        &self.key
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn alive_workers(&self) -> Result<Vec<String>> {
        if !self.is_connected() {
            return Err(Error::KeeperDown);
        }
        Ok(self.cluster.alive())
    }

    async fn is_alive(&self, key: &str) -> Result<bool> {
        if !self.is_connected() {
            return Err(Error::KeeperDown);
        }
        Ok(self.cluster.alive().iter().any(|k| k == key))
    }

    fn new_mutex(&self, name: &str) -> Box<dyn DistributedMutex> {
        Box::new(MemMutex {
            cluster: self.cluster.clone(),
            name: name.to_string(),
            owner: self.key.clone(),
        })
    }
}

struct MemMutex {
    cluster: Arc<MemCluster>,
    name: String,
    owner: String,
}

#[async_trait]
impl DistributedMutex for MemMutex {
    async fn lock(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cluster.try_lock(&self.name, &self.owner) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let backoff = rand::thread_rng().gen_range(5..25);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
    }

    async fn unlock(&self) -> Result<()> {
        self.cluster.unlock(&self.name, &self.owner)
    }
}
