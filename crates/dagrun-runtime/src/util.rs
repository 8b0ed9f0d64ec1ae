use std::future::Future;
use std::time::Duration;

use dagrun_core::Result;
use rand::Rng;

/// Retries `op` on retryable errors (`Conflict`, `Transient`) with jittered
/// exponential backoff. Non-retryable errors surface immediately.
pub(crate) async fn retry<T, F, Fut>(attempts: usize, base: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base;
    let mut tried = 0usize;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && tried + 1 < attempts => {
                tried += 1;
                tokio::time::sleep(jittered(delay)).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Jitters a duration downwards by up to a quarter, the same shape the
/// keeper applies to heartbeats, so colliding retries spread out.
pub(crate) fn jittered(interval: Duration) -> Duration {
    let quarter = (interval / 4).as_nanos().max(1);
    let jitter = rand::thread_rng().gen_range(0..quarter);
    interval - Duration::from_nanos(jitter as u64)
}
