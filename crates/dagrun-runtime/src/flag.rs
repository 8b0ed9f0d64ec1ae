use std::sync::Arc;

use tokio::sync::watch;

/// A one-shot async flag shared by every engine loop.
#[derive(Clone)]
pub struct ShutdownFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    pub fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once the flag is raised. Safe to poll from several loops at
    /// once.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // borrow_and_update marks the current value seen, so a raise between
        // the check and the await still wakes us.
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Raises the flag when dropped, so one engine loop going down takes the
/// rest with it instead of leaving a half-alive worker.
pub struct ShutdownGuard<'a>(&'a ShutdownFlag);

impl<'a> ShutdownGuard<'a> {
    pub fn new(flag: &'a ShutdownFlag) -> Self {
        Self(flag)
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_raised() {
            tracing::warn!("engine loop exiting without the shutdown flag being raised");
        }
        self.0.raise();
    }
}
