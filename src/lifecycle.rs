//! Process lifecycle
//!
//! One root [`CancellationToken`] is handed to every background loop.
//! Shutdown cancels it, waits (bounded) for every tracked task and only then
//! closes storage, so no loop ever touches a closed pool.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::storage::StorageBackend;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

pub struct Lifecycle {
    root: CancellationToken,
    tasks: TaskTracker,
    shutdown_timeout: Duration,
    restart_base: Duration,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

impl Lifecycle {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
            shutdown_timeout,
            restart_base: Duration::from_secs(1),
        }
    }

    /// First delay before restarting a panicked loop; doubles per restart
    pub fn with_restart_base(mut self, base: Duration) -> Self {
        self.restart_base = base;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Track a one-shot task so shutdown waits for it
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "spawning task");
        self.tasks.spawn(future);
    }

    /// Run `make(token)` until it returns, restarting it after a panic.
    ///
    /// Restarts back off exponentially from the restart base up to 30s and
    /// stop as soon as the root token is cancelled.
    pub fn spawn_supervised<F, Fut>(&self, name: &'static str, make: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.clone();
        let base = self.restart_base;
        debug!(task = name, "spawning supervised task");

        self.tasks.spawn(async move {
            let mut restarts = 0u32;
            loop {
                match AssertUnwindSafe(make(token.clone())).catch_unwind().await {
                    Ok(()) => break,
                    Err(panic) => {
                        if token.is_cancelled() {
                            break;
                        }
                        restarts += 1;
                        let delay = restart_delay(base, restarts);
                        error!(
                            task = name,
                            restarts,
                            "background task panicked: {}; restarting in {delay:?}",
                            panic_message(&*panic)
                        );
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
            debug!(task = name, "supervised task finished");
        });
    }

    /// Cancel everything, wait for tracked tasks and close storage.
    ///
    /// Storage is closed even when the deadline passes; the timeout is then
    /// reported as an error.
    pub async fn shutdown(&self, storage: &dyn StorageBackend) -> Result<()> {
        info!("shutting down");
        self.root.cancel();
        self.tasks.close();

        let drained = tokio::time::timeout(self.shutdown_timeout, self.tasks.wait()).await;
        if drained.is_err() {
            warn!(
                pending = self.tasks.len(),
                "background tasks still running after {:?}",
                self.shutdown_timeout
            );
        }

        storage.close().await?;
        match drained {
            Ok(()) => {
                info!("shutdown complete");
                Ok(())
            }
            Err(_) => Err(Error::timeout(
                "lifecycle.shutdown",
                "background tasks did not stop before the deadline",
            )),
        }
    }
}

fn restart_delay(base: Duration, restarts: u32) -> Duration {
    let factor = 1u32.checked_shl(restarts.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RESTART_DELAY)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StorageBackend};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn restart_delay_doubles_and_caps() {
        let base = Duration::from_secs(1);
        assert_eq!(restart_delay(base, 1), Duration::from_secs(1));
        assert_eq!(restart_delay(base, 3), Duration::from_secs(4));
        assert_eq!(restart_delay(base, 6), Duration::from_secs(30));
        assert_eq!(restart_delay(base, 40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn panicking_loop_is_restarted() {
        let lifecycle = Lifecycle::new(Duration::from_secs(5)).with_restart_base(Duration::from_millis(1));
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();

        lifecycle.spawn_supervised("flaky", move |cancel| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    panic!("boom");
                }
                cancel.cancelled().await;
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        let storage = MemoryBackend::new();
        lifecycle.shutdown(&storage).await.unwrap();
        assert!(storage.ping().await.is_err());
    }

    #[tokio::test]
    async fn shutdown_deadline_is_reported() {
        let lifecycle = Lifecycle::new(Duration::from_millis(20));
        lifecycle.spawn("stubborn", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let storage = MemoryBackend::new();
        let err = lifecycle.shutdown(&storage).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
        // storage is closed regardless
        assert!(storage.ping().await.is_err());
    }
}
