//! Background purge of expired locks.
//!
//! Expiry is already enforced lazily on every lock access; the sweeper only
//! keeps the table from accumulating dead entries. It never holds a shard
//! across an await point.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::LockManager;

#[derive(Debug)]
enum SweepTask {
    /// Purge now and report how many locks were dropped.
    PurgeNow(oneshot::Sender<usize>),
}

/// Handle of the running sweep task. Must be started inside a tokio runtime.
#[derive(Debug)]
pub struct LockSweeper {
    tx: Option<mpsc::Sender<SweepTask>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl LockSweeper {
    /// Spawns the sweep loop, purging every `interval_ms`.
    #[must_use]
    pub fn start(manager: Arc<LockManager>, interval_ms: u64) -> Self {
        let (tx, mut rx) = mpsc::channel::<SweepTask>(16);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            // Skip the immediate first tick.
            tick.tick().await;

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(SweepTask::PurgeNow(reply)) => {
                            let _ = reply.send(manager.purge_expired());
                        }
                        None => break,
                    },
                    _ = tick.tick() => {
                        manager.purge_expired();
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("lock sweeper stopped");
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Runs a purge on the sweep task and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweeper has been stopped.
    pub async fn purge_now(&self) -> anyhow::Result<usize> {
        let Some(tx) = &self.tx else {
            return Err(anyhow::anyhow!("lock sweeper not running"));
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SweepTask::PurgeNow(reply_tx))
            .await
            .map_err(|_| anyhow::anyhow!("lock sweeper channel closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("lock sweeper dropped the request"))
    }

    /// Stops the sweep loop and waits for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
