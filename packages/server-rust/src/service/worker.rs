//! Background workers for the cache's periodic duties.
//!
//! A [`BackgroundWorker`] owns one tokio task that drives a
//! [`BackgroundRunnable`]: explicit tasks arrive over an mpsc channel, the
//! periodic duty runs on every tick, and `shutdown` runs exactly once when the
//! worker stops. The write-behind flusher and the expiry purger both run on it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

const TASK_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// BackgroundRunnable
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Name used in log fields.
    fn name(&self) -> &'static str {
        "background"
    }

    async fn run(&mut self, task: Self::Task);

    /// Periodic duty. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Final duty before the worker exits. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

pub struct BackgroundWorker<R: BackgroundRunnable> {
    name: &'static str,
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The first tick fires one full interval after start.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let name = runnable.name();
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = Duration::from_millis(tick_interval_ms.max(1));

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(worker = name, interval_ms = tick_interval_ms, "background worker started");

            loop {
                tokio::select! {
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => {
                        trace!(worker = name, "tick");
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            runnable.shutdown().await;
            debug!(worker = name, "background worker stopped");
        });

        Self {
            name,
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Queues a task for the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            anyhow::bail!("{} worker not running", self.name);
        };
        tx.send(task)
            .await
            .map_err(|_| anyhow::anyhow!("{} worker channel closed", self.name))
    }

    /// Signals shutdown and waits for `shutdown` to finish. Idempotent.
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Default, Clone)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct Counting(Counters);

    #[async_trait]
    impl BackgroundRunnable for Counting {
        type Task = u32;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&mut self, n: u32) {
            self.0.runs.fetch_add(n, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.0.ticks.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_and_shuts_down_once() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Counting(counters.clone()), 60_000);
        assert_eq!(worker.name(), "counting");

        worker.submit(1).await.unwrap();
        worker.submit(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert_eq!(counters.ticks.load(Ordering::SeqCst), 0);

        worker.stop().await;
        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval() {
        let counters = Counters::default();
        let mut worker = BackgroundWorker::start(Counting(counters.clone()), 20);
        tokio::time::sleep(Duration::from_millis(105)).await;
        worker.stop().await;
        assert!(counters.ticks.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn submit_after_stop_fails() {
        let mut worker = BackgroundWorker::start(Counting(Counters::default()), 60_000);
        worker.stop().await;
        assert!(worker.submit(1).await.is_err());
    }
}
