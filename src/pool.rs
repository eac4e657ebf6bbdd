//! Worker-pool framework shared by every pipeline stage.
//!
//! A pool runs N independent workers, each looping over one unit of
//! stage-specific work. Cancellation is observed between iterations through
//! a watch channel; a recoverable error is logged and the loop continues,
//! so a worker never terminates on a non-fatal failure. Shutdown completes
//! only once every worker has observed cancellation and exited.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

/// One stage-specific unit of work. Benign empty results (no message, no
/// eligible task) are handled inside `run_once`; an `Err` marks an
/// infrastructure failure whose iteration is abandoned and retried by the
/// at-least-once queue or the next poll.
#[async_trait]
pub trait Stage: Send + 'static {
    async fn run_once(&mut self) -> Result<()>;
}

pub struct StagePool {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl StagePool {
    /// Spawn `workers` independent workers, each owning its own stage value
    /// built by `make_stage` (worker ids start at 1).
    pub fn start<S, F>(name: &'static str, workers: usize, mut make_stage: F) -> Self
    where
        S: Stage,
        F: FnMut(usize) -> S,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(stage = name, workers, "starting worker pool");

        let handles = (1..=workers)
            .map(|worker| {
                let mut stage = make_stage(worker);
                let shutdown_rx = shutdown_rx.clone();
                let span = info_span!("stage_worker", stage = name, worker);
                tokio::spawn(async move {
                    loop {
                        if *shutdown_rx.borrow() {
                            info!(stage = name, worker, "worker observed shutdown");
                            return;
                        }
                        if let Err(err) = stage.run_once().instrument(span.clone()).await {
                            warn!(stage = name, worker, error = %err, "iteration failed");
                        }
                    }
                })
            })
            .collect();

        Self {
            name,
            shutdown_tx,
            handles,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal cancellation and wait for every worker to exit.
    pub async fn shutdown(self) {
        self.trigger_shutdown();
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(stage = self.name, error = %err, "worker task panicked");
            }
        }
        info!(stage = self.name, "worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    struct CountingStage {
        iterations: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Stage for CountingStage {
        async fn run_once(&mut self) -> Result<()> {
            self.iterations.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self.fail {
                anyhow::bail!("recoverable failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn all_workers_iterate_and_observe_shutdown() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let pool = StagePool::start("test", 4, |_| CountingStage {
            iterations: Arc::clone(&iterations),
            fail: false,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.shutdown().await;
        assert!(iterations.load(Ordering::Relaxed) >= 4);
    }

    #[tokio::test]
    async fn a_failing_stage_keeps_running() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let pool = StagePool::start("test", 1, |_| CountingStage {
            iterations: Arc::clone(&iterations),
            fail: true,
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.shutdown().await;
        // The worker survived multiple failed iterations.
        assert!(iterations.load(Ordering::Relaxed) >= 3);
    }
}
