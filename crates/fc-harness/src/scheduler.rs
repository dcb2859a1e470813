//! Consolidates the "one tick loop per background job" shape repeated across
//! the daemon's liveness check, version watcher poll, rollout auto-progress,
//! and sweep dispatch into a single owned scheduler, per the design note on
//! uncontrolled timer leaks.

use std::future::Future;
use std::time::Duration;

use tracing::info;

use crate::shutdown::ShutdownSignal;

/// A single named periodic job. `interval` fires immediately on first tick;
/// callers that want to avoid a thundering herd at t=0 should consume that
/// first tick before doing real work (see [`Scheduler::spawn`]).
pub struct Job {
    pub name: &'static str,
    pub interval: Duration,
}

pub struct Scheduler {
    shutdown: ShutdownSignal,
}

impl Scheduler {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self { shutdown }
    }

    /// Spawn a periodic job that runs `tick` on every interval until
    /// shutdown is triggered. The interval's first (immediate) tick is
    /// consumed without running `tick`, so jobs don't all fire the instant
    /// the scheduler starts.
    pub fn spawn<F, Fut>(&self, job: Job, mut tick: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut rx = self.shutdown.subscribe();
        let name = job.name;
        let mut timer = tokio::time::interval(job.interval);

        tokio::spawn(async move {
            // consume the immediate first tick
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        tick().await;
                    }
                    _ = rx.recv() => {
                        info!(job = name, "scheduler job stopping on shutdown");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn job_ticks_and_stops_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let scheduler = Scheduler::new(shutdown.clone());
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        let handle = scheduler.spawn(
            Job { name: "test", interval: Duration::from_millis(10) },
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(45)).await;
        shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;

        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
