//! Topology Watcher - periodic partition reconciliation
//!
//! Re-runs discovery + reconcile on a fixed interval. Failures are logged and
//! retried on the next tick. Stopping cancels the `done` token; the loop only
//! observes it between ticks. A reconcile in progress is not interrupted by
//! `done` itself; it stops early only when the registry is shut down.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::registry::ReaderRegistry;
use crate::schema::TableValue;

pub struct TopologyWatcher<V> {
    registry: Arc<ReaderRegistry<V>>,
    interval: Duration,
    done: CancellationToken,
}

impl<V: TableValue> TopologyWatcher<V> {
    pub fn new(registry: Arc<ReaderRegistry<V>>, interval: Duration, done: CancellationToken) -> Self {
        TopologyWatcher {
            registry,
            interval,
            done,
        }
    }

    /// Spawn the watcher loop onto the runtime
    pub fn spawn(self, span: Span) -> WatcherHandle {
        let done = self.done.clone();
        let task = tokio::spawn(self.run().instrument(span));
        WatcherHandle { done, task }
    }

    pub async fn run(self) {
        // The initial reconcile already happened at construction.
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.done.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.registry.refresh().await {
                Ok(report) if !report.is_empty() => info!(
                    added = report.added.len(),
                    removed = report.removed.len(),
                    "partition topology changed"
                ),
                Ok(_) => debug!("partition topology unchanged"),
                Err(e) => warn!("failed to check for changes in number of partitions: {}", e),
            }
        }

        debug!("topology watcher stopped");
    }
}

/// Handle to a running watcher
pub struct WatcherHandle {
    done: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        self.done.cancel();
        if let Err(e) = self.task.await {
            warn!("topology watcher task failed: {}", e);
        }
    }
}
