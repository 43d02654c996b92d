//! Reader Registry - one tailing reader per live partition
//!
//! `reconcile` aligns the set of readers with a partition list: readers of
//! partitions that vanished are cancelled and joined, and every new partition
//! gets a reader that is first drained synchronously (compacted backlog) and
//! then handed to its own tailing task.
//!
//! ```text
//! reconcile ──► open reader ──► drain backlog ──► spawn tail task
//!                                                      │
//!                 cancel token ◄── remove / shutdown ──┘
//! ```
//!
//! The entry map is behind an async mutex held for the whole reconcile,
//! drains included, so two reconciles never race on the same partition.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::listeners::ListenerHub;
use super::store::StateStore;
use crate::config::SchemaType;
use crate::schema::{TableValue, ValueDecoder};
use crate::source::{
    DiscoveryError, FetchError, PartitionId, PartitionReader, ReaderOpenError, ReaderOptions,
    Record, TopicClient,
};

/// Error returned by a reconcile pass
#[derive(Debug)]
pub enum ReconcileError {
    /// Partitions could not be enumerated
    Discovery(DiscoveryError),
    /// A reader could not be opened for a new partition
    Open {
        partition: PartitionId,
        source: ReaderOpenError,
    },
    /// The compacted backlog of a new partition could not be drained
    Drain {
        partition: PartitionId,
        source: FetchError,
    },
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Discovery(e) => write!(f, "{}", e),
            ReconcileError::Open { partition, source } => {
                write!(f, "create new reader failed for {}: {}", partition, source)
            }
            ReconcileError::Drain { partition, source } => {
                write!(f, "draining backlog failed for {}: {}", partition, source)
            }
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconcileError::Discovery(e) => Some(e),
            ReconcileError::Open { source, .. } => Some(source),
            ReconcileError::Drain { source, .. } => Some(source),
        }
    }
}

/// Partitions started and stopped by one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<PartitionId>,
    pub removed: Vec<PartitionId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Why a tailing task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailExit {
    /// The entry's token was cancelled
    Cancelled,
    /// The reader reported cancellation or closure
    ReaderClosed,
    /// The listener hub stopped accepting records
    ViewClosed,
}

/// Everything a reader needs to fold records into the view
pub(crate) struct RecordSink<V> {
    pub(crate) store: Arc<StateStore<V>>,
    pub(crate) hub: Arc<ListenerHub<V>>,
    pub(crate) decoder: Arc<dyn ValueDecoder<V>>,
}

impl<V: TableValue> RecordSink<V> {
    fn apply(&self, record: &Record) -> bool {
        self.hub.publish(&self.store, record, self.decoder.as_ref())
    }
}

struct ReaderEntry {
    cancel: CancellationToken,
    task: JoinHandle<TailExit>,
}

impl ReaderEntry {
    /// Cancel the tailing task and wait for it to close its reader.
    async fn stop(self, partition: &PartitionId) {
        self.cancel.cancel();
        match self.task.await {
            Ok(exit) => debug!(partition = %partition, ?exit, "partition reader stopped"),
            Err(e) => warn!(partition = %partition, "partition reader task failed: {}", e),
        }
    }
}

pub struct ReaderRegistry<V> {
    client: Arc<dyn TopicClient>,
    topic: String,
    schema: Option<SchemaType>,
    sink: Arc<RecordSink<V>>,
    entries: Mutex<HashMap<PartitionId, ReaderEntry>>,
    /// Parent of every entry token
    root: CancellationToken,
    span: Span,
}

impl<V: TableValue> ReaderRegistry<V> {
    pub(crate) fn new(
        client: Arc<dyn TopicClient>,
        topic: String,
        schema: Option<SchemaType>,
        sink: Arc<RecordSink<V>>,
        root: CancellationToken,
        span: Span,
    ) -> Self {
        ReaderRegistry {
            client,
            topic,
            schema,
            sink,
            entries: Mutex::new(HashMap::new()),
            root,
            span,
        }
    }

    /// Partitions that currently have a reader, sorted
    pub async fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.entries.lock().await.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Discover the topic's partitions and reconcile against them.
    pub async fn refresh(&self) -> Result<ReconcileReport, ReconcileError> {
        let partitions = self
            .client
            .partitions(&self.topic)
            .await
            .map_err(ReconcileError::Discovery)?;
        self.reconcile(&partitions).await
    }

    /// Align the registered readers with `current`.
    ///
    /// Idempotent for an unchanged partition set. On error, partitions
    /// already started by this call stay registered. A shutdown while a
    /// backlog is draining ends the pass early with the partitions started
    /// so far.
    pub async fn reconcile(
        &self,
        current: &[PartitionId],
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut entries = self.entries.lock().await;
        let mut report = ReconcileReport::default();
        if self.root.is_cancelled() {
            return Ok(report);
        }

        let current: HashSet<&PartitionId> = current.iter().collect();

        let stale: Vec<PartitionId> = entries
            .keys()
            .filter(|p| !current.contains(p))
            .cloned()
            .collect();
        for partition in stale {
            if let Some(entry) = entries.remove(&partition) {
                entry.stop(&partition).await;
                info!(partition = %partition, "partition removed from topology");
                report.removed.push(partition);
            }
        }

        let mut fresh: Vec<&PartitionId> = current
            .into_iter()
            .filter(|p| !entries.contains_key(*p))
            .collect();
        fresh.sort();

        for partition in fresh {
            let options = ReaderOptions::compacted(partition.clone(), self.schema);
            let mut reader = self.client.open_reader(options).await.map_err(|source| {
                ReconcileError::Open {
                    partition: partition.clone(),
                    source,
                }
            })?;

            let drained = match drain(&mut reader, &self.sink, &self.root).await {
                Ok(Drained::Caught(drained)) => drained,
                Ok(Drained::Stopped) => {
                    reader.close().await;
                    debug!(partition = %partition, "backlog drain stopped before completion");
                    return Ok(report);
                }
                Err(source) => {
                    reader.close().await;
                    return Err(ReconcileError::Drain {
                        partition: partition.clone(),
                        source,
                    });
                }
            };

            let cancel = self.root.child_token();
            let task = tokio::spawn(
                tail(reader, self.sink.clone(), cancel.clone()).instrument(self.span.clone()),
            );
            entries.insert(partition.clone(), ReaderEntry { cancel, task });
            info!(partition = %partition, drained, "partition reader started");
            report.added.push(partition.clone());
        }

        Ok(report)
    }

    /// Cancel every reader and wait for all tailing tasks to finish.
    ///
    /// Later reconciles are no-ops.
    pub async fn shutdown(&self) {
        // Cancel first: a reconcile holding the lock is stuck in a drain
        // until it sees the root token.
        self.root.cancel();
        let mut entries = self.entries.lock().await;
        for (partition, entry) in entries.drain() {
            entry.stop(&partition).await;
        }
    }
}

/// Outcome of a backlog drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drained {
    /// Backlog fully applied; number of records
    Caught(u64),
    /// Registry shut down or view closed before the backlog was done
    Stopped,
}

/// Apply the reader's backlog until it reports none left.
async fn drain<V: TableValue>(
    reader: &mut Box<dyn PartitionReader>,
    sink: &RecordSink<V>,
    cancel: &CancellationToken,
) -> Result<Drained, FetchError> {
    let mut drained = 0u64;
    loop {
        let backlog = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Drained::Stopped),
            backlog = reader.has_backlog() => backlog?,
        };
        if !backlog {
            return Ok(Drained::Caught(drained));
        }

        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Drained::Stopped),
            record = reader.fetch_next() => record?,
        };
        if !sink.apply(&record) {
            return Ok(Drained::Stopped);
        }
        drained += 1;
    }
}

/// Tail one partition until cancelled or its reader closes.
async fn tail<V: TableValue>(
    mut reader: Box<dyn PartitionReader>,
    sink: Arc<RecordSink<V>>,
    cancel: CancellationToken,
) -> TailExit {
    let partition = reader.partition().clone();
    let exit = loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break TailExit::Cancelled,
            fetched = reader.fetch_next() => fetched,
        };

        match fetched {
            Ok(record) => {
                if !sink.apply(&record) {
                    break TailExit::ViewClosed;
                }
            }
            Err(e) if e.is_terminal() => {
                debug!(partition = %partition, "reader finished: {}", e);
                break TailExit::ReaderClosed;
            }
            Err(e) => {
                warn!(partition = %partition, "read next record failed: {}", e);
            }
        }
    };

    reader.close().await;
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JsonDecoder, StringDecoder};
    use crate::source::InMemoryTopicClient;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// One partition that always claims a backlog but never delivers it
    struct StalledClient {
        closed: Arc<AtomicBool>,
    }

    struct StalledReader {
        partition: PartitionId,
        closed: Arc<AtomicBool>,
    }

    impl TopicClient for StalledClient {
        fn partitions<'a>(
            &'a self,
            _topic: &'a str,
        ) -> BoxFuture<'a, Result<Vec<PartitionId>, DiscoveryError>> {
            Box::pin(async { Ok(vec![PartitionId::from("stalled")]) })
        }

        fn open_reader(
            &self,
            options: ReaderOptions,
        ) -> BoxFuture<'_, Result<Box<dyn PartitionReader>, ReaderOpenError>> {
            let reader: Box<dyn PartitionReader> = Box::new(StalledReader {
                partition: options.partition,
                closed: self.closed.clone(),
            });
            Box::pin(async move { Ok(reader) })
        }
    }

    impl PartitionReader for StalledReader {
        fn partition(&self) -> &PartitionId {
            &self.partition
        }

        fn fetch_next(&mut self) -> BoxFuture<'_, Result<Record, FetchError>> {
            Box::pin(futures::future::pending())
        }

        fn has_backlog(&mut self) -> BoxFuture<'_, Result<bool, FetchError>> {
            Box::pin(async { Ok(true) })
        }

        fn close(&mut self) -> BoxFuture<'_, ()> {
            let closed = self.closed.clone();
            Box::pin(async move { closed.store(true, Ordering::SeqCst) })
        }
    }

    fn registry(client: &InMemoryTopicClient, topic: &str) -> (ReaderRegistry<i64>, Arc<StateStore<i64>>) {
        let store = Arc::new(StateStore::new());
        let sink = Arc::new(RecordSink {
            store: store.clone(),
            hub: Arc::new(ListenerHub::new()),
            decoder: Arc::new(JsonDecoder::<i64>::new()),
        });
        let registry = ReaderRegistry::new(
            Arc::new(client.clone()),
            topic.to_string(),
            Some(SchemaType::Json),
            sink,
            CancellationToken::new(),
            Span::none(),
        );
        (registry, store)
    }

    #[tokio::test]
    async fn test_reconcile_drains_backlog() {
        let client = InMemoryTopicClient::new();
        let partitions = client.create_topic("t", 2);
        client.publish(&partitions[0], "a", "1").unwrap();
        client.publish(&partitions[0], "a", "2").unwrap();
        client.publish(&partitions[1], "b", "3").unwrap();

        let (registry, store) = registry(&client, "t");
        let report = registry.refresh().await.unwrap();

        assert_eq!(report.added, partitions);
        assert!(report.removed.is_empty());
        assert_eq!(store.get("a"), Some(2));
        assert_eq!(store.get("b"), Some(3));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let client = InMemoryTopicClient::new();
        let partitions = client.create_topic("t", 3);
        let (registry, _store) = registry(&client, "t");

        registry.reconcile(&partitions).await.unwrap();
        assert_eq!(client.stats().readers_opened, 3);

        let report = registry.reconcile(&partitions).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(client.stats().readers_opened, 3);
        assert_eq!(registry.partitions().await, partitions);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_removed_partition_is_stopped_without_purge() {
        let client = InMemoryTopicClient::new();
        let partitions = client.create_topic("t", 2);
        client.publish(&partitions[1], "gone", "5").unwrap();
        let (registry, store) = registry(&client, "t");
        registry.reconcile(&partitions).await.unwrap();

        let report = registry.reconcile(&partitions[..1]).await.unwrap();
        assert_eq!(report.removed, vec![partitions[1].clone()]);
        assert_eq!(client.stats().readers_closed, 1);
        assert_eq!(store.get("gone"), Some(5));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_failure_keeps_earlier_partitions() {
        let client = InMemoryTopicClient::new();
        let partitions = client.create_topic("t", 2);
        client.fail_open(&partitions[1]);
        let (registry, _store) = registry(&client, "t");

        let err = registry.reconcile(&partitions).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Open { ref partition, .. } if *partition == partitions[1]));
        assert_eq!(registry.partitions().await, vec![partitions[0].clone()]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_discovery_failure() {
        let client = InMemoryTopicClient::new();
        let (registry, _store) = registry(&client, "missing");
        let err = registry.refresh().await.unwrap_err();
        assert!(matches!(err, ReconcileError::Discovery(DiscoveryError::TopicNotFound(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_readers_and_later_reconciles() {
        let client = InMemoryTopicClient::new();
        let partitions = client.create_topic("t", 2);
        let (registry, _store) = registry(&client, "t");
        registry.reconcile(&partitions).await.unwrap();

        registry.shutdown().await;
        assert_eq!(client.stats().readers_closed, 2);
        assert!(registry.partitions().await.is_empty());

        let report = registry.reconcile(&partitions).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(client.stats().readers_opened, 2);
    }

    #[tokio::test]
    async fn test_drain_failure_keeps_earlier_partitions() {
        let client = InMemoryTopicClient::new();
        let partitions = client.create_topic("t", 2);
        client.publish(&partitions[0], "a", "1").unwrap();
        client.publish(&partitions[1], "b", "2").unwrap();
        client.inject_fetch_error(&partitions[1], "disk read failed");
        let (registry, store) = registry(&client, "t");

        let err = registry.reconcile(&partitions).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Drain { ref partition, source: FetchError::Transient(_) }
                if *partition == partitions[1]
        ));
        assert_eq!(registry.partitions().await, vec![partitions[0].clone()]);
        assert_eq!(store.get("a"), Some(1));
        let stats = client.stats();
        assert_eq!(stats.readers_opened, 2);
        assert_eq!(stats.readers_closed, 1);

        // The next pass retries only the failed partition
        let report = registry.reconcile(&partitions).await.unwrap();
        assert_eq!(report.added, vec![partitions[1].clone()]);
        assert_eq!(store.get("b"), Some(2));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_drain_stops_once_view_closed() {
        let client = InMemoryTopicClient::new();
        let partitions = client.create_topic("t", 1);
        client.publish(&partitions[0], "a", "1").unwrap();
        client.publish(&partitions[0], "b", "2").unwrap();

        let store: Arc<StateStore<i64>> = Arc::new(StateStore::new());
        let hub: Arc<ListenerHub<i64>> = Arc::new(ListenerHub::new());
        hub.close();
        let sink = Arc::new(RecordSink {
            store: store.clone(),
            hub,
            decoder: Arc::new(JsonDecoder::<i64>::new()),
        });
        let registry = ReaderRegistry::new(
            Arc::new(client.clone()),
            "t".to_string(),
            Some(SchemaType::Json),
            sink,
            CancellationToken::new(),
            Span::none(),
        );

        let report = registry.refresh().await.unwrap();
        assert!(report.is_empty());
        assert!(store.is_empty());
        assert!(registry.partitions().await.is_empty());
        assert_eq!(client.stats().readers_closed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_interrupts_stalled_drain() {
        let closed = Arc::new(AtomicBool::new(false));
        let sink = Arc::new(RecordSink {
            store: Arc::new(StateStore::<String>::new()),
            hub: Arc::new(ListenerHub::new()),
            decoder: Arc::new(StringDecoder),
        });
        let registry = Arc::new(ReaderRegistry::new(
            Arc::new(StalledClient {
                closed: closed.clone(),
            }),
            "stalled".to_string(),
            None,
            sink,
            CancellationToken::new(),
            Span::none(),
        ));

        let reconciling = tokio::spawn({
            let registry = registry.clone();
            async move { registry.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reconciling.is_finished());

        tokio::time::timeout(Duration::from_secs(2), registry.shutdown())
            .await
            .expect("shutdown waited on a stalled drain");
        let report = reconciling.await.unwrap().unwrap();
        assert!(report.is_empty());
        assert!(closed.load(Ordering::SeqCst));
        assert!(registry.partitions().await.is_empty());
    }
}
