//! In-memory topic broker
//!
//! A process-local stand-in for a log-compacted broker, used by the tests
//! and the demo binary. Topics are made of append-only partition logs;
//! readers opened with `read_compacted` see the latest record per key for
//! everything published before they opened, then tail new records in order.
//!
//! Fault injection:
//! - `fail_discovery`: partition enumeration returns `Unavailable`
//! - `fail_open`: opening a reader on one partition fails
//! - `inject_fetch_error`: the next fetch on a partition fails transiently

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{
    partition_name, DiscoveryError, FetchError, PartitionId, PartitionReader, ReaderOpenError,
    ReaderOptions, Record, StartPosition, TopicClient,
};

/// Counters exposed for assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub readers_opened: u64,
    pub readers_closed: u64,
    pub records_published: u64,
}

struct PartitionLog {
    id: PartitionId,
    records: Mutex<Vec<Record>>,
    closed: AtomicBool,
    /// Woken on every append and on removal
    changed: Notify,
    pending_errors: Mutex<VecDeque<String>>,
}

impl PartitionLog {
    fn new(id: PartitionId) -> Arc<Self> {
        Arc::new(PartitionLog {
            id,
            records: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            changed: Notify::new(),
            pending_errors: Mutex::new(VecDeque::new()),
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Latest record per key among the first `end` records, tombstoned keys
    /// dropped, in log order.
    fn compacted(&self, end: usize) -> VecDeque<Record> {
        let records = self.records.lock();
        let mut latest: HashMap<&str, usize> = HashMap::new();
        for (index, record) in records[..end].iter().enumerate() {
            latest.insert(record.key.as_str(), index);
        }
        let mut keep: Vec<usize> = latest.into_values().collect();
        keep.sort_unstable();
        keep.into_iter()
            .map(|index| records[index].clone())
            .filter(|record| !record.is_tombstone())
            .collect()
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Arc<PartitionLog>>>,
    failing_opens: HashSet<PartitionId>,
    discovery_error: Option<String>,
    stats: BrokerStats,
}

impl BrokerState {
    fn find(&self, partition: &PartitionId) -> Option<Arc<PartitionLog>> {
        self.topics
            .values()
            .flatten()
            .find(|log| log.id == *partition)
            .cloned()
    }
}

/// In-memory broker implementing `TopicClient`
#[derive(Clone, Default)]
pub struct InMemoryTopicClient {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryTopicClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a topic.
    ///
    /// With `partitions == 0` the topic is unpartitioned and its single
    /// partition is named after the topic.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Vec<PartitionId> {
        let logs: Vec<Arc<PartitionLog>> = if partitions == 0 {
            vec![PartitionLog::new(PartitionId::from(topic))]
        } else {
            (0..partitions)
                .map(|i| PartitionLog::new(partition_name(topic, i)))
                .collect()
        };
        let ids = logs.iter().map(|log| log.id.clone()).collect();

        if let Some(old) = self.state.lock().topics.insert(topic.to_string(), logs) {
            for log in old {
                log.close();
            }
        }
        ids
    }

    /// Append `count` partitions to a partitioned topic.
    pub fn add_partitions(&self, topic: &str, count: u32) -> Vec<PartitionId> {
        let mut state = self.state.lock();
        let logs = state.topics.entry(topic.to_string()).or_default();
        // Indices continue after the highest existing one.
        let next = logs
            .iter()
            .filter_map(|log| log.id.as_str().rsplit("-partition-").next()?.parse::<u32>().ok())
            .map(|i| i + 1)
            .max()
            .unwrap_or(0);

        (next..next + count)
            .map(|i| {
                let log = PartitionLog::new(partition_name(topic, i));
                let id = log.id.clone();
                logs.push(log);
                id
            })
            .collect()
    }

    /// Drop a partition from its topic. Open readers fail with `Closed`.
    pub fn remove_partition(&self, partition: &PartitionId) -> bool {
        let mut state = self.state.lock();
        for logs in state.topics.values_mut() {
            if let Some(pos) = logs.iter().position(|log| log.id == *partition) {
                logs.remove(pos).close();
                return true;
            }
        }
        false
    }

    /// Append a record. Returns its offset, or `None` if the partition does
    /// not exist.
    pub fn publish(&self, partition: &PartitionId, key: &str, payload: impl Into<Bytes>) -> Option<u64> {
        let log = self.state.lock().find(partition)?;
        let offset = {
            let mut records = log.records.lock();
            let offset = records.len() as u64;
            records.push(Record {
                partition: partition.clone(),
                key: key.to_string(),
                payload: payload.into(),
                offset,
            });
            offset
        };
        self.state.lock().stats.records_published += 1;
        log.changed.notify_waiters();
        Some(offset)
    }

    /// Append a tombstone for `key`.
    pub fn tombstone(&self, partition: &PartitionId, key: &str) -> Option<u64> {
        self.publish(partition, key, Bytes::new())
    }

    pub fn fail_discovery(&self, message: Option<&str>) {
        self.state.lock().discovery_error = message.map(str::to_string);
    }

    pub fn fail_open(&self, partition: &PartitionId) {
        self.state.lock().failing_opens.insert(partition.clone());
    }

    pub fn allow_open(&self, partition: &PartitionId) {
        self.state.lock().failing_opens.remove(partition);
    }

    /// Make the next fetch on `partition` fail with a transient error.
    pub fn inject_fetch_error(&self, partition: &PartitionId, message: &str) -> bool {
        match self.state.lock().find(partition) {
            Some(log) => {
                log.pending_errors.lock().push_back(message.to_string());
                log.changed.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }
}

impl TopicClient for InMemoryTopicClient {
    fn partitions<'a>(
        &'a self,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<Vec<PartitionId>, DiscoveryError>> {
        Box::pin(async move {
            let state = self.state.lock();
            if let Some(msg) = &state.discovery_error {
                return Err(DiscoveryError::Unavailable(msg.clone()));
            }
            state
                .topics
                .get(topic)
                .map(|logs| logs.iter().map(|log| log.id.clone()).collect())
                .ok_or_else(|| DiscoveryError::TopicNotFound(topic.to_string()))
        })
    }

    fn open_reader(
        &self,
        options: ReaderOptions,
    ) -> BoxFuture<'_, Result<Box<dyn PartitionReader>, ReaderOpenError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.failing_opens.contains(&options.partition) {
                return Err(ReaderOpenError::Connection(format!(
                    "broker refused reader for {}",
                    options.partition
                )));
            }
            let log = state
                .find(&options.partition)
                .ok_or_else(|| ReaderOpenError::PartitionNotFound(options.partition.clone()))?;
            state.stats.readers_opened += 1;
            drop(state);

            let end = log.records.lock().len();
            let (backlog, position) = match (options.start, options.read_compacted) {
                (StartPosition::Earliest, true) => (log.compacted(end), end),
                (StartPosition::Earliest, false) => (VecDeque::new(), 0),
                (StartPosition::Latest, _) => (VecDeque::new(), end),
            };

            let reader: Box<dyn PartitionReader> = Box::new(InMemoryPartitionReader {
                log,
                backlog,
                position,
                closed: false,
                broker: self.state.clone(),
            });
            Ok(reader)
        })
    }
}

struct InMemoryPartitionReader {
    log: Arc<PartitionLog>,
    /// Compacted records still to deliver before tailing from `position`
    backlog: VecDeque<Record>,
    position: usize,
    closed: bool,
    broker: Arc<Mutex<BrokerState>>,
}

impl InMemoryPartitionReader {
    fn ensure_open(&self) -> Result<(), FetchError> {
        if self.closed || self.log.closed.load(Ordering::SeqCst) {
            Err(FetchError::Closed)
        } else {
            Ok(())
        }
    }

    fn try_next(&mut self) -> Result<Option<Record>, FetchError> {
        self.ensure_open()?;
        if let Some(msg) = self.log.pending_errors.lock().pop_front() {
            return Err(FetchError::Transient(msg));
        }
        if let Some(record) = self.backlog.pop_front() {
            return Ok(Some(record));
        }
        let records = self.log.records.lock();
        match records.get(self.position) {
            Some(record) => {
                self.position += 1;
                Ok(Some(record.clone()))
            }
            None => Ok(None),
        }
    }
}

impl PartitionReader for InMemoryPartitionReader {
    fn partition(&self) -> &PartitionId {
        &self.log.id
    }

    fn fetch_next(&mut self) -> BoxFuture<'_, Result<Record, FetchError>> {
        Box::pin(async move {
            let log = self.log.clone();
            loop {
                // Register interest before checking so an append in between
                // still wakes us.
                let changed = log.changed.notified();
                if let Some(record) = self.try_next()? {
                    return Ok(record);
                }
                changed.await;
            }
        })
    }

    fn has_backlog(&mut self) -> BoxFuture<'_, Result<bool, FetchError>> {
        Box::pin(async move {
            self.ensure_open()?;
            Ok(!self.backlog.is_empty() || self.position < self.log.records.lock().len())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                self.broker.lock().stats.readers_closed += 1;
            }
        })
    }
}
