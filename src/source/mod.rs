//! Topic Source Abstraction
//!
//! The table view never talks to a broker directly. It consumes two seams:
//!
//! - `TopicClient`: enumerates the partitions of a topic and opens readers
//! - `PartitionReader`: sequential reader over one partition
//!
//! Implementations:
//! - `InMemoryTopicClient`: in-process compacted broker for tests and demos
//!
//! Both traits return boxed futures so they stay object-safe and can be
//! shared as `Arc<dyn TopicClient>` across the background tasks.

pub mod memory;

pub use memory::{InMemoryTopicClient, BrokerStats};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SchemaType;

/// Identifier of one physical partition of a topic.
///
/// For an unpartitioned topic this is the topic name itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(name: impl Into<String>) -> Self {
        PartitionId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        PartitionId(s.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(s: String) -> Self {
        PartitionId(s)
    }
}

/// Name of the `index`-th partition of a partitioned topic.
pub fn partition_name(topic: &str, index: u32) -> PartitionId {
    PartitionId(format!("{}-partition-{}", topic, index))
}

/// An inbound keyed message. An empty payload is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub partition: PartitionId,
    pub key: String,
    pub payload: Bytes,
    /// Position of the record within its partition
    pub offset: u64,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Where a freshly opened reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartPosition {
    #[default]
    Earliest,
    Latest,
}

/// Options for opening a partition reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderOptions {
    pub partition: PartitionId,
    pub start: StartPosition,
    /// Surface only the latest retained record per key for the backlog
    pub read_compacted: bool,
    pub schema: Option<SchemaType>,
}

impl ReaderOptions {
    /// Catch-up options used by the table view: earliest, compacted.
    pub fn compacted(partition: PartitionId, schema: Option<SchemaType>) -> Self {
        ReaderOptions {
            partition,
            start: StartPosition::Earliest,
            read_compacted: true,
            schema,
        }
    }
}

/// Error returned when the partitions of a topic cannot be enumerated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Topic does not exist
    TopicNotFound(String),
    /// Broker could not be reached or refused the lookup
    Unavailable(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::TopicNotFound(topic) => write!(f, "topic not found: {}", topic),
            DiscoveryError::Unavailable(msg) => write!(f, "partition discovery failed: {}", msg),
        }
    }
}

impl std::error::Error for DiscoveryError {}

/// Error returned when a partition reader cannot be opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderOpenError {
    PartitionNotFound(PartitionId),
    Connection(String),
}

impl fmt::Display for ReaderOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderOpenError::PartitionNotFound(p) => write!(f, "partition not found: {}", p),
            ReaderOpenError::Connection(msg) => write!(f, "reader connection failed: {}", msg),
        }
    }
}

impl std::error::Error for ReaderOpenError {}

/// Error returned by `PartitionReader::fetch_next`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The fetch was cancelled by its caller
    Cancelled,
    /// The reader or its partition has been closed
    Closed,
    /// Anything else; the caller may retry
    Transient(String),
}

impl FetchError {
    /// Whether the error ends a tailing loop (as opposed to being retried).
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchError::Cancelled | FetchError::Closed)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Cancelled => write!(f, "fetch cancelled"),
            FetchError::Closed => write!(f, "reader closed"),
            FetchError::Transient(msg) => write!(f, "fetch failed: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// Sequential reader over one partition.
///
/// `fetch_next` may wait indefinitely for new data. Callers that need to
/// stop waiting drop the returned future; implementations must leave the
/// reader usable (or closed) when that happens.
pub trait PartitionReader: Send + 'static {
    /// Partition this reader is attached to
    fn partition(&self) -> &PartitionId;

    /// Next record in partition order.
    fn fetch_next(&mut self) -> BoxFuture<'_, Result<Record, FetchError>>;

    /// Whether records published before this call are still unread.
    fn has_backlog(&mut self) -> BoxFuture<'_, Result<bool, FetchError>>;

    /// Release the reader. Further fetches fail with `FetchError::Closed`.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Broker-facing client used to discover partitions and open readers.
pub trait TopicClient: Send + Sync + 'static {
    /// Current partitions of `topic`, in no particular order.
    fn partitions<'a>(
        &'a self,
        topic: &'a str,
    ) -> BoxFuture<'a, Result<Vec<PartitionId>, DiscoveryError>>;

    /// Open a reader on one partition.
    fn open_reader(
        &self,
        options: ReaderOptions,
    ) -> BoxFuture<'_, Result<Box<dyn PartitionReader>, ReaderOpenError>>;
}
