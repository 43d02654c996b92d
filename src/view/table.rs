//! TableView - live key/value view of a compacted topic
//!
//! Construction validates the configuration, runs one reconcile inline (so
//! the view is populated before `build` returns) and starts the topology
//! watcher. Each partition is then tailed by its own task until `close`.
//!
//! ## Example
//!
//! ```no_run
//! # use compacted_view::{TableView, InMemoryTopicClient, SchemaType, JsonDecoder};
//! # use std::sync::Arc;
//! # async fn demo() -> Result<(), compacted_view::TableViewError> {
//! let client = Arc::new(InMemoryTopicClient::new());
//! let view = TableView::<i64>::builder(client)
//!     .topic("balances")
//!     .schema(SchemaType::Json)
//!     .decoder(JsonDecoder::<i64>::new())
//!     .build()
//!     .await?;
//!
//! let balance = view.get("alice");
//! view.close().await;
//! # let _ = balance;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument, Span};

use super::error::{ListenerError, TableViewError};
use super::listeners::ListenerHub;
use super::registry::{ReaderRegistry, ReconcileReport, RecordSink};
use super::store::StateStore;
use super::watcher::{TopologyWatcher, WatcherHandle};
use crate::config::{ConfigError, SchemaType, TableViewConfig};
use crate::schema::{TableValue, ValueDecoder};
use crate::source::{PartitionId, TopicClient};

pub struct TableView<V: TableValue> {
    topic: String,
    store: Arc<StateStore<V>>,
    hub: Arc<ListenerHub<V>>,
    registry: Arc<ReaderRegistry<V>>,
    watcher: Mutex<Option<WatcherHandle>>,
    /// Parent of the watcher and registry tokens
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<V: TableValue> TableView<V> {
    pub fn builder(client: Arc<dyn TopicClient>) -> TableViewBuilder<V> {
        TableViewBuilder::new(client)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn size(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.store.get(key)
    }

    /// Copy of every entry; later updates are not visible through it.
    pub fn entries(&self) -> HashMap<String, V> {
        self.store.snapshot()
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    /// Call `action` for every entry of a snapshot, stopping at the first error.
    pub fn for_each<F, E>(&self, mut action: F) -> Result<(), E>
    where
        F: FnMut(&str, &V) -> Result<(), E>,
    {
        for (key, value) in self.store.snapshot() {
            action(&key, &value)?;
        }
        Ok(())
    }

    /// Call `action` for every current entry, then for every later change.
    ///
    /// Each change is seen exactly once: either in the initial pass or as a
    /// notification. Deletions arrive as `(key, None)`. The action runs
    /// while the view holds its delivery lock, so it must not call
    /// `for_each_and_listen` itself.
    pub fn for_each_and_listen<F>(&self, action: F) -> Result<(), TableViewError>
    where
        F: FnMut(&str, Option<&V>) -> Result<(), ListenerError> + Send + 'static,
    {
        self.hub.snapshot_and_subscribe(&self.store, action)
    }

    /// Partitions currently being tailed
    pub async fn partitions(&self) -> Vec<PartitionId> {
        self.registry.partitions().await
    }

    /// Reconcile against the current topology now instead of waiting for
    /// the next interval.
    pub async fn refresh(&self) -> Result<ReconcileReport, TableViewError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TableViewError::Closed);
        }
        Ok(self.registry.refresh().await?)
    }

    /// Stop the watcher and every reader. Idempotent.
    ///
    /// Once this returns no listener is invoked again and no background
    /// task of this view is running.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.hub.close();
        // Reaches the watcher, every tail task and any drain in progress.
        self.shutdown.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
        self.registry.shutdown().await;
        info!(topic = %self.topic, "table view closed");
    }
}

impl<V: TableValue> Drop for TableView<V> {
    fn drop(&mut self) {
        // Without close(), background tasks are cancelled but not joined.
        self.shutdown.cancel();
    }
}

/// Builder for `TableView`
pub struct TableViewBuilder<V> {
    client: Arc<dyn TopicClient>,
    config: TableViewConfig,
    decoder: Option<Arc<dyn ValueDecoder<V>>>,
    span: Option<Span>,
}

impl<V: TableValue> TableViewBuilder<V> {
    pub fn new(client: Arc<dyn TopicClient>) -> Self {
        TableViewBuilder {
            client,
            config: TableViewConfig::default(),
            decoder: None,
            span: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: TableViewConfig) -> Self {
        self.config = config;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn schema(mut self, schema: SchemaType) -> Self {
        self.config.schema = Some(schema);
        self
    }

    pub fn decoder<D: ValueDecoder<V>>(mut self, decoder: D) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    /// Span every log line and background task of the view runs under.
    /// Defaults to an `info` span named `table_view` tagged with the topic.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    fn resolve_decoder(&self) -> Result<Arc<dyn ValueDecoder<V>>, ConfigError> {
        if self.config.topic.is_empty() {
            return Err(ConfigError::TopicRequired);
        }
        match (self.config.schema, &self.decoder) {
            (Some(schema), None) => Err(ConfigError::MissingValueType(schema)),
            (None, Some(_)) => Err(ConfigError::MissingSchema),
            (Some(schema), Some(decoder)) if decoder.schema_type() != schema => {
                Err(ConfigError::SchemaMismatch {
                    configured: schema,
                    decoder: decoder.schema_type(),
                })
            }
            (Some(_), Some(decoder)) => Ok(decoder.clone()),
            (None, None) => V::raw_decoder().ok_or(ConfigError::MissingSchema),
        }
    }

    /// Validate, populate and start the view.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<TableView<V>, TableViewError> {
        let decoder = self.resolve_decoder()?;
        let topic = self.config.topic.clone();
        let span = self
            .span
            .unwrap_or_else(|| info_span!("table_view", topic = %topic));

        let store = Arc::new(StateStore::new());
        let hub = Arc::new(ListenerHub::new());
        let sink = Arc::new(RecordSink {
            store: store.clone(),
            hub: hub.clone(),
            decoder,
        });

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ReaderRegistry::new(
            self.client,
            topic.clone(),
            self.config.schema,
            sink,
            shutdown.child_token(),
            span.clone(),
        ));

        // Populate before returning so the view is immediately queryable.
        let initial = registry.refresh().instrument(span.clone()).await;
        if let Err(e) = initial {
            registry.shutdown().await;
            return Err(e.into());
        }

        let watcher = TopologyWatcher::new(
            registry.clone(),
            self.config.effective_refresh_interval(),
            shutdown.child_token(),
        )
        .spawn(span.clone());

        info!(parent: &span, size = store.len(), "table view started");

        Ok(TableView {
            topic,
            store,
            hub,
            registry,
            watcher: Mutex::new(Some(watcher)),
            shutdown,
            closed: AtomicBool::new(false),
        })
    }
}
