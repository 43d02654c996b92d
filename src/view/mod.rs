//! Table View Engine
//!
//! Folds a log-compacted, possibly multi-partition topic into a live
//! latest-value-per-key map.
//!
//! ## Architecture
//!
//! ```text
//! TopologyWatcher ──(interval)──► ReaderRegistry.reconcile
//!                                      │ one task per partition
//!                                      ▼
//!                        PartitionReader ──► ListenerHub.publish
//!                                              │ apply + notify
//!                                              ▼
//!                                 StateStore ◄── TableView reads
//! ```
//!
//! ## Key Properties
//!
//! - **Per-partition order**: each partition is applied by a single task
//! - **Snapshot + subscribe**: no change is missed or repeated across the
//!   boundary of `for_each_and_listen`
//! - **Bounded close**: every tailing task is cancelled and joined

pub mod error;
pub mod listeners;
pub mod registry;
pub mod store;
pub mod table;
pub mod watcher;

pub use error::{ListenerError, TableViewError};
pub use listeners::{Listener, ListenerHub};
pub use registry::{ReaderRegistry, ReconcileError, ReconcileReport, TailExit};
pub use store::{Applied, StateStore};
pub use table::{TableView, TableViewBuilder};
pub use watcher::{TopologyWatcher, WatcherHandle};
