//! Table view errors

use std::fmt;

use super::registry::ReconcileError;
use crate::config::ConfigError;

/// Error returned by a listener or `for_each` action
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub enum TableViewError {
    /// Invalid configuration, detected at construction
    Config(ConfigError),
    /// Partition discovery or reader setup failed
    Reconcile(ReconcileError),
    /// A `for_each_and_listen` action failed during its snapshot pass
    Listener(ListenerError),
    /// The view has been closed
    Closed,
}

impl fmt::Display for TableViewError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableViewError::Config(e) => write!(f, "table view configuration error: {}", e),
            TableViewError::Reconcile(e) => write!(f, "table view reconcile failed: {}", e),
            TableViewError::Listener(e) => write!(f, "table view action failed: {}", e),
            TableViewError::Closed => write!(f, "table view is closed"),
        }
    }
}

impl std::error::Error for TableViewError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TableViewError::Config(e) => Some(e),
            TableViewError::Reconcile(e) => Some(e),
            TableViewError::Listener(e) => Some(e.as_ref()),
            TableViewError::Closed => None,
        }
    }
}

impl From<ConfigError> for TableViewError {
    fn from(e: ConfigError) -> Self {
        TableViewError::Config(e)
    }
}

impl From<ReconcileError> for TableViewError {
    fn from(e: ReconcileError) -> Self {
        TableViewError::Reconcile(e)
    }
}
