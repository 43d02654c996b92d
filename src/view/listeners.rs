//! Listener registry and change delivery
//!
//! The hub lock is the single ordering point of the view: every record is
//! applied to the store *and* delivered to listeners while it is held, and
//! `snapshot_and_subscribe` copies the store and registers its action under
//! the same lock. A new subscriber therefore sees each record exactly once,
//! either in its snapshot or as a notification.
//!
//! Lock order is hub -> store. Nothing takes the store lock and then the hub.

use parking_lot::Mutex;
use tracing::warn;

use super::error::{ListenerError, TableViewError};
use super::store::{Applied, StateStore};
use crate::schema::{TableValue, ValueDecoder};
use crate::source::Record;

/// Subscriber callback. A tombstone is delivered as `(key, None)`.
pub type Listener<V> = Box<dyn FnMut(&str, Option<&V>) -> Result<(), ListenerError> + Send>;

struct HubState<V> {
    listeners: Vec<Listener<V>>,
    closed: bool,
}

pub struct ListenerHub<V> {
    state: Mutex<HubState<V>>,
}

impl<V: TableValue> ListenerHub<V> {
    pub fn new() -> Self {
        ListenerHub {
            state: Mutex::new(HubState {
                listeners: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `record` to `store` and notify every listener of the change.
    ///
    /// Returns false once the hub is closed; the record is then dropped
    /// without touching the store.
    pub fn publish(
        &self,
        store: &StateStore<V>,
        record: &Record,
        decoder: &dyn ValueDecoder<V>,
    ) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        match store.apply_record(record, decoder) {
            Applied::Upsert(value) => notify_locked(&mut state, &record.key, Some(&value)),
            Applied::Delete => notify_locked(&mut state, &record.key, None),
            Applied::Skipped => {}
        }
        true
    }

    /// Deliver `(key, value)` to every listener in subscription order.
    pub fn notify(&self, key: &str, value: Option<&V>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        notify_locked(&mut state, key, value);
    }

    /// Run `action` over every entry of `store`, then register it for all
    /// future changes.
    ///
    /// Stops at the first error from `action` and does not register it.
    pub fn snapshot_and_subscribe<F>(
        &self,
        store: &StateStore<V>,
        mut action: F,
    ) -> Result<(), TableViewError>
    where
        F: FnMut(&str, Option<&V>) -> Result<(), ListenerError> + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TableViewError::Closed);
        }

        // Holding the hub lock keeps publishers out, so the copy is the live state.
        for (key, value) in store.snapshot() {
            action(&key, Some(&value)).map_err(TableViewError::Listener)?;
        }

        state.listeners.push(Box::new(action));
        Ok(())
    }

    /// Stop all delivery and drop every listener.
    ///
    /// Waits for an in-flight notification to finish, so no listener runs
    /// after this returns.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
    }
}

impl<V: TableValue> Default for ListenerHub<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn notify_locked<V>(state: &mut HubState<V>, key: &str, value: Option<&V>) {
    for (index, listener) in state.listeners.iter_mut().enumerate() {
        if let Err(e) = listener(key, value) {
            warn!(key, listener = index, "table view listener failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StringDecoder;
    use crate::source::PartitionId;
    use bytes::Bytes;
    use std::sync::Arc;

    type Events = Arc<Mutex<Vec<(String, Option<String>)>>>;

    fn record(key: &str, payload: &'static [u8]) -> Record {
        Record {
            partition: PartitionId::from("t"),
            key: key.to_string(),
            payload: Bytes::from_static(payload),
            offset: 0,
        }
    }

    fn recorder(events: &Events) -> impl FnMut(&str, Option<&String>) -> Result<(), ListenerError> + Send + 'static {
        let events = events.clone();
        move |k, v| {
            events.lock().push((k.to_string(), v.cloned()));
            Ok(())
        }
    }

    #[test]
    fn test_snapshot_then_notifications() {
        let store: StateStore<String> = StateStore::new();
        let hub = ListenerHub::new();
        hub.publish(&store, &record("a", b"1"), &StringDecoder);
        hub.publish(&store, &record("b", b"2"), &StringDecoder);

        let events: Events = Arc::new(Mutex::new(Vec::new()));
        hub.snapshot_and_subscribe(&store, recorder(&events)).unwrap();

        let mut snapshot = events.lock().clone();
        snapshot.sort();
        assert_eq!(
            snapshot,
            vec![
                ("a".to_string(), Some("1".to_string())),
                ("b".to_string(), Some("2".to_string())),
            ]
        );

        hub.publish(&store, &record("a", b""), &StringDecoder);
        hub.publish(&store, &record("c", b"3"), &StringDecoder);

        let events = events.lock();
        assert_eq!(events.len(), 4);
        assert_eq!(events[2], ("a".to_string(), None));
        assert_eq!(events[3], ("c".to_string(), Some("3".to_string())));
    }

    #[test]
    fn test_failing_listener_does_not_block_others() {
        let store: StateStore<String> = StateStore::new();
        let hub = ListenerHub::new();
        hub.snapshot_and_subscribe(&store, |_k: &str, _v: Option<&String>| Err("boom".into()))
            .unwrap();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        hub.snapshot_and_subscribe(&store, recorder(&events)).unwrap();

        hub.publish(&store, &record("a", b"1"), &StringDecoder);
        assert_eq!(events.lock().len(), 1);
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn test_snapshot_error_skips_registration() {
        let store: StateStore<String> = StateStore::new();
        let hub = ListenerHub::new();
        hub.publish(&store, &record("a", b"1"), &StringDecoder);

        let result = hub.snapshot_and_subscribe(&store, |_k: &str, _v: Option<&String>| {
            Err("reject".into())
        });
        assert!(matches!(result, Err(TableViewError::Listener(_))));
        assert!(hub.is_empty());
    }

    #[test]
    fn test_skipped_record_is_not_delivered() {
        let store: StateStore<String> = StateStore::new();
        let hub = ListenerHub::new();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        hub.snapshot_and_subscribe(&store, recorder(&events)).unwrap();

        let bad = Record {
            payload: Bytes::from_static(&[0xff]),
            ..record("a", b"")
        };
        hub.publish(&store, &bad, &StringDecoder);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_closed_hub_drops_records() {
        let store: StateStore<String> = StateStore::new();
        let hub = ListenerHub::new();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        hub.snapshot_and_subscribe(&store, recorder(&events)).unwrap();

        hub.close();
        assert!(!hub.publish(&store, &record("a", b"1"), &StringDecoder));
        assert!(store.is_empty());
        assert!(events.lock().is_empty());
        assert!(matches!(
            hub.snapshot_and_subscribe(&store, recorder(&events)),
            Err(TableViewError::Closed)
        ));
    }
}
