//! Latest-value-per-key state
//!
//! Every read and every `apply_record` runs inside the same critical
//! section, so a reader observes each key either before or after a given
//! record, never halfway.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::warn;

use crate::schema::{TableValue, ValueDecoder};
use crate::source::Record;

/// Outcome of applying one record
#[derive(Debug, Clone, PartialEq)]
pub enum Applied<V> {
    /// Key inserted or overwritten with this value
    Upsert(V),
    /// Tombstone; the key is gone (it may not have existed)
    Delete,
    /// Payload failed to decode; the prior value was kept
    Skipped,
}

pub struct StateStore<V> {
    data: Mutex<HashMap<String, V>>,
}

impl<V: TableValue> StateStore<V> {
    pub fn new() -> Self {
        StateStore {
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.lock().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.data.lock().get(key).cloned()
    }

    /// Independent copy of every entry
    pub fn snapshot(&self) -> HashMap<String, V> {
        self.data.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.lock().keys().cloned().collect()
    }

    /// Fold one record into the map.
    ///
    /// A payload that fails to decode is logged and skipped: the key keeps
    /// whatever value it had before.
    pub fn apply_record(&self, record: &Record, decoder: &dyn ValueDecoder<V>) -> Applied<V> {
        if record.is_tombstone() {
            self.data.lock().remove(&record.key);
            return Applied::Delete;
        }

        // Decode outside the lock; only the map update is critical.
        match decoder.decode(&record.payload) {
            Ok(value) => {
                self.data.lock().insert(record.key.clone(), value.clone());
                Applied::Upsert(value)
            }
            Err(e) => {
                warn!(
                    partition = %record.partition,
                    key = %record.key,
                    offset = record.offset,
                    "skipping record with undecodable payload: {}",
                    e
                );
                Applied::Skipped
            }
        }
    }
}

impl<V: TableValue> Default for StateStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JsonDecoder, StringDecoder};
    use crate::source::PartitionId;
    use bytes::Bytes;

    fn record(key: &str, payload: &'static [u8]) -> Record {
        Record {
            partition: PartitionId::from("t"),
            key: key.to_string(),
            payload: Bytes::from_static(payload),
            offset: 0,
        }
    }

    #[test]
    fn test_last_write_wins() {
        let store: StateStore<i64> = StateStore::new();
        let decoder = JsonDecoder::<i64>::new();
        for payload in [&b"1"[..], b"2", b"3"] {
            let rec = Record {
                payload: Bytes::copy_from_slice(payload),
                ..record("a", b"")
            };
            store.apply_record(&rec, &decoder);
        }
        assert_eq!(store.get("a"), Some(3));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_tombstone_removes_key() {
        let store: StateStore<String> = StateStore::new();
        let decoder = StringDecoder;
        store.apply_record(&record("a", b"x"), &decoder);
        store.apply_record(&record("b", b"y"), &decoder);

        assert_eq!(store.apply_record(&record("a", b""), &decoder), Applied::Delete);
        assert!(!store.contains_key("a"));
        assert_eq!(store.keys(), vec!["b".to_string()]);
        assert!(!store.snapshot().contains_key("a"));

        // Deleting an absent key is a no-op
        assert_eq!(store.apply_record(&record("zz", b""), &decoder), Applied::Delete);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_decode_failure_keeps_prior_value() {
        let store: StateStore<i64> = StateStore::new();
        let decoder = JsonDecoder::<i64>::new();
        store.apply_record(&record("a", b"7"), &decoder);

        assert_eq!(store.apply_record(&record("a", b"not json"), &decoder), Applied::Skipped);
        assert_eq!(store.get("a"), Some(7));

        assert_eq!(store.apply_record(&record("b", b"{"), &decoder), Applied::Skipped);
        assert!(!store.contains_key("b"));
    }

    #[test]
    fn test_snapshot_is_independent() {
        let store: StateStore<String> = StateStore::new();
        let decoder = StringDecoder;
        store.apply_record(&record("a", b"1"), &decoder);

        let snapshot = store.snapshot();
        store.apply_record(&record("a", b"2"), &decoder);
        store.apply_record(&record("b", b"3"), &decoder);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a").map(String::as_str), Some("1"));
        assert_eq!(store.len(), 2);
    }
}
