//! # Store-and-Forward Message Queue
//!
//! Durable keyed FIFO holding messages the router could not deliver.
//! Backed by a sled tree: entries are keyed `<queue-key>/<seq>` where the
//! sequence number is a database-generated monotonic counter, so iterating
//! a key's prefix yields insertion order.
//!
//! The router enqueues under the recipient's fingerprint string (or, for
//! node cookies, the responsible hub's), and flush passes drain either one
//! key or the whole store, re-routing every drained message.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

use crate::messages::Message;

/// Tree name for held messages.
const HELD_TREE: &str = "held_messages";

/// Maximum size of a stored record; matches the wire record limit.
const MAX_RECORD_SIZE: u64 = (crate::messages::MAX_WIRE_MESSAGE as u64) + 4096;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sled::Error),
    #[error("queue record serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM from a
/// corrupted store.
fn record_options() -> impl bincode::Options {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_limit(MAX_RECORD_SIZE)
        .with_fixint_encoding()
}

fn serialize_record<T: Serialize>(value: &T) -> Result<Vec<u8>, QueueError> {
    use bincode::Options;
    Ok(record_options().serialize(value)?)
}

fn deserialize_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, QueueError> {
    use bincode::Options;
    Ok(record_options().deserialize(bytes)?)
}

/// Durable keyed FIFO for undeliverable messages.
pub struct MessageQueue {
    db: sled::Db,
    held: sled::Tree,
}

impl MessageQueue {
    /// Open (or create) the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        let db = sled::open(path)?;
        let held = db.open_tree(HELD_TREE)?;
        Ok(Self { db, held })
    }

    /// In-memory queue for tests and ephemeral hubs.
    pub fn open_temporary() -> Result<Self, QueueError> {
        let db = sled::Config::new().temporary(true).open()?;
        let held = db.open_tree(HELD_TREE)?;
        Ok(Self { db, held })
    }

    fn entry_key(&self, key: &str) -> Result<Vec<u8>, QueueError> {
        let seq = self.db.generate_id()?;
        let mut entry = Vec::with_capacity(key.len() + 1 + 8);
        entry.extend_from_slice(key.as_bytes());
        entry.push(b'/');
        entry.extend_from_slice(&seq.to_be_bytes());
        Ok(entry)
    }

    /// Append a message under the given key.
    pub fn enqueue(&self, key: &str, message: &Message) -> Result<(), QueueError> {
        let entry = self.entry_key(key)?;
        let record = serialize_record(message)?;
        self.held.insert(entry, record)?;
        self.held.flush()?;
        Ok(())
    }

    /// Remove and return the oldest message held under `key`.
    ///
    /// Safe under concurrent enqueue and concurrent dequeue: an entry
    /// claimed by another caller is skipped and the scan continues.
    pub fn dequeue_by_key(&self, key: &str) -> Result<Option<Message>, QueueError> {
        let mut prefix = Vec::with_capacity(key.len() + 1);
        prefix.extend_from_slice(key.as_bytes());
        prefix.push(b'/');

        for item in self.held.scan_prefix(&prefix) {
            let (entry, record) = item?;
            if self.held.remove(&entry)?.is_some() {
                return Ok(Some(deserialize_record(&record)?));
            }
        }
        Ok(None)
    }

    /// Remove and return the oldest message from any key.
    pub fn dequeue(&self) -> Result<Option<(String, Message)>, QueueError> {
        for item in self.held.iter() {
            let (entry, record) = item?;
            if self.held.remove(&entry)?.is_some() {
                let key = entry
                    .iter()
                    .position(|&b| b == b'/')
                    .map(|split| String::from_utf8_lossy(&entry[..split]).into_owned())
                    .unwrap_or_default();
                return Ok(Some((key, deserialize_record(&record)?)));
            }
        }
        Ok(None)
    }

    /// Distinct keys currently holding messages.
    pub fn keys(&self) -> Result<Vec<String>, QueueError> {
        let mut keys = Vec::new();
        for item in self.held.iter() {
            let (entry, _) = item?;
            if let Some(split) = entry.iter().position(|&b| b == b'/') {
                let key = String::from_utf8_lossy(&entry[..split]).into_owned();
                if keys.last() != Some(&key) {
                    keys.push(key);
                }
            }
        }
        keys.dedup();
        Ok(keys)
    }

    /// Number of held messages across all keys.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyRing;
    use crate::messages::MessageCode;

    fn message(ttl: i32, payload: &[u8]) -> Message {
        Message::new(
            KeyRing::generate().peer_id(),
            ttl,
            MessageCode::Application,
            payload.to_vec(),
        )
    }

    #[test]
    fn fifo_order_per_key() {
        let queue = MessageQueue::open_temporary().expect("open");
        let a = message(5, b"first");
        let b = message(5, b"second");
        let c = message(5, b"third");
        queue.enqueue("peer-x", &a).expect("enqueue");
        queue.enqueue("peer-x", &b).expect("enqueue");
        queue.enqueue("peer-x", &c).expect("enqueue");

        assert_eq!(queue.dequeue_by_key("peer-x").expect("dequeue"), Some(a));
        assert_eq!(queue.dequeue_by_key("peer-x").expect("dequeue"), Some(b));
        assert_eq!(queue.dequeue_by_key("peer-x").expect("dequeue"), Some(c));
        assert_eq!(queue.dequeue_by_key("peer-x").expect("dequeue"), None);
    }

    #[test]
    fn keys_are_isolated() {
        let queue = MessageQueue::open_temporary().expect("open");
        let for_x = message(1, b"to x");
        let for_y = message(1, b"to y");
        queue.enqueue("x", &for_x).expect("enqueue");
        queue.enqueue("y", &for_y).expect("enqueue");

        assert_eq!(queue.dequeue_by_key("y").expect("dequeue"), Some(for_y));
        assert_eq!(queue.dequeue_by_key("y").expect("dequeue"), None);
        assert_eq!(queue.dequeue_by_key("x").expect("dequeue"), Some(for_x));
    }

    #[test]
    fn unkeyed_dequeue_reports_key() {
        let queue = MessageQueue::open_temporary().expect("open");
        let held = message(3, b"held");
        queue.enqueue("somepeer", &held).expect("enqueue");

        let (key, drained) = queue.dequeue().expect("dequeue").expect("entry");
        assert_eq!(key, "somepeer");
        assert_eq!(drained, held);
        assert!(queue.dequeue().expect("dequeue").is_none());
    }

    #[test]
    fn keys_lists_distinct_keys() {
        let queue = MessageQueue::open_temporary().expect("open");
        queue.enqueue("a", &message(1, b"1")).expect("enqueue");
        queue.enqueue("a", &message(1, b"2")).expect("enqueue");
        queue.enqueue("b", &message(1, b"3")).expect("enqueue");

        let mut keys = queue.keys().expect("keys");
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let held = message(9, b"durable");
        {
            let queue = MessageQueue::open(dir.path()).expect("open");
            queue.enqueue("k", &held).expect("enqueue");
        }
        let queue = MessageQueue::open(dir.path()).expect("reopen");
        assert_eq!(
            queue.dequeue_by_key("k").expect("dequeue"),
            Some(held),
            "held messages must survive a restart"
        );
    }
}
