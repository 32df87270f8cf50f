//! Ring buffer of outbound SSE events, keyed by a monotonic id, so a
//! reconnecting client can replay what it missed via `Last-Event-ID`.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_EVENT_RETENTION: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: String,
    pub event_type: String,
    pub data: String,
}

/// Bounded FIFO of events for one transport instance. Ids are strictly
/// increasing; eviction is strictly oldest-first once retention is exceeded.
pub struct EventStore {
    retention: usize,
    next_id: AtomicU64,
    events: RwLock<VecDeque<StoredEvent>>,
}

impl EventStore {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            next_id: AtomicU64::new(1),
            events: RwLock::new(VecDeque::new()),
        }
    }

    /// Assign the next id, append, and evict the head if over capacity.
    pub fn append(&self, event_type: &str, data: impl Into<String>) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let event = StoredEvent {
            id: id.clone(),
            event_type: event_type.to_string(),
            data: data.into(),
        };
        let mut events = self.events.write().expect("event store lock poisoned");
        events.push_back(event);
        while events.len() > self.retention {
            events.pop_front();
        }
        id
    }

    /// Events with id strictly greater than `last_id`, oldest first. A cursor
    /// that predates the oldest retained event starts the replay there; the
    /// client silently skips the gap.
    pub fn replay_after(&self, last_id: &str) -> Vec<StoredEvent> {
        let cursor: u64 = last_id.trim().parse().unwrap_or(0);
        let events = self.events.read().expect("event store lock poisoned");
        events
            .iter()
            .filter(|e| e.id.parse::<u64>().map(|n| n > cursor).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().expect("event store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_strictly_increasing() {
        let store = EventStore::new(10);
        let ids: Vec<u64> = (0..5)
            .map(|i| store.append("message", format!("e{i}")).parse().unwrap())
            .collect();
        for pair in ids.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn test_eviction_is_oldest_first() {
        let store = EventStore::new(3);
        for i in 0..5 {
            store.append("message", format!("e{i}"));
        }
        assert_eq!(store.len(), 3);
        let retained = store.replay_after("0");
        assert_eq!(
            retained.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["3", "4", "5"]
        );
    }

    #[test]
    fn test_replay_after_mid_buffer() {
        let store = EventStore::new(100);
        for i in 1..=100 {
            store.append("message", format!("e{i}"));
        }
        let replayed = store.replay_after("37");
        assert_eq!(replayed.len(), 63);
        assert_eq!(replayed.first().unwrap().id, "38");
        assert_eq!(replayed.last().unwrap().id, "100");
    }

    #[test]
    fn test_replay_cursor_before_oldest_starts_at_oldest() {
        let store = EventStore::new(2);
        for i in 0..5 {
            store.append("message", format!("e{i}"));
        }
        let replayed = store.replay_after("1");
        assert_eq!(
            replayed.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["4", "5"]
        );
    }

    #[test]
    fn test_replay_past_newest_is_empty() {
        let store = EventStore::new(10);
        store.append("message", "only");
        assert!(store.replay_after("1").is_empty());
        assert!(store.replay_after("999").is_empty());
    }

    #[test]
    fn test_unparseable_cursor_replays_everything_retained() {
        let store = EventStore::new(10);
        store.append("message", "a");
        store.append("message", "b");
        assert_eq!(store.replay_after("garbage").len(), 2);
    }

    #[test]
    fn test_concurrent_appends_assign_unique_increasing_ids() {
        use std::sync::Arc;

        let store = Arc::new(EventStore::new(1000));
        let mut workers = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            workers.push(std::thread::spawn(move || {
                (0..50)
                    .map(|_| store.append("message", "x").parse::<u64>().unwrap())
                    .collect::<Vec<u64>>()
            }));
        }

        let mut all: Vec<u64> = Vec::new();
        for worker in workers {
            let ids = worker.join().unwrap();
            // Each thread sees its own ids strictly increasing.
            for pair in ids.windows(2) {
                assert!(pair[1] > pair[0]);
            }
            all.extend(ids);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400, "ids must be unique across threads");
    }

    #[test]
    fn test_event_payload_preserved() {
        let store = EventStore::default();
        store.append("message", r#"{"jsonrpc":"2.0","method":"heartbeat"}"#);
        let replayed = store.replay_after("0");
        assert_eq!(replayed[0].event_type, "message");
        assert!(replayed[0].data.contains("heartbeat"));
    }
}
