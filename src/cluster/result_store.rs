//! Master-side bounded store of completed command results.
//!
//! Grounded on `ClientRegistry`'s `DashMap`-backed master state for the
//! lookup table; the insertion-order queue alongside it mirrors the
//! age-tracking shape `registry.rs`'s offline sweep keeps per entry,
//! generalized here to prune the oldest completed entry once the store
//! exceeds its capacity instead of an age deadline.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;
use uuid::Uuid;

use super::types::CommandResult;

/// Entries beyond this count are evicted oldest-completed-first.
const DEFAULT_CAPACITY: usize = 1000;

pub struct CommandResultStore {
    capacity: usize,
    results: DashMap<Uuid, CommandResult>,
    order: Mutex<VecDeque<Uuid>>,
}

impl CommandResultStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            results: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a completed command's result, pruning the oldest entry if
    /// this pushes the store past capacity.
    pub fn record(&self, result: CommandResult) {
        let id = result.command_id;
        self.results.insert(id, result);

        let mut order = self.order.lock().unwrap();
        order.push_back(id);
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }

    pub fn get(&self, command_id: Uuid) -> Option<CommandResult> {
        self.results.get(&command_id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}

impl Default for CommandResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_oldest_past_capacity() {
        let store = CommandResultStore::with_capacity(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        store.record(CommandResult::ok(a, serde_json::json!({}), 1));
        store.record(CommandResult::ok(b, serde_json::json!({}), 1));
        store.record(CommandResult::ok(c, serde_json::json!({}), 1));

        assert_eq!(store.len(), 2);
        assert!(store.get(a).is_none());
        assert!(store.get(b).is_some());
        assert!(store.get(c).is_some());
    }

    #[test]
    fn get_returns_recorded_result() {
        let store = CommandResultStore::new();
        let id = Uuid::new_v4();
        store.record(CommandResult::err(id, "boom", 5));
        let result = store.get(id).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
    }
}
