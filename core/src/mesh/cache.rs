// Alert cache: bounded, insertion-ordered, keyed by alert id

use crate::message::CachedAlert;
use std::collections::{HashMap, VecDeque};

/// FIFO-evicting alert store used for duplicate suppression.
///
/// Eviction follows insertion order only; reading an entry does not refresh it.
#[derive(Debug)]
pub struct AlertCache {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, CachedAlert>,
}

impl AlertCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity.max(1)),
            entries: HashMap::with_capacity(capacity.max(1)),
        }
    }

    pub fn contains(&self, alert_id: &str) -> bool {
        self.entries.contains_key(alert_id)
    }

    pub fn get(&self, alert_id: &str) -> Option<&CachedAlert> {
        self.entries.get(alert_id)
    }

    /// Insert an alert not seen before, evicting the oldest entries beyond
    /// capacity. Returns `false` (and changes nothing) for a known id.
    pub fn insert(&mut self, alert: CachedAlert) -> bool {
        let id = alert.alert_id().to_string();
        if self.entries.contains_key(&id) {
            return false;
        }

        self.order.push_back(id.clone());
        self.entries.insert(id, alert);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                tracing::debug!("Evicted alert {} from cache", oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Cached alerts, oldest first
    pub fn snapshot(&self) -> Vec<CachedAlert> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}
