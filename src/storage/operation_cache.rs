//! Bounded in-memory map of long-running operation records.
//!
//! Fetch and import steps register themselves here so observers can query
//! their progress by name. The map is soft-bounded: once it grows past
//! twice the threshold, an opportunistic garbage collection deletes the
//! oldest records that are already done. Readers take a shared lock;
//! the sort between snapshot and delete runs with no lock held so queries
//! are never blocked by it.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use chrono::{DateTime, Utc};

const DEFAULT_THRESHOLD_EXPONENT: u8 = 14;

/// Record of one long-running operation.
#[derive(Clone, Debug)]
pub struct Operation {
    /// Human-readable stage description, e.g. the URL being fetched.
    pub stage: String,
    /// Whether the operation has finished (success or failure).
    pub done: bool,
    /// Start time; eviction order.
    pub started_at: DateTime<Utc>,
}

impl Operation {
    pub fn started(stage: impl Into<String>) -> Self {
        Operation {
            stage: stage.into(),
            done: false,
            started_at: Utc::now(),
        }
    }

    pub fn finished(mut self) -> Self {
        self.done = true;
        self
    }
}

#[derive(Debug)]
pub struct OperationCache {
    cache: RwLock<HashMap<String, Operation>>,
    threshold: AtomicUsize,
}

impl Default for OperationCache {
    fn default() -> Self {
        OperationCache {
            cache: RwLock::new(HashMap::new()),
            threshold: AtomicUsize::new(1 << DEFAULT_THRESHOLD_EXPONENT),
        }
    }
}

impl OperationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft bound becomes `1 << exponent`.
    pub fn set_threshold_exponent(&self, exponent: u8) {
        self.threshold.store(1 << exponent, Ordering::Relaxed);
    }

    /// Insert or replace the record for `name`.
    pub fn set(&self, name: &str, operation: Operation) {
        self.garbage_collection();
        let mut cache = self.cache.write().expect("operation cache poisoned");
        cache.insert(name.to_string(), operation);
    }

    /// Mark an existing record as done, keeping its timestamp.
    pub fn finish(&self, name: &str) {
        let mut cache = self.cache.write().expect("operation cache poisoned");
        if let Some(operation) = cache.get_mut(name) {
            operation.done = true;
        }
    }

    pub fn query(&self, name: &str) -> Option<Operation> {
        let cache = self.cache.read().expect("operation cache poisoned");
        cache.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.read().expect("operation cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn garbage_collection(&self) {
        let threshold = self.threshold.load(Ordering::Relaxed);
        let mut snapshot = {
            let cache = self.cache.read().expect("operation cache poisoned");
            if cache.len() <= threshold << 1 {
                return;
            }
            cache
                .iter()
                .map(|(name, operation)| (name.clone(), operation.clone()))
                .collect::<Vec<_>>()
        };
        // Shared lock released: the sort must not block queries.
        snapshot.sort_by_key(|(_, operation)| operation.started_at);
        let mut cache = self.cache.write().expect("operation cache poisoned");
        let mut deleted = 0;
        for (name, operation) in snapshot {
            if operation.done {
                cache.remove(&name);
                deleted += 1;
            }
            if deleted == threshold {
                break;
            }
        }
    }
}
