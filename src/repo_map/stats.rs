//! Counters of setup work, incremented as repository roots resolve.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct SetupStats {
    cache_hits: AtomicUsize,
    executed: AtomicUsize,
    local_paths: AtomicUsize,
}

impl SetupStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_local_paths(&self) {
        self.local_paths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn local_paths(&self) -> usize {
        self.local_paths.load(Ordering::Relaxed)
    }
}
