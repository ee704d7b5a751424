//! Serialization of critical Git operations per repository path.
//!
//! The guard stores, per path, the most recent operation key. A new
//! operation either runs immediately (no predecessor) or registers itself
//! as a continuation behind the stored predecessor, turning concurrent
//! operations on one repository into a chain. No thread is ever left
//! blocking: waiting is expressed through the consumer map.

use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};

use dashmap::DashMap;

use crate::{
    consumer::AsyncMapConsumer,
    git::ops::{GitOpKey, GitOpValue},
};

/// Per-path chain head of critical operations.
#[derive(Default)]
pub struct CriticalGitOpGuard {
    current_critical_key: DashMap<u64, GitOpKey>,
}

impl CriticalGitOpGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically return the previously stored key for the path of
    /// `new_key` (its predecessor in the chain) and install `new_key` as
    /// the path's current operation. `None` means the operation has no
    /// predecessor and may run immediately.
    pub fn fetch_and_set_critical_key(&self, new_key: &GitOpKey) -> Option<GitOpKey> {
        let mut hasher = DefaultHasher::new();
        new_key.params.target_path.hash(&mut hasher);
        self.current_critical_key.insert(hasher.finish(), new_key.clone())
    }
}

pub type CriticalGitOpMap = AsyncMapConsumer<GitOpKey, GitOpValue>;

/// Build the critical-op map on top of `guard`.
pub fn create_critical_git_op_map(
    guard: Arc<CriticalGitOpGuard>,
    git_bin: String,
) -> CriticalGitOpMap {
    AsyncMapConsumer::new(move |_pool, setter, logger, subcaller, key: &GitOpKey| {
        match guard.fetch_and_set_critical_key(key) {
            None => {
                // no predecessor: do critical operation now
                setter.set(key.operation(&git_bin, &logger));
            }
            Some(previous_key) => {
                // run only after the predecessor finished
                let key = key.clone();
                let git_bin = git_bin.clone();
                let op_logger = logger.clone();
                subcaller.call(
                    vec![previous_key],
                    move |_values| {
                        setter.set(key.operation(&git_bin, &op_logger));
                    },
                    logger,
                );
            }
        }
    })
}
