//! Asynchronous, idempotent keyed-consumer map.
//!
//! [`AsyncMapConsumer`] memoizes the result of a user-supplied compute
//! function by key, collapses concurrent requests for the same key into one
//! computation, and composes dependencies through continuation passing. A
//! caller never blocks on a pending key: it registers a continuation and
//! returns its worker to the pool, so the pool cannot be fully parked on
//! unresolved keys regardless of dependency shape.
//!
//! The compute function receives a [`Setter`] (one-shot value sink), a
//! [`Logger`] for `(message, fatal)` diagnostics, and a [`SubCaller`] to
//! request further keys of the same map, which is how recursive dependencies
//! (e.g. chained critical Git operations) are expressed.

use std::{
    collections::HashMap,
    hash::Hash,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex},
};

use crate::pool::TaskPool;

/// Shared `(message, fatal)` sink attached to every computation and request.
pub type Logger = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Make a logger from a closure.
pub fn make_logger<F>(f: F) -> Logger
where
    F: Fn(&str, bool) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Logger that only feeds the `tracing` sinks.
pub fn tracing_logger() -> Logger {
    make_logger(|msg, fatal| {
        if fatal {
            tracing::error!("{msg}");
        } else {
            tracing::warn!("{msg}");
        }
    })
}

/// Compute callback: invoked at most once per key, must eventually either
/// call the setter or log fatally.
pub type ComputeFn<K, V> =
    dyn Fn(&Arc<TaskPool>, Setter<K, V>, Logger, SubCaller<K, V>, &K) + Send + Sync;

struct KeyCont<V> {
    on_value: Box<dyn FnOnce(Arc<V>) + Send>,
    logger: Logger,
}

enum KeyState<V> {
    Pending(Vec<KeyCont<V>>),
    Ready(Arc<V>),
    Failed(String),
}

struct MapState<K, V> {
    entries: Mutex<HashMap<K, KeyState<V>>>,
    compute_counts: Mutex<HashMap<K, usize>>,
}

/// Deduplicating, memoizing keyed-consumer map.
///
/// Cheap to clone; clones share the same key space and results.
pub struct AsyncMapConsumer<K, V> {
    state: Arc<MapState<K, V>>,
    compute: Arc<ComputeFn<K, V>>,
}

impl<K, V> Clone for AsyncMapConsumer<K, V> {
    fn clone(&self) -> Self {
        AsyncMapConsumer {
            state: self.state.clone(),
            compute: self.compute.clone(),
        }
    }
}

struct JoinState<V> {
    slots: Vec<Option<Arc<V>>>,
    missing: usize,
    on_ready: Option<Box<dyn FnOnce(Vec<Arc<V>>) + Send>>,
    failed: bool,
}

impl<K, V> AsyncMapConsumer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn(&Arc<TaskPool>, Setter<K, V>, Logger, SubCaller<K, V>, &K) + Send + Sync + 'static,
    {
        AsyncMapConsumer {
            state: Arc::new(MapState {
                entries: Mutex::new(HashMap::new()),
                compute_counts: Mutex::new(HashMap::new()),
            }),
            compute: Arc::new(compute),
        }
    }

    /// Request `keys` and submit `on_ready` with the values, in key order,
    /// once all of them have resolved.
    ///
    /// Each key either reuses a memoized result, piggybacks on an in-flight
    /// computation, or spawns the single computation for that key. A fatal
    /// message on any requested key drops `on_ready` and forwards the
    /// message to `logger` with `fatal = true`; non-fatal messages are
    /// forwarded without cancelling.
    pub fn consume_after_keys_ready<F>(
        &self,
        pool: &Arc<TaskPool>,
        keys: Vec<K>,
        on_ready: F,
        logger: Logger,
    ) where
        F: FnOnce(Vec<Arc<V>>) + Send + 'static,
    {
        if keys.is_empty() {
            pool.execute(move || on_ready(Vec::new()));
            return;
        }
        let join = Arc::new(Mutex::new(JoinState {
            slots: (0..keys.len()).map(|_| None).collect(),
            missing: keys.len(),
            on_ready: Some(Box::new(on_ready)),
            failed: false,
        }));
        for (index, key) in keys.into_iter().enumerate() {
            let on_value: Box<dyn FnOnce(Arc<V>) + Send> = {
                let join = join.clone();
                let pool = pool.clone();
                Box::new(move |value| {
                    let mut state = join.lock().expect("join state poisoned");
                    state.slots[index] = Some(value);
                    state.missing -= 1;
                    if state.missing == 0 && !state.failed {
                        if let Some(ready) = state.on_ready.take() {
                            let values: Vec<Arc<V>> = state
                                .slots
                                .iter_mut()
                                .map(|slot| slot.take().expect("resolved slot"))
                                .collect();
                            drop(state);
                            pool.execute(move || ready(values));
                        }
                    }
                })
            };
            let key_logger: Logger = {
                let join = join.clone();
                let logger = logger.clone();
                Arc::new(move |msg: &str, fatal: bool| {
                    if fatal {
                        let mut state = join.lock().expect("join state poisoned");
                        state.failed = true;
                        state.on_ready.take();
                    }
                    logger(msg, fatal);
                })
            };
            self.register(pool, key, KeyCont { on_value, logger: key_logger });
        }
    }

    /// Number of times the compute function ran for `key` (0 or 1).
    pub fn compute_count(&self, key: &K) -> usize {
        self.state
            .compute_counts
            .lock()
            .expect("count state poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Memoized value for `key`, if it resolved already.
    pub fn get_ready(&self, key: &K) -> Option<Arc<V>> {
        match self.state.entries.lock().expect("map state poisoned").get(key) {
            Some(KeyState::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Keys still unresolved. Non-empty after pool quiescence means a
    /// dependency cycle or a compute that neither set nor failed.
    pub fn pending_keys(&self) -> Vec<K> {
        self.state
            .entries
            .lock()
            .expect("map state poisoned")
            .iter()
            .filter_map(|(key, state)| match state {
                KeyState::Pending(_) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    fn register(&self, pool: &Arc<TaskPool>, key: K, cont: KeyCont<V>) {
        enum Registered<V> {
            Value(Arc<V>, KeyCont<V>),
            Failure(String, KeyCont<V>),
            Spawn,
            Queued,
        }
        let registered = {
            let mut entries = self.state.entries.lock().expect("map state poisoned");
            match entries.entry(key.clone()) {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    match occupied.get_mut() {
                        KeyState::Ready(value) => Registered::Value(value.clone(), cont),
                        KeyState::Failed(msg) => Registered::Failure(msg.clone(), cont),
                        KeyState::Pending(conts) => {
                            conts.push(cont);
                            Registered::Queued
                        }
                    }
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(KeyState::Pending(vec![cont]));
                    Registered::Spawn
                }
            }
        };
        // lock released: fire or spawn outside the critical section
        match registered {
            Registered::Value(value, cont) => (cont.on_value)(value),
            Registered::Failure(msg, cont) => (cont.logger)(&msg, true),
            Registered::Spawn => self.spawn_compute(pool, key),
            Registered::Queued => {}
        }
    }

    fn spawn_compute(&self, pool: &Arc<TaskPool>, key: K) {
        {
            let mut counts = self.state.compute_counts.lock().expect("count state poisoned");
            *counts.entry(key.clone()).or_insert(0) += 1;
        }
        let map = self.clone();
        let pool_for_task = pool.clone();
        pool.execute(move || {
            let setter = Setter {
                map: map.clone(),
                key: key.clone(),
            };
            let logger = map.key_scoped_logger(key.clone());
            let subcaller = SubCaller {
                map: map.clone(),
                pool: pool_for_task.clone(),
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (map.compute)(&pool_for_task, setter, logger.clone(), subcaller, &key)
            }));
            if let Err(payload) = outcome {
                let what = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                logger(&format!("Internal error: compute panicked: {what}"), true);
            }
        });
    }

    /// Logger handed to a computation: forwards non-fatal messages to every
    /// registered consumer of `key`; a fatal message fails the key and
    /// delivers `(msg, true)` to each of them exactly once.
    fn key_scoped_logger(&self, key: K) -> Logger {
        let map = self.clone();
        Arc::new(move |msg: &str, fatal: bool| {
            if fatal {
                tracing::error!("{msg}");
                map.fail_key(&key, msg);
            } else {
                tracing::warn!("{msg}");
                let loggers: Vec<Logger> = {
                    let entries = map.state.entries.lock().expect("map state poisoned");
                    match entries.get(&key) {
                        Some(KeyState::Pending(conts)) => {
                            conts.iter().map(|c| c.logger.clone()).collect()
                        }
                        _ => Vec::new(),
                    }
                };
                for logger in loggers {
                    logger(msg, false);
                }
            }
        })
    }

    fn fail_key(&self, key: &K, msg: &str) {
        let conts = {
            let mut entries = self.state.entries.lock().expect("map state poisoned");
            match entries.insert(key.clone(), KeyState::Failed(msg.to_string())) {
                Some(KeyState::Pending(conts)) => conts,
                Some(other) => {
                    // A resolved key cannot fail retroactively; keep the value.
                    entries.insert(key.clone(), other);
                    tracing::error!("Internal error: fatal message after key resolution: {msg}");
                    return;
                }
                None => Vec::new(),
            }
        };
        for cont in conts {
            (cont.logger)(msg, true);
        }
    }

    fn set_value(&self, key: &K, value: V) {
        let (value, conts) = {
            let mut entries = self.state.entries.lock().expect("map state poisoned");
            let value = Arc::new(value);
            match entries.insert(key.clone(), KeyState::Ready(value.clone())) {
                Some(KeyState::Pending(conts)) => (value, conts),
                Some(other) => {
                    entries.insert(key.clone(), other);
                    tracing::error!("Internal error: setter called twice for a key");
                    return;
                }
                None => (value, Vec::new()),
            }
        };
        // Lock released before firing; a continuation may synchronously
        // re-enter the map.
        for cont in conts {
            (cont.on_value)(value.clone());
        }
    }
}

/// One-shot value sink for a single key's computation.
pub struct Setter<K, V> {
    map: AsyncMapConsumer<K, V>,
    key: K,
}

impl<K, V> Setter<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Fulfil the key. Continuations registered so far fire in submission
    /// order; later requests observe the memoized value.
    pub fn set(self, value: V) {
        self.map.set_value(&self.key, value);
    }
}

/// Re-entry handle: lets a computation request further keys of its own map.
pub struct SubCaller<K, V> {
    map: AsyncMapConsumer<K, V>,
    pool: Arc<TaskPool>,
}

impl<K, V> Clone for SubCaller<K, V> {
    fn clone(&self) -> Self {
        SubCaller {
            map: self.map.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<K, V> SubCaller<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn call<F>(&self, keys: Vec<K>, on_ready: F, logger: Logger)
    where
        F: FnOnce(Vec<Arc<V>>) + Send + 'static,
    {
        self.map
            .consume_after_keys_ready(&self.pool, keys, on_ready, logger);
    }
}
