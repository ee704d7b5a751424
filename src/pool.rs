//! Fixed-size task pool executing submitted closures concurrently.
//!
//! Thin wrapper over `threadpool::ThreadPool`. Submission is non-blocking
//! and reentrant: a running task may submit further tasks, which is how the
//! consumer maps chain continuations without ever parking a worker on an
//! unfinished key. The driver reaches quiescence with [`TaskPool::join`].

use threadpool::ThreadPool;

pub struct TaskPool {
    inner: ThreadPool,
}

impl TaskPool {
    /// Create a pool with `jobs` workers. `jobs` must be non-zero.
    pub fn new(jobs: usize) -> Self {
        TaskPool {
            inner: ThreadPool::new(jobs.max(1)),
        }
    }

    /// Create a pool sized to the number of available CPUs.
    pub fn with_default_jobs() -> Self {
        Self::new(num_cpus::get())
    }

    /// Submit a closure for execution. Never blocks, even when called from
    /// inside a running task on a single-worker pool.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job);
    }

    /// Block until the queue is empty and no worker is running. Only the
    /// driver calls this; tasks themselves never join.
    pub fn join(&self) {
        self.inner.join();
    }

    pub fn jobs(&self) -> usize {
        self.inner.max_count()
    }
}
