//! Bounded executor for background work.
//!
//! Checkpoint, compaction and GC are synchronous, disk-bound jobs. They run on
//! the blocking pool of a private tokio runtime, which caps how many execute at
//! once. The scheduler keeps a registry of in-flight tasks so shutdown can
//! cancel every one of them and then join them by dropping the runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};

use crate::error::Result;

/// Cooperative cancellation flag shared between a task and the scheduler.
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancellationInner>,
}

#[derive(Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `timeout` or until cancelled. Returns whether it was cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .inner
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// A unit of background work.
pub trait Task: Send {
    /// Task name for logging
    fn name(&self) -> &'static str;

    fn cancellation(&self) -> &Cancellation;

    /// Execute the task
    fn run(&mut self) -> Result<()>;

    /// Delay before a failed run is retried. `None` gives up after one failure.
    fn retry_backoff(&self) -> Option<Duration> {
        None
    }
}

#[derive(Default)]
struct Registry {
    closed: bool,
    next_id: u64,
    running: HashMap<u64, (&'static str, Cancellation)>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a task from the registry however its thread exits.
struct Deregister {
    registry: Arc<Mutex<Registry>>,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        lock(&self.registry).running.remove(&self.id);
    }
}

pub struct Scheduler {
    runtime: Mutex<Option<Runtime>>,
    registry: Arc<Mutex<Registry>>,
}

impl Scheduler {
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("lsmkv-bg")
            .build()?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    /// Queues `task`. Returns false once the scheduler is shut down.
    pub fn submit(&self, mut task: Box<dyn Task>) -> bool {
        let runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(runtime) = runtime.as_ref() else {
            return false;
        };

        let id = {
            let mut registry = lock(&self.registry);
            if registry.closed {
                return false;
            }
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .running
                .insert(id, (task.name(), task.cancellation().clone()));
            id
        };

        let guard = Deregister {
            registry: Arc::clone(&self.registry),
            id,
        };
        runtime.spawn_blocking(move || {
            let _guard = guard;
            run_to_completion(task.as_mut());
        });
        true
    }

    /// Number of submitted tasks that have not finished.
    pub fn in_flight(&self) -> usize {
        lock(&self.registry).running.len()
    }

    /// Cancels every in-flight task and waits for all of them to return.
    pub fn shutdown(&self) {
        {
            let mut registry = lock(&self.registry);
            registry.closed = true;
            for (name, cancellation) in registry.running.values() {
                tracing::debug!(task = *name, "Cancelling task");
                cancellation.cancel();
            }
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the runtime joins its blocking threads.
        drop(runtime);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_to_completion(task: &mut dyn Task) {
    loop {
        if task.cancellation().is_cancelled() {
            tracing::debug!(task = task.name(), "Task cancelled before running");
            return;
        }

        match task.run() {
            Ok(()) => return,
            Err(e) => {
                tracing::warn!(task = task.name(), error = %e, "Task execution failed");
                match task.retry_backoff() {
                    Some(backoff) if !task.cancellation().wait(backoff) => {
                        tracing::info!(task = task.name(), "Retrying task");
                    }
                    _ => return,
                }
            }
        }
    }
}
