// src/executor.rs
//! Key-constrained background task execution
//!
//! At most one task runs per business key (e.g. `rebuild-index:maven-public`).
//! Scheduling bookkeeping lives under one short-held lock; actual execution is
//! serialized by a per-key binary semaphore, so the registry lock is never held
//! while a task body runs. A bounded worker pool caps how many task bodies run
//! at once across all keys.
//!
//! Cancellation is cooperative: canceling sets the task's [`CancelToken`] and
//! calls its [`Task::on_cancel`] hook. A canceled task that keeps running holds
//! its key's semaphore until it exits, so a replacement scheduled with
//! [`ConstrainedExecutor::must_execute`] waits for it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error as ThisError;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

/// Outcome of a task body that did not complete normally
#[derive(ThisError, Debug)]
pub enum TaskError {
    /// The task observed its cancellation flag and stopped early
    #[error("Interrupted after {completed} completed units")]
    Interrupted { completed: u64 },

    #[error(transparent)]
    Failed(#[from] Error),
}

/// Cooperative cancellation flag shared between the executor and a task
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`TaskError::Interrupted`] if cancellation was requested
    pub fn check(&self, completed: u64) -> std::result::Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Interrupted { completed })
        } else {
            Ok(())
        }
    }
}

/// A unit of background work
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run the task body, polling `cancel` at safe points
    async fn run(&self, cancel: CancelToken) -> std::result::Result<(), TaskError>;

    /// Called once when the task is canceled, after its token is set
    fn on_cancel(&self) {}
}

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Task bodies allowed to run at the same time across all keys
    pub max_concurrent: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

struct RunningTask {
    id: TaskId,
    task: Arc<dyn Task>,
    cancel: CancelToken,
}

#[derive(Default)]
struct Registry {
    running: HashMap<String, RunningTask>,
    /// Per-key execution slots; an entry lives while any task for the key exists
    slots: HashMap<String, Arc<Semaphore>>,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    canceled: AtomicU64,
}

struct Inner {
    registry: Mutex<Registry>,
    workers: Arc<Semaphore>,
    max_concurrent: usize,
    handle: Handle,
    counters: Counters,
    idle: Notify,
}

impl Inner {
    /// Bookkeeping after a spawned task has released its slot
    fn finish(&self, key: &str, id: TaskId, cancel: &CancelToken) {
        let mut registry = self.registry.lock();

        // A canceled entry was already removed by the cancel path; the key may
        // now belong to a replacement that must not be dropped here.
        if !cancel.is_cancelled() && registry.running.get(key).is_some_and(|r| r.id == id) {
            registry.running.remove(key);
        }

        let unused = !registry.running.contains_key(key)
            && registry
                .slots
                .get(key)
                .is_some_and(|slot| Arc::strong_count(slot) == 1);
        if unused {
            registry.slots.remove(key);
        }

        if registry.running.is_empty() && registry.slots.is_empty() {
            self.idle.notify_waiters();
        }
    }
}

/// Runs at most one task per key
#[derive(Clone)]
pub struct ConstrainedExecutor {
    inner: Arc<Inner>,
}

impl ConstrainedExecutor {
    /// Create an executor spawning onto `handle`
    pub fn new(config: ExecutorConfig, handle: Handle) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                workers: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                handle,
                counters: Counters::default(),
                idle: Notify::new(),
            }),
        }
    }

    /// Create an executor on the current tokio runtime
    pub fn current(config: ExecutorConfig) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::InitError(format!("No tokio runtime for executor: {e}")))?;
        Ok(Self::new(config, handle))
    }

    /// Schedule `task` unless a task is already registered under `key`
    pub fn may_execute(&self, key: &str, task: Arc<dyn Task>) -> bool {
        let mut registry = self.inner.registry.lock();
        if registry.running.contains_key(key) {
            debug!("Key {} already has a task; dropping {}", key, task.name());
            return false;
        }
        self.schedule(&mut registry, key, task);
        true
    }

    /// Schedule `task`, canceling any task registered under `key`
    ///
    /// Returns whether a previous task was canceled.
    pub fn must_execute(&self, key: &str, task: Arc<dyn Task>) -> bool {
        let previous = {
            let mut registry = self.inner.registry.lock();
            let previous = registry.running.remove(key);
            if let Some(previous) = &previous {
                previous.cancel.cancel();
            }
            self.schedule(&mut registry, key, task);
            previous
        };

        match previous {
            Some(previous) => {
                info!("Task {} under {} superseded", previous.task.name(), key);
                self.inner.counters.canceled.fetch_add(1, Ordering::Relaxed);
                previous.task.on_cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the task registered under `key` without waiting for it to stop
    pub fn cancel_running_with_key(&self, key: &str) -> bool {
        let removed = self.inner.registry.lock().running.remove(key);
        match removed {
            Some(running) => {
                running.cancel.cancel();
                self.inner.counters.canceled.fetch_add(1, Ordering::Relaxed);
                running.task.on_cancel();
                info!("Canceled task {} under {}", running.task.name(), key);
                true
            }
            None => false,
        }
    }

    pub fn has_running_with_key(&self, key: &str) -> bool {
        self.inner.registry.lock().running.contains_key(key)
    }

    /// Cancel every registered task; does not wait for them to stop
    pub fn cancel_all_jobs(&self) -> usize {
        let drained: Vec<(String, RunningTask)> =
            self.inner.registry.lock().running.drain().collect();

        for (key, running) in &drained {
            running.cancel.cancel();
            running.task.on_cancel();
            debug!("Canceled task {} under {}", running.task.name(), key);
        }
        self.inner
            .counters
            .canceled
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained.len()
    }

    /// Wait until no task is registered or still running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let registry = self.inner.registry.lock();
                if registry.running.is_empty() && registry.slots.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    pub fn statistics(&self) -> ExecutorStatistics {
        let mut running_keys: Vec<String> =
            self.inner.registry.lock().running.keys().cloned().collect();
        running_keys.sort();

        let counters = &self.inner.counters;
        ExecutorStatistics {
            running_keys,
            max_concurrent: self.inner.max_concurrent,
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            interrupted: counters.interrupted.load(Ordering::Relaxed),
            canceled: counters.canceled.load(Ordering::Relaxed),
        }
    }

    /// Register and spawn; the caller holds the registry lock
    fn schedule(&self, registry: &mut Registry, key: &str, task: Arc<dyn Task>) {
        let id = TaskId::new();
        let cancel = CancelToken::new();
        let slot = Arc::clone(
            registry
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        );
        registry.running.insert(
            key.to_string(),
            RunningTask {
                id,
                task: Arc::clone(&task),
                cancel: cancel.clone(),
            },
        );
        self.inner.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        debug!("Scheduled task {} ({}) under {}", task.name(), id, key);

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.inner.handle.spawn(async move {
            Self::execute(&inner, &key, id, task, &cancel, slot).await;
            inner.finish(&key, id, &cancel);
        });
    }

    async fn execute(
        inner: &Inner,
        key: &str,
        id: TaskId,
        task: Arc<dyn Task>,
        cancel: &CancelToken,
        slot: Arc<Semaphore>,
    ) {
        // Semaphores are never closed, so acquisition only fails on shutdown
        let Ok(_slot) = slot.acquire_owned().await else {
            return;
        };
        if cancel.is_cancelled() {
            debug!("Task {} ({}) canceled before it started", task.name(), id);
            return;
        }
        let Ok(_worker) = Arc::clone(&inner.workers).acquire_owned().await else {
            return;
        };
        if cancel.is_cancelled() {
            debug!("Task {} ({}) canceled before it started", task.name(), id);
            return;
        }

        let counters = &inner.counters;
        match task.run(cancel.clone()).await {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                info!("Task {} ({}) under {} completed", task.name(), id, key);
            }
            Err(TaskError::Interrupted { completed }) => {
                counters.interrupted.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Task {} ({}) under {} interrupted after {} units",
                    task.name(),
                    id,
                    key,
                    completed
                );
            }
            Err(TaskError::Failed(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Task {} ({}) under {} failed: {}", task.name(), id, key, e);
            }
        }
    }
}

/// Executor statistics
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatistics {
    /// Keys with a registered task, sorted
    pub running_keys: Vec<String>,
    pub max_concurrent: usize,
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub interrupted: u64,
    pub canceled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Task that runs until released or canceled, tracking concurrency
    struct Probe {
        name: String,
        runs: AtomicUsize,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        release: Arc<AtomicBool>,
        hook_called: AtomicBool,
        observed_cancel: AtomicBool,
    }

    impl Probe {
        fn new(name: &str, active: Arc<AtomicUsize>, max_active: Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                runs: AtomicUsize::new(0),
                active,
                max_active,
                release: Arc::new(AtomicBool::new(false)),
                hook_called: AtomicBool::new(false),
                observed_cancel: AtomicBool::new(false),
            })
        }

        fn solo(name: &str) -> Arc<Self> {
            Self::new(name, Arc::default(), Arc::default())
        }

        fn release(&self) {
            self.release.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Task for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, cancel: CancelToken) -> std::result::Result<(), TaskError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let result = loop {
                if cancel.is_cancelled() {
                    self.observed_cancel.store(true, Ordering::SeqCst);
                    break Err(TaskError::Interrupted { completed: 0 });
                }
                if self.release.load(Ordering::SeqCst) {
                    break Ok(());
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn on_cancel(&self) {
            self.hook_called.store(true, Ordering::SeqCst);
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn executor() -> ConstrainedExecutor {
        ConstrainedExecutor::current(ExecutorConfig::default()).unwrap()
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check(3).is_ok());
        token.clone().cancel();
        assert!(matches!(
            token.check(3),
            Err(TaskError::Interrupted { completed: 3 })
        ));
    }

    #[test]
    fn test_requires_runtime() {
        assert!(ConstrainedExecutor::current(ExecutorConfig::default()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_may_execute_single_flight() {
        let executor = executor();
        let first = Probe::solo("refresh");

        let mut handles = Vec::new();
        for i in 0..16 {
            let executor = executor.clone();
            let task: Arc<dyn Task> = if i == 0 {
                Arc::clone(&first) as Arc<dyn Task>
            } else {
                Probe::solo("refresh")
            };
            handles.push(tokio::spawn(async move {
                executor.may_execute("route-update:central", task)
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(executor.statistics().scheduled, 1);
        assert!(executor.has_running_with_key("route-update:central"));

        executor.cancel_all_jobs();
        executor.wait_idle().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_releases_key() {
        let executor = executor();
        let task = Probe::solo("rebuild");
        task.release();

        assert!(executor.may_execute("rebuild:a", Arc::clone(&task) as Arc<dyn Task>));
        executor.wait_idle().await;

        assert!(!executor.has_running_with_key("rebuild:a"));
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
        assert_eq!(executor.statistics().completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_must_execute_preempts() {
        let executor = executor();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let old = Probe::new("old", Arc::clone(&active), Arc::clone(&max_active));
        let new = Probe::new("new", Arc::clone(&active), Arc::clone(&max_active));
        new.release();

        assert!(!executor.must_execute("k", Arc::clone(&old) as Arc<dyn Task>));
        eventually(|| old.runs.load(Ordering::SeqCst) == 1).await;

        assert!(executor.must_execute("k", Arc::clone(&new) as Arc<dyn Task>));
        assert!(old.hook_called.load(Ordering::SeqCst));

        executor.wait_idle().await;
        assert!(old.observed_cancel.load(Ordering::SeqCst));
        assert_eq!(new.runs.load(Ordering::SeqCst), 1);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);

        let stats = executor.statistics();
        assert_eq!(stats.interrupted, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.canceled, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_canceled_task_keeps_slot_until_exit() {
        let executor = executor();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let current = Probe::new("current", Arc::clone(&active), Arc::clone(&max_active));
        assert!(executor.may_execute("purge:x", Arc::clone(&current) as Arc<dyn Task>));
        eventually(|| current.runs.load(Ordering::SeqCst) == 1).await;

        // Cancel returns immediately and frees the key for a replacement
        assert!(executor.cancel_running_with_key("purge:x"));
        assert!(!executor.has_running_with_key("purge:x"));
        assert!(!executor.cancel_running_with_key("purge:x"));

        let replacement = Probe::new("replacement", Arc::clone(&active), Arc::clone(&max_active));
        replacement.release();
        assert!(executor.may_execute("purge:x", Arc::clone(&replacement) as Arc<dyn Task>));

        executor.wait_idle().await;
        assert_eq!(replacement.runs.load(Ordering::SeqCst), 1);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(executor.statistics().running_keys.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_pool_bound() {
        let executor = ConstrainedExecutor::current(ExecutorConfig { max_concurrent: 1 }).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let a = Probe::new("a", Arc::clone(&active), Arc::clone(&max_active));
        let b = Probe::new("b", Arc::clone(&active), Arc::clone(&max_active));
        executor.may_execute("a", Arc::clone(&a) as Arc<dyn Task>);
        executor.may_execute("b", Arc::clone(&b) as Arc<dyn Task>);

        eventually(|| a.runs.load(Ordering::SeqCst) + b.runs.load(Ordering::SeqCst) == 1).await;
        a.release();
        b.release();
        executor.wait_idle().await;

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(executor.statistics().completed, 2);
    }
}
