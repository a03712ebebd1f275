//! Queue, retry and failure-budget bookkeeping
//!
//! The manager decides whether the crawl keeps going, which task runs
//! next, and what every cycle outcome means: success feeds discovered
//! work back into storage, transient failures go through the retrial
//! set with a bounded per-task budget, and hard failures count against
//! the run-wide failed budget. Exhausting either budget is fatal for
//! the whole run, not just the task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};

use crate::config::Config;
use crate::error::{Error, Result, TerminationError};
use crate::models::{CycleResult, Status, Task};
use crate::storage::Storage;

// ============================================================================
// Work signal
// ============================================================================

/// Single-slot, level-triggered wake condition.
///
/// Set once by any cycle that produced progress, checked by the
/// scheduling loop to decide whether to park. Not a queue of events,
/// just enough state to avoid the loop sleeping through "queue became
/// non-empty".
#[derive(Default)]
pub struct WorkSignal {
    set: AtomicBool,
    notify: Notify,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        if !self.set.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the signal is set. Returns immediately if it already
    /// is.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Task lifecycle: queued → in-flight → success | retrial | failed.
pub struct Manager {
    name: String,
    storage: Arc<dyn Storage>,
    config: Arc<Config>,
    http_failed: HashSet<u16>,
    terminated: AtomicBool,
    retrials: Mutex<HashSet<Task>>,
    retry_counts: Mutex<HashMap<Task, u32>>,
    iterations: AtomicU64,
    work: WorkSignal,
    semaphore: Arc<Semaphore>,
    fatal: Mutex<Option<TerminationError>>,
}

impl Manager {
    pub fn new(name: &str, storage: Arc<dyn Storage>, config: Arc<Config>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.crawler.max_concurrent_requests));
        Self {
            name: name.to_string(),
            http_failed: config.crawler.http_failed_set(),
            storage,
            config,
            terminated: AtomicBool::new(false),
            retrials: Mutex::new(HashSet::new()),
            retry_counts: Mutex::new(HashMap::new()),
            iterations: AtomicU64::new(0),
            work: WorkSignal::new(),
            semaphore,
            fatal: Mutex::new(None),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Concurrency gate shared by all in-flight cycles.
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    pub fn work(&self) -> &WorkSignal {
        &self.work
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Request termination. Idempotent.
    pub fn stop(&self) -> bool {
        self.terminated.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Take the recorded fatal termination, if any.
    pub fn take_fatal(&self) -> Option<TerminationError> {
        self.fatal.lock().expect("manager lock poisoned").take()
    }

    /// The crawl continues while not terminated and there is either a
    /// pending retrial or queued work.
    pub async fn running(&self) -> bool {
        if self.is_terminated() {
            return false;
        }
        let has_retrials = !self
            .retrials
            .lock()
            .expect("manager lock poisoned")
            .is_empty();
        if has_retrials {
            return true;
        }
        match self.storage.tasks_queued_is_empty().await {
            Ok(empty) => !empty,
            Err(e) => {
                tracing::warn!(spider = %self.name, error = %e, "queue state check failed");
                false
            }
        }
    }

    /// Next batch of tasks to process. Retrials are preferred and
    /// popped without waiting; otherwise one task is popped from the
    /// queue, an empty queue yielding an empty batch.
    pub async fn scheduled(&self) -> Result<Vec<Task>> {
        let retrial = {
            let mut retrials = self.retrials.lock().expect("manager lock poisoned");
            let task = retrials.iter().next().cloned();
            if let Some(task) = &task {
                retrials.remove(task);
            }
            task
        };
        if let Some(task) = retrial {
            return Ok(vec![task]);
        }

        match self.storage.get_tasks_queued().await {
            Ok(task) => Ok(vec![task]),
            Err(e) if e.is_queue_empty() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply one cycle outcome.
    ///
    /// Budget exhaustion returns a [`TerminationError`]; the fatal
    /// state is also recorded so a fire-and-forget caller's run loop
    /// can pick it up.
    pub async fn process(&self, result: &CycleResult) -> Result<()> {
        self.iterations.fetch_add(1, Ordering::Relaxed);

        if result.status == Status::Retrial {
            let attempts = {
                let mut retrials = self.retrials.lock().expect("manager lock poisoned");
                retrials.insert(result.task.clone());
                let mut counts = self.retry_counts.lock().expect("manager lock poisoned");
                let attempts = counts.entry(result.task.clone()).or_insert(0);
                *attempts += 1;
                *attempts
            };
            if attempts >= self.config.crawler.max_retries {
                return Err(self.fatal(TerminationError::MaxRetriesReached));
            }
            tokio::time::sleep(self.config.crawler.pause_timeout()).await;
        }

        if result.status.is_failure(&self.http_failed) {
            self.storage
                .add_tasks_failed([result.task.clone()].into_iter().collect())
                .await?;
            let failed = self.storage.get_tasks_failed().await?;
            if failed.len() >= self.config.crawler.max_failed {
                return Err(self.fatal(TerminationError::MaxFailedReached));
            }
        }

        if !result.tasks.is_empty() {
            self.storage.add_tasks_queued(result.tasks.clone()).await?;
        }

        if !result.items.is_empty() {
            self.storage
                .add_info_items_processed(result.items.len() as u64)
                .await?;
        }

        if !self.work.is_set() {
            self.work.set();
        }

        Ok(())
    }

    fn fatal(&self, termination: TerminationError) -> Error {
        tracing::error!(spider = %self.name, error = %termination, "fatal budget exhaustion");
        *self.fatal.lock().expect("manager lock poisoned") = Some(termination);
        self.stop();
        // wake a parked scheduling loop so it can observe termination
        self.work.set();
        Error::from(termination)
    }
}
