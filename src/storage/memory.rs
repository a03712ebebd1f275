//! Private in-process storage backend
//!
//! Queue plus processed/failed sets behind one mutex; the dedup
//! invariant holds because filter, mark-processed and enqueue happen
//! under a single lock acquisition. Pops wait briefly on a notify for
//! concurrent producers before reporting the queue empty.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::StorageError;
use crate::models::Task;

use super::{unix_now, Storage, StorageSnapshot};

/// Default wait for a task to show up before reporting QueueEmpty.
const POP_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Inner {
    time_initialised: Option<f64>,
    time_started: Option<f64>,
    items_processed: u64,
    items_failed: u64,
    tasks_queued: VecDeque<Task>,
    tasks_processed: HashSet<Task>,
    tasks_failed: HashSet<Task>,
}

/// In-process storage backend.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    pushed: Notify,
    pop_timeout: Duration,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_pop_timeout(POP_TIMEOUT)
    }

    /// Override the blocking-pop timeout.
    pub fn with_pop_timeout(pop_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pushed: Notify::new(),
            pop_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory storage lock poisoned")
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn initialise(&self) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn finalise(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn add_tasks_queued(&self, tasks: HashSet<Task>) -> Result<(), StorageError> {
        let mut pushed = false;
        {
            let mut inner = self.lock();
            for task in tasks {
                if inner.tasks_processed.insert(task.clone()) {
                    inner.tasks_queued.push_back(task);
                    pushed = true;
                }
            }
        }
        if pushed {
            self.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn get_tasks_queued(&self) -> Result<Task, StorageError> {
        let deadline = Instant::now() + self.pop_timeout;
        loop {
            // Register for wakeups before checking the queue so a push
            // between check and wait is not missed.
            let notified = self.pushed.notified();
            if let Some(task) = self.lock().tasks_queued.pop_front() {
                return Ok(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(StorageError::QueueEmpty);
            }
        }
    }

    async fn tasks_queued_is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.lock().tasks_queued.is_empty())
    }

    async fn get_tasks_processed(&self) -> Result<HashSet<Task>, StorageError> {
        Ok(self.lock().tasks_processed.clone())
    }

    async fn add_tasks_failed(&self, tasks: HashSet<Task>) -> Result<(), StorageError> {
        self.lock().tasks_failed.extend(tasks);
        Ok(())
    }

    async fn get_tasks_failed(&self) -> Result<HashSet<Task>, StorageError> {
        Ok(self.lock().tasks_failed.clone())
    }

    async fn add_info_items_processed(&self, count: u64) -> Result<u64, StorageError> {
        let mut inner = self.lock();
        inner.items_processed += count;
        Ok(inner.items_processed)
    }

    async fn get_info_items_processed(&self) -> Result<u64, StorageError> {
        Ok(self.lock().items_processed)
    }

    async fn add_info_items_failed(&self, count: u64) -> Result<u64, StorageError> {
        let mut inner = self.lock();
        inner.items_failed += count;
        Ok(inner.items_failed)
    }

    async fn get_info_items_failed(&self) -> Result<u64, StorageError> {
        Ok(self.lock().items_failed)
    }

    async fn set_info_time_initialised(&self, value: f64) -> Result<(), StorageError> {
        self.lock().time_initialised = Some(value);
        Ok(())
    }

    async fn get_info_time_initialised(&self) -> Result<Option<f64>, StorageError> {
        Ok(self.lock().time_initialised)
    }

    async fn set_info_time_started(&self, value: f64) -> Result<(), StorageError> {
        self.lock().time_started = Some(value);
        Ok(())
    }

    async fn get_info_time_started(&self) -> Result<Option<f64>, StorageError> {
        Ok(self.lock().time_started)
    }

    async fn get_info_time_running(&self) -> Result<f64, StorageError> {
        Ok(self
            .lock()
            .time_started
            .map(|started| unix_now() - started)
            .unwrap_or(0.0))
    }

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        let inner = self.lock();
        Ok(StorageSnapshot {
            time_running: inner
                .time_started
                .map(|started| unix_now() - started)
                .unwrap_or(0.0),
            tasks_queued: inner.tasks_queued.len(),
            tasks_processed: inner.tasks_processed.len(),
            tasks_failed: inner.tasks_failed.len(),
            items_processed: inner.items_processed,
            items_failed: inner.items_failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn storage() -> MemoryStorage {
        MemoryStorage::with_pop_timeout(Duration::ZERO)
    }

    fn tasks(urls: &[&str]) -> HashSet<Task> {
        urls.iter().map(|u| Task::new(*u)).collect()
    }

    #[tokio::test]
    async fn test_overlapping_adds_deliver_each_task_once() {
        let storage = storage();
        storage
            .add_tasks_queued(tasks(&["http://example.com/1/"]))
            .await
            .unwrap();
        storage
            .add_tasks_queued(tasks(&["http://example.com/1/", "http://example.com/2/"]))
            .await
            .unwrap();

        let mut delivered = HashSet::new();
        while let Ok(task) = storage.get_tasks_queued().await {
            assert!(delivered.insert(task), "task delivered twice");
        }
        assert_eq!(
            delivered,
            tasks(&["http://example.com/1/", "http://example.com/2/"])
        );
        assert_eq!(
            storage.get_tasks_processed().await.unwrap(),
            tasks(&["http://example.com/1/", "http://example.com/2/"])
        );
    }

    #[tokio::test]
    async fn test_empty_pop_reports_queue_empty() {
        let storage = storage();
        let err = storage.get_tasks_queued().await.unwrap_err();
        assert!(err.is_queue_empty());

        // state stays usable afterwards
        storage
            .add_tasks_queued(tasks(&["http://example.com/"]))
            .await
            .unwrap();
        assert!(storage.get_tasks_queued().await.is_ok());
    }

    #[tokio::test]
    async fn test_pop_waits_for_concurrent_producer() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let producer = std::sync::Arc::clone(&storage);
        let pop = tokio::spawn(async move { storage.get_tasks_queued().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        producer
            .add_tasks_queued(tasks(&["http://example.com/late/"]))
            .await
            .unwrap();

        let task = pop.await.unwrap().unwrap();
        assert_eq!(task.url, "http://example.com/late/");
    }

    #[tokio::test]
    async fn test_counters_return_new_totals() {
        let storage = storage();
        assert_eq!(storage.add_info_items_processed(3).await.unwrap(), 3);
        assert_eq!(storage.add_info_items_processed(2).await.unwrap(), 5);
        assert_eq!(storage.get_info_items_processed().await.unwrap(), 5);
        assert_eq!(storage.add_info_items_failed(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_set_accumulates() {
        let storage = storage();
        storage
            .add_tasks_failed(tasks(&["http://example.com/a/"]))
            .await
            .unwrap();
        storage
            .add_tasks_failed(tasks(&["http://example.com/a/", "http://example.com/b/"]))
            .await
            .unwrap();
        assert_eq!(
            storage.get_tasks_failed().await.unwrap(),
            tasks(&["http://example.com/a/", "http://example.com/b/"])
        );
    }

    #[tokio::test]
    async fn test_snapshot_counts() {
        let storage = storage();
        storage
            .add_tasks_queued(tasks(&["http://example.com/1/", "http://example.com/2/"]))
            .await
            .unwrap();
        storage.get_tasks_queued().await.unwrap();
        storage.add_info_items_processed(7).await.unwrap();

        let snapshot = storage.snapshot().await.unwrap();
        assert_eq!(snapshot.tasks_queued, 1);
        assert_eq!(snapshot.tasks_processed, 2);
        assert_eq!(snapshot.items_processed, 7);
    }

    proptest! {
        /// For any sequence of possibly-overlapping task sets, the queue
        /// yields each distinct task exactly once and the processed set
        /// equals the union of everything ever queued.
        #[test]
        fn prop_dedup_invariant(batches in proptest::collection::vec(
            proptest::collection::hash_set(0u8..32, 0..8),
            1..12,
        )) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let storage = MemoryStorage::with_pop_timeout(Duration::ZERO);
                let mut union = HashSet::new();
                for batch in &batches {
                    let batch: HashSet<Task> = batch
                        .iter()
                        .map(|n| Task::new(format!("http://example.com/{n}/")))
                        .collect();
                    union.extend(batch.iter().cloned());
                    storage.add_tasks_queued(batch).await.unwrap();
                }

                let mut delivered = HashSet::new();
                while let Ok(task) = storage.get_tasks_queued().await {
                    prop_assert!(delivered.insert(task), "task delivered twice");
                }
                prop_assert_eq!(&delivered, &union);
                prop_assert_eq!(&storage.get_tasks_processed().await.unwrap(), &union);
                Ok(())
            }).unwrap();
        }
    }
}
