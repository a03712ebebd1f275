//! Task and item bookkeeping backends
//!
//! Storage owns the queued/processed/failed task sets and the run
//! counters. The contract is deliberately small and must stay safe
//! under concurrent calls from many in-flight task cycles; the dedup
//! invariant (a task is never enqueued twice) lives entirely inside
//! `add_tasks_queued`.
//!
//! Two backends ship: [`MemoryStorage`] for a private in-process run
//! and [`RedisStorage`] for multiple crawler processes sharing one key
//! space.

mod memory;
mod redis;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;
use crate::models::Task;

pub use memory::MemoryStorage;
pub use self::redis::RedisStorage;

/// Counters and timestamps read by reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageSnapshot {
    /// Seconds since the run started
    pub time_running: f64,
    pub tasks_queued: usize,
    pub tasks_processed: usize,
    pub tasks_failed: usize,
    pub items_processed: u64,
    pub items_failed: u64,
}

/// Task/item bookkeeping contract.
///
/// All operations are callable from arbitrarily many concurrent task
/// cycles. `get_tasks_queued` distinguishes "nothing ready now"
/// ([`StorageError::QueueEmpty`]) from real faults.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Prepare the backend for a run. Returns true iff this instance
    /// became the leader of the namespace; private backends are always
    /// their own leader.
    async fn initialise(&self) -> Result<bool, StorageError>;

    /// Tear the backend down at the end of a run.
    async fn finalise(&self) -> Result<(), StorageError>;

    /// Filter out tasks already processed, mark the survivors processed
    /// and append them to the queue - atomically with respect to
    /// concurrent callers.
    async fn add_tasks_queued(&self, tasks: HashSet<Task>) -> Result<(), StorageError>;

    /// Pop one task, waiting a short implementation-defined timeout
    /// before reporting [`StorageError::QueueEmpty`].
    async fn get_tasks_queued(&self) -> Result<Task, StorageError>;

    async fn tasks_queued_is_empty(&self) -> Result<bool, StorageError>;

    async fn get_tasks_processed(&self) -> Result<HashSet<Task>, StorageError>;

    async fn add_tasks_failed(&self, tasks: HashSet<Task>) -> Result<(), StorageError>;

    async fn get_tasks_failed(&self) -> Result<HashSet<Task>, StorageError>;

    /// Increment the processed-items counter, returning the new total.
    async fn add_info_items_processed(&self, count: u64) -> Result<u64, StorageError>;

    async fn get_info_items_processed(&self) -> Result<u64, StorageError>;

    /// Increment the failed-items counter, returning the new total.
    async fn add_info_items_failed(&self, count: u64) -> Result<u64, StorageError>;

    async fn get_info_items_failed(&self) -> Result<u64, StorageError>;

    async fn set_info_time_initialised(&self, value: f64) -> Result<(), StorageError>;

    async fn get_info_time_initialised(&self) -> Result<Option<f64>, StorageError>;

    async fn set_info_time_started(&self, value: f64) -> Result<(), StorageError>;

    async fn get_info_time_started(&self) -> Result<Option<f64>, StorageError>;

    async fn get_info_time_running(&self) -> Result<f64, StorageError>;

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError>;
}

/// Build the configured storage backend for a spider namespace.
pub fn build(name: &str, config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::Redis => Ok(Arc::new(RedisStorage::new(name, config)?)),
    }
}

/// Current unix time in fractional seconds.
pub(crate) fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
