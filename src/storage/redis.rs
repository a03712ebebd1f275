//! Shared Redis storage backend
//!
//! Coordinates multiple crawler processes through one key space per
//! spider name:
//!
//! - `{name}:leader` - SETNX leader flag, held for the run
//! - `{name}:tasks:queued` - task list, RPUSH / BLPOP
//! - `{name}:tasks:processed` / `{name}:tasks:failed` - task sets
//! - `{name}:info:*` - counters and timestamps
//!
//! Tasks cross the wire as JSON. Enqueueing runs as a single Lua script
//! so the processed-set membership test and the queue push are atomic
//! with respect to every other process; two processes can therefore
//! never double-process the same task.

use std::collections::HashSet;

use async_trait::async_trait;
use deadpool_redis::{Pool, Runtime};
use redis::AsyncCommands;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::models::Task;

use super::{unix_now, Storage, StorageSnapshot};

/// BLPOP wait before reporting the queue empty, in seconds.
const POP_TIMEOUT_SECS: f64 = 1.0;

/// Membership test-and-set: mark each task processed and push the ones
/// that were not seen before onto the queue.
const ENQUEUE_SCRIPT: &str = r#"
local added = 0
for _, e in pairs(ARGV) do
    if redis.call('SADD', KEYS[1], e) == 1 then
        redis.call('RPUSH', KEYS[2], e)
        added = added + 1
    end
end
return added
"#;

/// Shared storage backend over one Redis namespace.
pub struct RedisStorage {
    name: String,
    pool: Pool,
    enqueue: redis::Script,
}

impl RedisStorage {
    pub fn new(name: &str, config: &StorageConfig) -> Result<Self, StorageError> {
        let pool = deadpool_redis::Config::from_url(&config.url)
            .create_pool(Some(Runtime::Tokio1))?;
        pool.resize(config.max_connections);

        Ok(Self {
            name: name.to_string(),
            pool,
            enqueue: redis::Script::new(ENQUEUE_SCRIPT),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.name, suffix)
    }

    fn encode(task: &Task) -> Result<String, StorageError> {
        Ok(serde_json::to_string(task)?)
    }

    fn decode(encoded: &str) -> Result<Task, StorageError> {
        Ok(serde_json::from_str(encoded)?)
    }

    fn decode_set(encoded: Vec<String>) -> Result<HashSet<Task>, StorageError> {
        encoded.iter().map(|e| Self::decode(e)).collect()
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn initialise(&self) -> Result<bool, StorageError> {
        let mut conn = self.pool.get().await?;
        let leader: bool = conn.set_nx(self.key("leader"), 1).await?;
        let keys: Vec<String> = conn.keys(self.key("*:*")).await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        Ok(leader)
    }

    async fn finalise(&self) -> Result<(), StorageError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.key("leader")).await?;
        Ok(())
    }

    async fn add_tasks_queued(&self, tasks: HashSet<Task>) -> Result<(), StorageError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let mut invocation = self.enqueue.prepare_invoke();
        invocation
            .key(self.key("tasks:processed"))
            .key(self.key("tasks:queued"));
        for task in &tasks {
            invocation.arg(Self::encode(task)?);
        }
        let _added: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(())
    }

    async fn get_tasks_queued(&self) -> Result<Task, StorageError> {
        let mut conn = self.pool.get().await?;
        let reply: Option<(String, String)> = conn
            .blpop(self.key("tasks:queued"), POP_TIMEOUT_SECS)
            .await?;
        match reply {
            Some((_key, encoded)) => Self::decode(&encoded),
            None => Err(StorageError::QueueEmpty),
        }
    }

    async fn tasks_queued_is_empty(&self) -> Result<bool, StorageError> {
        let mut conn = self.pool.get().await?;
        let len: i64 = conn.llen(self.key("tasks:queued")).await?;
        Ok(len == 0)
    }

    async fn get_tasks_processed(&self) -> Result<HashSet<Task>, StorageError> {
        let mut conn = self.pool.get().await?;
        let encoded: Vec<String> = conn.smembers(self.key("tasks:processed")).await?;
        Self::decode_set(encoded)
    }

    async fn add_tasks_failed(&self, tasks: HashSet<Task>) -> Result<(), StorageError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let encoded: Vec<String> = tasks
            .iter()
            .map(Self::encode)
            .collect::<Result<_, _>>()?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.sadd(self.key("tasks:failed"), encoded).await?;
        Ok(())
    }

    async fn get_tasks_failed(&self) -> Result<HashSet<Task>, StorageError> {
        let mut conn = self.pool.get().await?;
        let encoded: Vec<String> = conn.smembers(self.key("tasks:failed")).await?;
        Self::decode_set(encoded)
    }

    async fn add_info_items_processed(&self, count: u64) -> Result<u64, StorageError> {
        let mut conn = self.pool.get().await?;
        let total: i64 = conn.incr(self.key("info:items_processed"), count).await?;
        Ok(total as u64)
    }

    async fn get_info_items_processed(&self) -> Result<u64, StorageError> {
        let mut conn = self.pool.get().await?;
        let total: Option<i64> = conn.get(self.key("info:items_processed")).await?;
        Ok(total.unwrap_or(0) as u64)
    }

    async fn add_info_items_failed(&self, count: u64) -> Result<u64, StorageError> {
        let mut conn = self.pool.get().await?;
        let total: i64 = conn.incr(self.key("info:items_failed"), count).await?;
        Ok(total as u64)
    }

    async fn get_info_items_failed(&self) -> Result<u64, StorageError> {
        let mut conn = self.pool.get().await?;
        let total: Option<i64> = conn.get(self.key("info:items_failed")).await?;
        Ok(total.unwrap_or(0) as u64)
    }

    async fn set_info_time_initialised(&self, value: f64) -> Result<(), StorageError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(self.key("info:time_initialised"), value).await?;
        Ok(())
    }

    async fn get_info_time_initialised(&self) -> Result<Option<f64>, StorageError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(self.key("info:time_initialised")).await?)
    }

    async fn set_info_time_started(&self, value: f64) -> Result<(), StorageError> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(self.key("info:time_started"), value).await?;
        Ok(())
    }

    async fn get_info_time_started(&self) -> Result<Option<f64>, StorageError> {
        let mut conn = self.pool.get().await?;
        Ok(conn.get(self.key("info:time_started")).await?)
    }

    async fn get_info_time_running(&self) -> Result<f64, StorageError> {
        let mut conn = self.pool.get().await?;
        let started: Option<f64> = conn.get(self.key("info:time_started")).await?;
        Ok(started.map(|s| unix_now() - s).unwrap_or(0.0))
    }

    async fn snapshot(&self) -> Result<StorageSnapshot, StorageError> {
        let mut conn = self.pool.get().await?;
        let queued: i64 = conn.llen(self.key("tasks:queued")).await?;
        let processed: i64 = conn.scard(self.key("tasks:processed")).await?;
        let failed: i64 = conn.scard(self.key("tasks:failed")).await?;
        let items_processed: Option<i64> = conn.get(self.key("info:items_processed")).await?;
        let items_failed: Option<i64> = conn.get(self.key("info:items_failed")).await?;
        let started: Option<f64> = conn.get(self.key("info:time_started")).await?;

        Ok(StorageSnapshot {
            time_running: started.map(|s| unix_now() - s).unwrap_or(0.0),
            tasks_queued: queued as usize,
            tasks_processed: processed as usize,
            tasks_failed: failed as usize,
            items_processed: items_processed.unwrap_or(0) as u64,
            items_failed: items_failed.unwrap_or(0) as u64,
        })
    }
}
