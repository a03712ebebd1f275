//! kumo - web-crawl execution engine
//!
//! Given a set of seed URLs and a pluggable [`Spider`](spider::Spider),
//! kumo fetches pages, extracts further URLs and data records, and
//! drives itself to queue-empty termination while enforcing concurrency
//! limits, throttling, retry policy and failure budgets.
//!
//! # Architecture
//!
//! - [`models`] - value types carried through the pipeline
//! - [`engine`] - controller, manager and the scheduling loop
//! - [`middleware`] / [`pipeline`] - ordered interceptor chains
//! - [`storage`] - task/item bookkeeping (memory or shared Redis)
//! - [`throttle`] - inter-request delay state machine
//! - [`spider`] / [`downloader`] - extraction and fetch capabilities
//! - [`registry`] - typed name-to-factory component mapping
//! - [`signals`] - best-effort lifecycle notification bus
//! - [`server`] - HTTP facade for single-cycle processing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kumo::config::Config;
//! use kumo::engine::Controller;
//! use kumo::registry::Registry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Registry::with_defaults();
//!     let spider = registry.spider("demo")?;
//!     let controller = Arc::new(Controller::new(
//!         spider,
//!         Arc::new(Config::default()),
//!         &registry,
//!     )?);
//!     controller.start().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod demo;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod signals;
pub mod spider;
pub mod storage;
pub mod throttle;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{Controller, Manager};
    pub use crate::error::{Error, Result, TerminationError};
    pub use crate::models::{CycleResult, Item, Request, Response, Status, Task};
    pub use crate::registry::Registry;
    pub use crate::spider::{Spider, SpiderUrls};
    pub use crate::storage::{MemoryStorage, RedisStorage, Storage};
    pub use crate::throttle::Throttle;
}

// Direct re-exports for convenience
pub use models::{CycleResult, Item, Request, Response, Status, Task};
