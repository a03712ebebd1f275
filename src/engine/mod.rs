//! Crawl orchestration
//!
//! The [`Manager`] owns queue/retry/failure bookkeeping and the
//! keep-going decision; the [`Controller`] owns the scheduling loop,
//! the per-task processing cycle and run lifecycle. [`Context`] is the
//! engine-side view handed to middleware, pipelines and the downloader
//! on every invocation.

pub mod controller;
pub mod manager;

use std::sync::Arc;

pub use controller::Controller;
pub use manager::Manager;

use crate::config::Config;
use crate::downloader::SharedSession;
use crate::signals::SignalBus;
use crate::spider::Spider;

/// Engine-side view passed into pluggable components.
///
/// Everything here is shared state owned by the controller; components
/// hold it only for the duration of one call.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub spider: Arc<dyn Spider>,
    pub session: Arc<SharedSession>,
    pub signals: Arc<SignalBus>,
}
