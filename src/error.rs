//! Unified error handling for the kumo crate
//!
//! Per-task problems never travel as errors: the controller converts
//! them into a [`Status`](crate::models::Status) on the cycle result.
//! The error types here cover everything else - structural chain
//! failures, storage faults, fetch transport errors and the two fatal
//! budget terminations that end a whole run.

use thiserror::Error;

/// Boxed error type accepted from pluggable chain members.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias using the unified [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Termination
// ============================================================================

/// Fatal run-level terminations raised by the manager.
///
/// These propagate out of `Manager::process`, through the scheduling
/// loop, to `Controller::start`, which logs them and still runs the
/// full teardown chain.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationError {
    /// A task exhausted its transient-retry budget
    #[error("max retries reached, terminating")]
    MaxRetriesReached,

    /// The run exhausted its failed-task budget
    #[error("max failed tasks reached, terminating")]
    MaxFailedReached,
}

// ============================================================================
// Fetch
// ============================================================================

/// Downloader transport errors.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection-class failure; maps to a retrial and resets the session
    #[error("connection error: {0}")]
    Connection(#[source] reqwest::Error),

    /// Request timed out; treated as connection-class
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    /// Any other transport failure
    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),
}

impl FetchError {
    /// True for transient failures that should map to a retrial.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else if err.is_connect() || err.is_request() {
            Self::Connection(err)
        } else {
            Self::Http(err)
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Storage backend errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No task became available within the pop timeout. This is the
    /// normal "nothing ready now" signal, not a fault.
    #[error("task queue is empty")]
    QueueEmpty,

    /// Redis command failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis connection pool failure
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Redis connection pool could not be constructed
    #[error("redis pool setup error: {0}")]
    PoolSetup(#[from] deadpool_redis::CreatePoolError),

    /// Task (de)serialization failure in the shared backend
    #[error("task codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StorageError {
    /// True when the error is the benign empty-queue signal.
    pub fn is_queue_empty(&self) -> bool {
        matches!(self, Self::QueueEmpty)
    }
}

// ============================================================================
// Unified error
// ============================================================================

/// Unified error type for the kumo crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Fatal run termination (budget exhaustion)
    #[error(transparent)]
    Termination(#[from] TerminationError),

    /// A member of the http middleware chain failed
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[source] BoxError),

    /// A member of the spider middleware chain failed
    #[error("spider middleware error: {0}")]
    SpiderMiddleware(#[source] BoxError),

    /// A member of the startup pipeline failed
    #[error("startup pipeline error: {0}")]
    StartupPipeline(#[source] BoxError),

    /// A member of the items pipeline failed
    #[error("items pipeline error: {0}")]
    ItemsPipeline(#[source] BoxError),

    /// A member of the tasks pipeline failed
    #[error("tasks pipeline error: {0}")]
    TasksPipeline(#[source] BoxError),

    /// Spider extraction failure
    #[error("spider error: {0}")]
    Spider(#[source] BoxError),

    /// Downloader transport failure
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Storage backend failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Unknown spider or chain member name in configuration
    #[error("no such component: {0}")]
    NoSuchComponent(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True if this error must end the whole run.
    pub fn is_termination(&self) -> bool {
        matches!(self, Self::Termination(_))
    }
}
