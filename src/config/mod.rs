//! Configuration for the crawl engine
//!
//! One explicit [`Config`] struct is built at startup and passed by
//! reference into the controller and its children; there is no ambient
//! global state. Values load from a TOML file, with environment
//! variable overrides for the common deployment knobs.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Crawl limits and HTTP behavior
    pub crawler: CrawlerConfig,

    /// Inter-request throttling
    pub throttle: ThrottleConfig,

    /// Task/item bookkeeping backend
    pub storage: StorageConfig,

    /// Custom middleware / pipeline membership, appended after the
    /// compiled-in base lists
    pub chains: ChainsConfig,

    /// HTTP facade
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Crawler-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Maximum number of concurrently processing task cycles
    pub max_concurrent_requests: usize,

    /// Maximum transient retries per task before the run terminates
    pub max_retries: u32,

    /// Maximum total failed tasks before the run terminates
    pub max_failed: usize,

    /// Pause after a transient failure, in seconds
    pub pause_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum number of HTTP redirects followed per request
    pub max_redirects: usize,

    /// User agent string sent by the default headers middleware
    pub user_agent: String,

    /// HTTP status codes recorded as task failures
    pub http_failed: Vec<u16>,

    /// Emit a progress report every N manager iterations
    pub report_frequency: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            max_retries: 5,
            max_failed: 50,
            pause_timeout_secs: 5,
            request_timeout_secs: 20,
            max_redirects: 10,
            user_agent: format!("kumo/{}", env!("CARGO_PKG_VERSION")),
            http_failed: vec![404, 500, 501],
            report_frequency: 100,
        }
    }
}

impl CrawlerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_secs(self.pause_timeout_secs)
    }

    /// The configured HTTP failure statuses as a set.
    pub fn http_failed_set(&self) -> HashSet<u16> {
        self.http_failed.iter().copied().collect()
    }
}

/// Throttle configuration.
///
/// `max_rps` selects rate-capped mode; a registered custom function
/// name selects custom mode; neither leaves the throttle at its fixed
/// minimal delay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Initial sleep between requests, in seconds
    pub sleep: Option<f64>,

    /// Target maximum requests per second
    pub max_rps: Option<f64>,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Private in-process backend
    #[default]
    Memory,
    /// Shared Redis backend coordinating multiple crawler processes
    Redis,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Redis URL, e.g. `redis://localhost:6379/0`
    pub url: String,

    /// Redis connection pool size
    pub max_connections: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
        }
    }
}

/// Custom chain membership, by registry identifier.
///
/// Each list is appended after the corresponding compiled-in base list,
/// so deployments can extend every chain but not bypass mandatory base
/// behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainsConfig {
    pub http_middleware: Vec<String>,
    pub spider_middleware: Vec<String>,
    pub startup_pipeline: Vec<String>,
    pub items_pipeline: Vec<String>,
    pub tasks_pipeline: Vec<String>,
}

/// HTTP facade configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0:5566`
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:5566".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment variable overrides on top of current values.
    pub fn apply_env(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("KUMO_MAX_CONCURRENT_REQUESTS") {
            self.crawler.max_concurrent_requests = v;
        }
        if let Some(v) = env_parse::<u32>("KUMO_MAX_RETRIES") {
            self.crawler.max_retries = v;
        }
        if let Some(v) = env_parse::<usize>("KUMO_MAX_FAILED") {
            self.crawler.max_failed = v;
        }
        if let Some(v) = env_parse::<f64>("KUMO_MAX_RPS") {
            self.throttle.max_rps = Some(v);
        }
        if let Ok(v) = std::env::var("KUMO_REDIS_URL") {
            self.storage.url = v;
            self.storage.backend = StorageBackend::Redis;
        }
        if let Ok(v) = std::env::var("KUMO_LOG_LEVEL") {
            self.logging.level = v;
        }
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.max_concurrent_requests == 0 {
            anyhow::bail!("max_concurrent_requests must be greater than 0");
        }

        if self.crawler.max_retries == 0 {
            anyhow::bail!("max_retries must be greater than 0");
        }

        if self.crawler.max_failed == 0 {
            anyhow::bail!("max_failed must be greater than 0");
        }

        if let Some(rps) = self.throttle.max_rps {
            if rps <= 0.0 {
                anyhow::bail!("throttle.max_rps must be positive");
            }
        }

        if self.storage.max_connections == 0 {
            anyhow::bail!("storage.max_connections must be greater than 0");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
