//! Core value types carried through the crawl pipeline
//!
//! Everything in this module is data with no behavior attached:
//! [`Task`] is the unit of crawl work and the dedup key, [`Request`] /
//! [`Response`] are the HTTP-facing pair, and [`CycleResult`] is the
//! per-cycle outcome handed to the manager.

use std::collections::{BTreeMap, HashSet};

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Status
// ============================================================================

/// Outcome classification of one processing cycle.
///
/// HTTP statuses are carried verbatim so the failure set stays
/// configurable; everything else collapses into the three engine-level
/// outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Cycle completed normally
    #[default]
    Ok,
    /// Cycle failed for a non-transient reason
    Failed,
    /// Cycle hit a transient condition and should be re-tried
    Retrial,
    /// Cycle short-circuited on an HTTP status from the configured failure set
    Http(u16),
}

impl Status {
    /// Numeric code, matching the wire representation used in reporting.
    pub fn as_code(&self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::Failed => 1,
            Self::Retrial => 2,
            Self::Http(code) => *code,
        }
    }

    /// True if this status counts against the failed-task budget.
    ///
    /// `http_failed` is the configured set of HTTP statuses treated as
    /// task failures (404/500/501 by default).
    pub fn is_failure(&self, http_failed: &HashSet<u16>) -> bool {
        match self {
            Self::Failed => true,
            Self::Http(code) => http_failed.contains(code),
            _ => false,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// One unit of crawl work.
///
/// Identity is structural over `(url, data)` and is what the storage
/// layer dedups on. Tasks are immutable once created; the optional data
/// map carries opaque spider payload between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Task {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, String>>,
}

impl Task {
    /// Create a task for a bare URL with no payload.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            data: None,
        }
    }

    /// Create a task carrying spider payload.
    pub fn with_data(url: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        Self {
            url: url.into(),
            data: Some(data),
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Task url={}>", self.url)
    }
}

// ============================================================================
// Item
// ============================================================================

/// One extracted data record.
///
/// The engine never looks inside items; the only contract is conversion
/// to a plain key-value map for output and reporting.
pub trait Item: std::fmt::Debug + Send + Sync {
    /// Convert the item into its key-value representation.
    fn to_map(&self) -> serde_json::Map<String, serde_json::Value>;
}

// ============================================================================
// Request / Response
// ============================================================================

/// Mutable HTTP request under construction.
///
/// Built from a [`Task`] URL and passed through the http middleware
/// `before` chain, which is free to add headers prior to the fetch.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: String,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }
}

/// Immutable HTTP response as produced by the downloader.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects
    pub url: String,
    /// HTTP version, e.g. `HTTP/1.1`
    pub version: String,
    /// HTTP status code
    pub status: u16,
    /// HTTP status text
    pub reason: String,
    pub headers: HeaderMap,
    /// Response body decoded to text
    pub text: String,
}

// ============================================================================
// CycleResult
// ============================================================================

/// Outcome of one `process(task)` cycle, handed to the manager.
///
/// Exactly one of the retrial / failed / success paths is taken per
/// result when the manager applies it.
#[derive(Debug, Default)]
pub struct CycleResult {
    pub status: Status,
    pub task: Task,
    /// Newly discovered tasks, subject to storage dedup
    pub tasks: HashSet<Task>,
    /// Extracted items
    pub items: Vec<Box<dyn Item>>,
}

impl CycleResult {
    pub fn new(
        status: Status,
        task: Task,
        tasks: HashSet<Task>,
        items: Vec<Box<dyn Item>>,
    ) -> Self {
        Self {
            status,
            task,
            tasks,
            items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_task_structural_equality() {
        let a = Task::new("http://example.com/1/");
        let b = Task::new("http://example.com/1/");
        let c = Task::new("http://example.com/2/");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_task_data_participates_in_identity() {
        let mut data = BTreeMap::new();
        data.insert("depth".to_string(), "2".to_string());
        let plain = Task::new("http://example.com/");
        let tagged = Task::with_data("http://example.com/", data);
        assert_ne!(plain, tagged);
        assert_ne!(hash_of(&plain), hash_of(&tagged));
    }

    #[test]
    fn test_task_serde_round_trip() {
        let mut data = BTreeMap::new();
        data.insert("page".to_string(), "3".to_string());
        let task = Task::with_data("http://example.com/list/", data);
        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: Task = serde_json::from_str(&encoded).unwrap();
        assert_eq!(task, decoded);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok.as_code(), 0);
        assert_eq!(Status::Failed.as_code(), 1);
        assert_eq!(Status::Retrial.as_code(), 2);
        assert_eq!(Status::Http(404).as_code(), 404);
    }

    #[test]
    fn test_status_failure_set() {
        let http_failed: HashSet<u16> = [404, 500, 501].into_iter().collect();
        assert!(Status::Failed.is_failure(&http_failed));
        assert!(Status::Http(404).is_failure(&http_failed));
        assert!(Status::Http(500).is_failure(&http_failed));
        assert!(!Status::Http(200).is_failure(&http_failed));
        assert!(!Status::Ok.is_failure(&http_failed));
        assert!(!Status::Retrial.is_failure(&http_failed));
    }
}
