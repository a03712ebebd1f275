//! Spider contract - the pluggable extraction capability
//!
//! A spider owns everything site-specific: the seed URLs, which links
//! to follow, and how a page turns into items. The engine only ever
//! talks to the [`Spider`] trait; the default `tasks` implementation
//! covers the common case of following links matched by allow/avoid
//! CSS selector rules.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use crate::error::BoxError;
use crate::models::{Item, Response, Task};

/// URL rules driving seed tasks and default link extraction.
///
/// `allow` and `avoid` are CSS selectors matching anchor elements; the
/// `href` attribute of every match is collected, avoided entries are
/// subtracted, and relative URLs resolve against the response URL.
#[derive(Debug, Clone, Default)]
pub struct SpiderUrls {
    pub start: Vec<String>,
    pub allow: Vec<String>,
    pub avoid: Vec<String>,
}

/// Pluggable extraction capability for one target site.
#[async_trait]
pub trait Spider: Send + Sync {
    /// Unique spider name; also the storage namespace.
    fn name(&self) -> &str;

    /// Seed and link-extraction URL rules.
    fn urls(&self) -> &SpiderUrls;

    /// Derive follow-up tasks from a fetched page.
    ///
    /// The default applies the allow/avoid selector rules from
    /// [`Spider::urls`] to the response body.
    async fn tasks(&self, _task: &Task, response: &Response) -> Result<HashSet<Task>, BoxError> {
        extract_tasks(self.urls(), response)
    }

    /// Extract data records from a fetched page.
    async fn items(&self, task: &Task, response: &Response) -> Result<Vec<Box<dyn Item>>, BoxError>;

    /// Extra header arguments merged into every fetch for this spider.
    fn request(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Custom HTTP session for special cases like authentication.
    /// Returning `None` lets the engine build the shared default.
    async fn session(&self) -> Option<reqwest::Client> {
        None
    }

    /// Optional dedup key override for delta-scrape setups. `None`
    /// skips the custom behavior.
    async fn hash(&self, _task: &Task, _response: &Response) -> Option<String> {
        None
    }
}

impl std::fmt::Debug for dyn Spider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spider").field("name", &self.name()).finish()
    }
}

/// Apply allow/avoid selector rules to a response body.
///
/// Kept synchronous so the parsed document never crosses an await
/// point.
pub fn extract_tasks(urls: &SpiderUrls, response: &Response) -> Result<HashSet<Task>, BoxError> {
    let document = Html::parse_document(&response.text);
    let base = Url::parse(&response.url).map_err(|e| format!("invalid response url: {e}"))?;

    let mut allowed = HashSet::new();
    for rule in &urls.allow {
        allowed.extend(select_urls(&document, &base, rule)?);
    }
    for rule in &urls.avoid {
        for url in select_urls(&document, &base, rule)? {
            allowed.remove(&url);
        }
    }

    Ok(allowed.into_iter().map(Task::new).collect())
}

fn select_urls(document: &Html, base: &Url, rule: &str) -> Result<HashSet<String>, BoxError> {
    let selector =
        Selector::parse(rule).map_err(|e| format!("invalid url selector {rule:?}: {e}"))?;

    let mut urls = HashSet::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        match base.join(href) {
            Ok(resolved) => {
                urls.insert(resolved.to_string());
            }
            Err(e) => {
                tracing::debug!(href, error = %e, "skipping unresolvable link");
            }
        }
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    fn response(url: &str, body: &str) -> Response {
        Response {
            url: url.to_string(),
            version: "HTTP/1.1".to_string(),
            status: 200,
            reason: "OK".to_string(),
            headers: HeaderMap::new(),
            text: body.to_string(),
        }
    }

    const PAGE: &str = r#"<!DOCTYPE html>
        <html><body>
            <nav>
                <a href="/jeans/">jeans</a>
                <a href="/shoes/">shoes</a>
                <a href="http://other.example.org/external/">external</a>
            </nav>
            <div id="product-list">
                <a href="/jeans/11001/">name 11001</a>
                <a href="/sale/99/">sale</a>
            </div>
        </body></html>"#;

    #[test]
    fn test_relative_urls_resolve_against_response_url() {
        let urls = SpiderUrls {
            start: vec![],
            allow: vec!["nav a".to_string()],
            avoid: vec![],
        };
        let tasks = extract_tasks(&urls, &response("http://example.com/", PAGE)).unwrap();
        let found: HashSet<String> = tasks.into_iter().map(|t| t.url).collect();
        assert!(found.contains("http://example.com/jeans/"));
        assert!(found.contains("http://example.com/shoes/"));
        assert!(found.contains("http://other.example.org/external/"));
    }

    #[test]
    fn test_avoid_rules_subtract_from_allowed() {
        let urls = SpiderUrls {
            start: vec![],
            allow: vec!["a".to_string()],
            avoid: vec![r#"a[href*="/sale/"]"#.to_string()],
        };
        let tasks = extract_tasks(&urls, &response("http://example.com/", PAGE)).unwrap();
        let found: HashSet<String> = tasks.into_iter().map(|t| t.url).collect();
        assert!(found.contains("http://example.com/jeans/11001/"));
        assert!(!found.iter().any(|u| u.contains("/sale/")));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let urls = SpiderUrls {
            start: vec![],
            allow: vec!["#product-list a".to_string()],
            avoid: vec![],
        };
        let first = extract_tasks(&urls, &response("http://example.com/", PAGE)).unwrap();
        let second = extract_tasks(&urls, &response("http://example.com/", PAGE)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_selector_is_an_error() {
        let urls = SpiderUrls {
            start: vec![],
            allow: vec!["a[".to_string()],
            avoid: vec![],
        };
        assert!(extract_tasks(&urls, &response("http://example.com/", PAGE)).is_err());
    }
}
