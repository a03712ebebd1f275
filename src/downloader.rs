//! Fetch capability and the shared HTTP session
//!
//! One session (a [`reqwest::Client`] with its connection pool) is
//! shared by every concurrent task cycle. It is created lazily by the
//! first cycle that needs it, replaced when a connection-class error
//! suggests it is poisoned, and dropped once at finalise.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{redirect, Client};
use tokio::sync::RwLock;

use crate::config::CrawlerConfig;
use crate::error::FetchError;
use crate::models::{Request, Response};
use crate::signals::SignalKind;
use crate::spider::Spider;

// ============================================================================
// Shared session
// ============================================================================

/// Lazily created HTTP session shared across all in-flight cycles.
#[derive(Default)]
pub struct SharedSession {
    client: RwLock<Option<Client>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session, creating it on first use. Concurrent
    /// creators converge on a single instance; a spider-provided
    /// session takes precedence over the default build.
    pub async fn ensure(
        &self,
        config: &CrawlerConfig,
        spider: &dyn Spider,
    ) -> Result<Client, FetchError> {
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(client.clone());
        }

        let mut guard = self.client.write().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }

        let client = match spider.session().await {
            Some(custom) => custom,
            None => Self::build(config)?,
        };
        *guard = Some(client.clone());
        Ok(client)
    }

    fn build(config: &CrawlerConfig) -> Result<Client, FetchError> {
        let redirects = if config.max_redirects == 0 {
            redirect::Policy::none()
        } else {
            redirect::Policy::limited(config.max_redirects)
        };

        Client::builder()
            .timeout(config.request_timeout())
            .redirect(redirects)
            .cookie_store(true)
            .gzip(true)
            .build()
            .map_err(FetchError::from)
    }

    /// Discard the current session so the next cycle builds a fresh one.
    pub async fn reset(&self) {
        *self.client.write().await = None;
    }

    pub async fn is_open(&self) -> bool {
        self.client.read().await.is_some()
    }

    /// Tear the session down. Connections drain as the last clone drops.
    pub async fn close(&self) {
        self.reset().await;
    }
}

// ============================================================================
// Downloader
// ============================================================================

/// Performs one HTTP GET per request through the shared session.
pub struct Downloader;

impl Downloader {
    pub fn new() -> Self {
        Self
    }

    /// Fetch a request, producing a populated [`Response`].
    ///
    /// Transport failures surface as [`FetchError`]; connection-class
    /// variants are what the controller maps to a retrial.
    pub async fn fetch(
        &self,
        ctx: &crate::engine::Context,
        request: &Request,
    ) -> Result<Response, FetchError> {
        let client = ctx
            .session
            .ensure(&ctx.config.crawler, ctx.spider.as_ref())
            .await?;

        let mut headers = request.headers.clone();
        merge_spider_headers(&mut headers, ctx.spider.as_ref());

        let reply = client.get(&request.url).headers(headers).send().await?;

        let status = reply.status();
        let response = Response {
            url: reply.url().to_string(),
            version: format!("{:?}", reply.version()),
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers: reply.headers().clone(),
            text: reply.text().await?,
        };

        ctx.signals
            .emit(SignalKind::ResponseCreated, Some(response.url.clone()));
        Ok(response)
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge the spider's extra header arguments, skipping anything that is
/// not a valid header and leaving caller-set values untouched.
fn merge_spider_headers(headers: &mut HeaderMap, spider: &dyn Spider) {
    for (key, value) in spider.request() {
        let name = match key.parse::<HeaderName>() {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(header = %key, error = %e, "ignoring invalid spider header name");
                continue;
            }
        };
        if headers.contains_key(&name) {
            continue;
        }
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => {
                tracing::warn!(header = %key, error = %e, "ignoring invalid spider header value");
            }
        }
    }
}

/// Default request headers applied by the base `headers` middleware.
pub(crate) fn default_headers(user_agent: &str) -> Vec<(HeaderName, HeaderValue)> {
    let mut defaults = Vec::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        defaults.push((USER_AGENT, value));
    }
    defaults.push((
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    ));
    defaults
}
