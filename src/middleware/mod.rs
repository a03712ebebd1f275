//! Middleware chains
//!
//! Two interceptor chains wrap every task cycle: http middleware around
//! the request/response pair and spider middleware around extraction.
//! Both follow the same onion model - `before` runs members in forward
//! order, `after` in reverse, so the first member in is the last one
//! out. `initialise` runs forward once before the loop starts and
//! `finalise` in reverse once it ends.
//!
//! A chain is the compiled-in base list followed by the configured
//! custom list; deployments extend chains, they cannot bypass base
//! behavior. Members instantiate lazily on first use and stay cached
//! for the run. Default trait methods are identity transforms, so a
//! member only implements the hooks it cares about.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::downloader::default_headers;
use crate::engine::Context;
use crate::error::{BoxError, Error, Result};
use crate::models::{Item, Request, Response, Task};
use crate::signals::SignalKind;

/// Base http middleware, always first in the chain.
pub const BASE_HTTP_MIDDLEWARE: &[&str] = &["session", "headers"];

/// Base spider middleware. Empty; custom members append here.
pub const BASE_SPIDER_MIDDLEWARE: &[&str] = &[];

// ============================================================================
// Traits
// ============================================================================

/// Request/response interceptor.
#[async_trait]
pub trait HttpMiddleware: Send + Sync {
    /// Runs once, before the scheduling loop starts.
    async fn initialise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Transform the outgoing request. Runs once per cycle.
    async fn before(
        &self,
        _ctx: &Context,
        request: Request,
    ) -> std::result::Result<Request, BoxError> {
        Ok(request)
    }

    /// Transform the incoming response. Runs once per cycle, in
    /// reverse chain order.
    async fn after(
        &self,
        _ctx: &Context,
        response: Response,
    ) -> std::result::Result<Response, BoxError> {
        Ok(response)
    }

    /// Runs once, after the scheduling loop ends.
    async fn finalise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Task/response interceptor around spider extraction.
#[async_trait]
pub trait SpiderMiddleware: Send + Sync {
    async fn initialise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    /// Transform the (task, response) pair before extraction.
    async fn before(
        &self,
        _ctx: &Context,
        task: Task,
        response: Response,
    ) -> std::result::Result<(Task, Response), BoxError> {
        Ok((task, response))
    }

    /// Transform the extraction output, in reverse chain order.
    async fn after(
        &self,
        _ctx: &Context,
        tasks: HashSet<Task>,
        items: Vec<Box<dyn Item>>,
    ) -> std::result::Result<(HashSet<Task>, Vec<Box<dyn Item>>), BoxError> {
        Ok((tasks, items))
    }

    async fn finalise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

pub type HttpMiddlewareFactory = Arc<dyn Fn() -> Box<dyn HttpMiddleware> + Send + Sync>;
pub type SpiderMiddlewareFactory = Arc<dyn Fn() -> Box<dyn SpiderMiddleware> + Send + Sync>;

// ============================================================================
// Chains
// ============================================================================

/// Ordered http middleware chain.
pub struct HttpMiddlewareChain {
    factories: Vec<HttpMiddlewareFactory>,
    cached: OnceLock<Vec<Box<dyn HttpMiddleware>>>,
}

impl HttpMiddlewareChain {
    pub fn new(factories: Vec<HttpMiddlewareFactory>) -> Self {
        Self {
            factories,
            cached: OnceLock::new(),
        }
    }

    fn members(&self) -> &[Box<dyn HttpMiddleware>] {
        self.cached
            .get_or_init(|| self.factories.iter().map(|f| f()).collect())
    }

    pub async fn initialise(&self, ctx: &Context) -> Result<()> {
        for member in self.members() {
            member.initialise(ctx).await.map_err(Error::HttpMiddleware)?;
        }
        Ok(())
    }

    pub async fn before(&self, ctx: &Context, mut request: Request) -> Result<Request> {
        let members = self.members();
        if !members.is_empty() {
            ctx.signals
                .emit(SignalKind::HttpMiddlewareStarted, Some(request.url.clone()));
            for member in members {
                request = member
                    .before(ctx, request)
                    .await
                    .map_err(Error::HttpMiddleware)?;
            }
        }
        Ok(request)
    }

    pub async fn after(&self, ctx: &Context, mut response: Response) -> Result<Response> {
        let members = self.members();
        if !members.is_empty() {
            for member in members.iter().rev() {
                response = member
                    .after(ctx, response)
                    .await
                    .map_err(Error::HttpMiddleware)?;
            }
            ctx.signals.emit(
                SignalKind::HttpMiddlewareFinished,
                Some(response.url.clone()),
            );
        }
        Ok(response)
    }

    pub async fn finalise(&self, ctx: &Context) -> Result<()> {
        for member in self.members().iter().rev() {
            member.finalise(ctx).await.map_err(Error::HttpMiddleware)?;
        }
        Ok(())
    }
}

/// Ordered spider middleware chain.
pub struct SpiderMiddlewareChain {
    factories: Vec<SpiderMiddlewareFactory>,
    cached: OnceLock<Vec<Box<dyn SpiderMiddleware>>>,
}

impl SpiderMiddlewareChain {
    pub fn new(factories: Vec<SpiderMiddlewareFactory>) -> Self {
        Self {
            factories,
            cached: OnceLock::new(),
        }
    }

    fn members(&self) -> &[Box<dyn SpiderMiddleware>] {
        self.cached
            .get_or_init(|| self.factories.iter().map(|f| f()).collect())
    }

    pub async fn initialise(&self, ctx: &Context) -> Result<()> {
        for member in self.members() {
            member
                .initialise(ctx)
                .await
                .map_err(Error::SpiderMiddleware)?;
        }
        Ok(())
    }

    pub async fn before(
        &self,
        ctx: &Context,
        mut task: Task,
        mut response: Response,
    ) -> Result<(Task, Response)> {
        let members = self.members();
        if !members.is_empty() {
            ctx.signals
                .emit(SignalKind::SpiderMiddlewareStarted, Some(task.url.clone()));
            for member in members {
                (task, response) = member
                    .before(ctx, task, response)
                    .await
                    .map_err(Error::SpiderMiddleware)?;
            }
        }
        Ok((task, response))
    }

    pub async fn after(
        &self,
        ctx: &Context,
        mut tasks: HashSet<Task>,
        mut items: Vec<Box<dyn Item>>,
    ) -> Result<(HashSet<Task>, Vec<Box<dyn Item>>)> {
        let members = self.members();
        if !members.is_empty() {
            for member in members.iter().rev() {
                (tasks, items) = member
                    .after(ctx, tasks, items)
                    .await
                    .map_err(Error::SpiderMiddleware)?;
            }
            ctx.signals.emit(
                SignalKind::SpiderMiddlewareFinished,
                Some(format!("tasks={} items={}", tasks.len(), items.len())),
            );
        }
        Ok((tasks, items))
    }

    pub async fn finalise(&self, ctx: &Context) -> Result<()> {
        for member in self.members().iter().rev() {
            member
                .finalise(ctx)
                .await
                .map_err(Error::SpiderMiddleware)?;
        }
        Ok(())
    }
}

// ============================================================================
// Base middleware
// ============================================================================

/// Ensures the shared session exists before the first fetch of a cycle.
pub struct Session;

#[async_trait]
impl HttpMiddleware for Session {
    async fn before(
        &self,
        ctx: &Context,
        request: Request,
    ) -> std::result::Result<Request, BoxError> {
        ctx.session
            .ensure(&ctx.config.crawler, ctx.spider.as_ref())
            .await?;
        Ok(request)
    }
}

/// Applies default request headers without clobbering caller-set ones.
pub struct Headers;

#[async_trait]
impl HttpMiddleware for Headers {
    async fn before(
        &self,
        ctx: &Context,
        mut request: Request,
    ) -> std::result::Result<Request, BoxError> {
        for (name, value) in default_headers(&ctx.config.crawler.user_agent) {
            request.headers.entry(name).or_insert(value);
        }
        Ok(request)
    }
}
