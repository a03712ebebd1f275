//! Top-level crawl orchestration
//!
//! The controller owns the fixed per-task pipeline
//! manager → downloader → middleware → spider → pipelines → manager,
//! the scheduling loop, and run lifecycle. `start` drives
//! `initialise → run → finalise` and guarantees teardown on every exit
//! path, including operator interruption.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::Config;
use crate::downloader::{Downloader, SharedSession};
use crate::error::{Error, Result};
use crate::middleware::{
    HttpMiddlewareChain, SpiderMiddlewareChain, BASE_HTTP_MIDDLEWARE, BASE_SPIDER_MIDDLEWARE,
};
use crate::models::{CycleResult, Item, Request, Status, Task};
use crate::pipeline::{
    ItemsPipelineChain, StartupPipelineChain, TasksPipelineChain, BASE_ITEMS_PIPELINE,
    BASE_STARTUP_PIPELINE, BASE_TASKS_PIPELINE,
};
use crate::registry::Registry;
use crate::signals::SignalBus;
use crate::spider::Spider;
use crate::storage::{self, StorageSnapshot};
use crate::throttle::{Throttle, ThrottleState};

use super::{Context, Manager};

/// Combined reporting snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlStats {
    pub storage: StorageSnapshot,
    pub throttle: ThrottleState,
}

/// Top-level orchestrator for one spider's crawl.
pub struct Controller {
    config: Arc<Config>,
    spider: RwLock<Arc<dyn Spider>>,
    manager: Manager,
    session: Arc<SharedSession>,
    signals: Arc<SignalBus>,
    downloader: Downloader,
    throttle: Mutex<Throttle>,
    http_middleware: HttpMiddlewareChain,
    spider_middleware: SpiderMiddlewareChain,
    startup_pipeline: StartupPipelineChain,
    items_pipeline: ItemsPipelineChain,
    tasks_pipeline: TasksPipelineChain,
    http_failed: HashSet<u16>,
    is_leader: AtomicBool,
    last_report: AtomicU64,
}

impl Controller {
    /// Build a controller, resolving chain membership (base lists plus
    /// configured custom lists) through the registry up front.
    pub fn new(
        spider: Arc<dyn Spider>,
        config: Arc<Config>,
        registry: &Registry,
    ) -> Result<Self> {
        let storage = storage::build(spider.name(), &config.storage)?;
        let manager = Manager::new(spider.name(), storage, Arc::clone(&config));

        let chains = &config.chains;
        let http_middleware = HttpMiddlewareChain::new(registry.http_middleware(&chain_names(
            BASE_HTTP_MIDDLEWARE,
            &chains.http_middleware,
        ))?);
        let spider_middleware = SpiderMiddlewareChain::new(registry.spider_middleware(
            &chain_names(BASE_SPIDER_MIDDLEWARE, &chains.spider_middleware),
        )?);
        let startup_pipeline = StartupPipelineChain::new(registry.startup_pipelines(
            &chain_names(BASE_STARTUP_PIPELINE, &chains.startup_pipeline),
        )?);
        let items_pipeline = ItemsPipelineChain::new(registry.items_pipelines(&chain_names(
            BASE_ITEMS_PIPELINE,
            &chains.items_pipeline,
        ))?);
        let tasks_pipeline = TasksPipelineChain::new(registry.tasks_pipelines(&chain_names(
            BASE_TASKS_PIPELINE,
            &chains.tasks_pipeline,
        ))?);

        Ok(Self {
            http_failed: config.crawler.http_failed_set(),
            throttle: Mutex::new(Throttle::new(&config.throttle)),
            spider: RwLock::new(spider),
            manager,
            session: Arc::new(SharedSession::new()),
            signals: Arc::new(SignalBus::new()),
            downloader: Downloader::new(),
            http_middleware,
            spider_middleware,
            startup_pipeline,
            items_pipeline,
            tasks_pipeline,
            is_leader: AtomicBool::new(false),
            last_report: AtomicU64::new(0),
            config,
        })
    }

    /// Replace the throttle, e.g. with a custom-function mode instance.
    pub fn with_throttle(self, throttle: Throttle) -> Self {
        *self.throttle.lock().expect("throttle lock poisoned") = throttle;
        self
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn spider_name(&self) -> String {
        self.current_spider().name().to_string()
    }

    fn current_spider(&self) -> Arc<dyn Spider> {
        Arc::clone(&self.spider.read().expect("spider lock poisoned"))
    }

    fn context(&self) -> Context {
        Context {
            config: Arc::clone(&self.config),
            spider: self.current_spider(),
            session: Arc::clone(&self.session),
            signals: Arc::clone(&self.signals),
        }
    }

    /// Run the whole lifecycle, guaranteeing `finalise` on every exit
    /// path. Run errors (including fatal budget terminations) are
    /// logged and the crawl ends cleanly; only teardown failures
    /// surface to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tracing::debug!("kumo: starting");
        let outcome = match self.initialise().await {
            Ok(()) => {
                tokio::select! {
                    result = self.run() => result,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupted, shutting down");
                        Ok(())
                    }
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            tracing::error!(error = %e, "crawl ended with error");
        }
        self.finalise().await
    }

    /// Prepare the run: clear the work signal, initialise storage
    /// (with leader-election jitter), run chain initialise hooks and
    /// the startup pipeline, then seed the queue with the spider's
    /// start URLs.
    pub async fn initialise(&self) -> Result<()> {
        tracing::debug!("kumo: initialising");
        self.manager.work().clear();

        let jitter = rand::thread_rng().gen_range(0..100u64);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let is_leader = self.manager.storage().initialise().await?;
        self.is_leader.store(is_leader, Ordering::SeqCst);
        if is_leader {
            self.manager
                .storage()
                .set_info_time_initialised(storage::unix_now())
                .await?;
        }

        let ctx = self.context();
        self.http_middleware.initialise(&ctx).await?;
        self.spider_middleware.initialise(&ctx).await?;
        self.startup_pipeline.initialise(&ctx).await?;
        self.tasks_pipeline.initialise(&ctx).await?;
        self.items_pipeline.initialise(&ctx).await?;

        let spider = self
            .startup_pipeline
            .process(&ctx, ctx.spider.clone())
            .await?;
        let seeds: HashSet<Task> = spider.urls().start.iter().map(Task::new).collect();
        *self.spider.write().expect("spider lock poisoned") = spider;
        self.manager.storage().add_tasks_queued(seeds).await?;
        Ok(())
    }

    /// The scheduling loop.
    ///
    /// Launches one cycle per scheduled task without joining it; the
    /// loop waits for gate capacity before each launch so in-flight
    /// work stays capped at `max_concurrent_requests`. Between
    /// launches it sleeps the throttle delay, and it parks on the work
    /// signal when nothing is pending. Before concluding the run it
    /// drains in-flight cycles, whose results may have reopened the
    /// queue.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        tracing::debug!("kumo: running");
        if self.is_leader.load(Ordering::SeqCst) {
            self.manager
                .storage()
                .set_info_time_started(storage::unix_now())
                .await?;
        }

        let capacity = self.config.crawler.max_concurrent_requests as u32;
        loop {
            while self.manager.running().await {
                for task in self.manager.scheduled().await? {
                    match self.manager.semaphore().acquire().await {
                        Ok(permit) => drop(permit),
                        Err(_) => return self.conclude(),
                    }

                    let controller = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = controller.process(task).await {
                            if !e.is_termination() {
                                tracing::error!(error = %e, "cycle bookkeeping failed");
                            }
                        }
                    });

                    let delay = self
                        .throttle
                        .lock()
                        .expect("throttle lock poisoned")
                        .sleep();
                    tokio::time::sleep(delay).await;
                }

                self.report().await;

                if !self.manager.work().is_set() {
                    self.manager.work().wait().await;
                }
            }

            // Quiesce: once every permit is reclaimed no cycle is in
            // flight, so a still-empty queue means the crawl is done.
            if let Ok(all) = self.manager.semaphore().acquire_many(capacity).await {
                drop(all);
            }
            if !self.manager.running().await {
                return self.conclude();
            }
        }
    }

    fn conclude(&self) -> Result<()> {
        match self.manager.take_fatal() {
            Some(termination) => Err(termination.into()),
            None => Ok(()),
        }
    }

    /// One full task cycle: request build, http middleware, fetch,
    /// short-circuit on configured HTTP failure statuses, spider
    /// middleware and extraction, tasks/items pipelines, then hand the
    /// outcome to the manager. Per-task errors never escape - they
    /// become the result status. Holds one concurrency-gate slot for
    /// the duration.
    pub async fn process(&self, task: Task) -> Result<CycleResult> {
        let _permit = self
            .manager
            .semaphore()
            .acquire()
            .await
            .expect("concurrency gate closed");

        let ctx = self.context();
        let outcome = self.cycle(&ctx, &task).await;

        let (status, tasks, items) = match outcome {
            Ok(parts) => parts,
            Err(Error::Fetch(e)) if e.is_connection() => {
                tracing::warn!(url = %task.url, error = %e, "connection error, resetting session");
                ctx.session.reset().await;
                (Status::Retrial, HashSet::new(), Vec::new())
            }
            Err(e) => {
                tracing::warn!(url = %task.url, error = %e, "task failed");
                (Status::Failed, HashSet::new(), Vec::new())
            }
        };

        let result = CycleResult::new(status, task, tasks, items);
        self.manager.process(&result).await?;
        Ok(result)
    }

    async fn cycle(
        &self,
        ctx: &Context,
        task: &Task,
    ) -> Result<(Status, HashSet<Task>, Vec<Box<dyn Item>>)> {
        let request = Request::new(&task.url);
        let request = self.http_middleware.before(ctx, request).await?;
        let response = self.downloader.fetch(ctx, &request).await?;
        let response = self.http_middleware.after(ctx, response).await?;

        if self.http_failed.contains(&response.status) {
            return Ok((Status::Http(response.status), HashSet::new(), Vec::new()));
        }

        let (task, response) = self
            .spider_middleware
            .before(ctx, task.clone(), response)
            .await?;
        let tasks = ctx
            .spider
            .tasks(&task, &response)
            .await
            .map_err(Error::Spider)?;
        let items = ctx
            .spider
            .items(&task, &response)
            .await
            .map_err(Error::Spider)?;
        let (tasks, items) = self.spider_middleware.after(ctx, tasks, items).await?;

        let tasks = if tasks.is_empty() {
            tasks
        } else {
            self.tasks_pipeline.process(ctx, tasks).await?
        };
        let items = if items.is_empty() {
            items
        } else {
            self.items_pipeline.process(ctx, items).await?
        };

        Ok((Status::Ok, tasks, items))
    }

    /// Stop the manager, run the teardown chains in reverse setup
    /// order, finalise storage and drop the shared session. Resources
    /// are released even when a teardown stage fails; the first stage
    /// error surfaces to the caller.
    pub async fn finalise(&self) -> Result<()> {
        tracing::debug!("kumo: stopping");
        self.manager.stop();

        let ctx = self.context();
        let mut first_error = None;
        for result in [
            self.items_pipeline.finalise(&ctx).await,
            self.tasks_pipeline.finalise(&ctx).await,
            self.startup_pipeline.finalise(&ctx).await,
            self.spider_middleware.finalise(&ctx).await,
            self.http_middleware.finalise(&ctx).await,
        ] {
            if let Err(e) = result {
                tracing::error!(error = %e, "teardown stage failed");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.manager.storage().finalise().await {
            tracing::error!(error = %e, "storage finalise failed");
            first_error.get_or_insert(e.into());
        }
        if self.session.is_open().await {
            self.session.close().await;
        }

        tracing::debug!("kumo: finished");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Combined storage/throttle snapshot for reporting.
    pub async fn stats(&self) -> Result<CrawlStats> {
        Ok(CrawlStats {
            storage: self.manager.storage().snapshot().await?,
            throttle: self
                .throttle
                .lock()
                .expect("throttle lock poisoned")
                .snapshot(),
        })
    }

    /// Frequency-gated progress log.
    async fn report(&self) {
        let frequency = self.config.crawler.report_frequency;
        if frequency == 0 {
            return;
        }
        let iterations = self.manager.iterations();
        let window = iterations / frequency;
        let previous = self.last_report.load(Ordering::Relaxed);
        if window <= previous
            || self
                .last_report
                .compare_exchange(previous, window, Ordering::Relaxed, Ordering::Relaxed)
                .is_err()
        {
            return;
        }

        match self.stats().await {
            Ok(stats) => {
                tracing::info!(
                    iterations,
                    tasks_queued = stats.storage.tasks_queued,
                    tasks_processed = stats.storage.tasks_processed,
                    tasks_failed = stats.storage.tasks_failed,
                    items_processed = stats.storage.items_processed,
                    rps = format!("{:.2}", stats.throttle.rps),
                    "crawl progress"
                );
            }
            Err(e) => tracing::debug!(error = %e, "progress snapshot failed"),
        }
    }
}

fn chain_names<'a>(base: &'a [&'a str], custom: &'a [String]) -> Vec<&'a str> {
    base.iter()
        .copied()
        .chain(custom.iter().map(String::as_str))
        .collect()
}
