//! End-to-end crawl tests against a wiremock site
//!
//! These exercise the full controller lifecycle: seeding, the
//! scheduling loop, middleware, extraction, pipelines, dedup and the
//! failure paths.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use kumo::config::Config;
use kumo::demo::DemoSpider;
use kumo::engine::Controller;
use kumo::error::{BoxError, Error, TerminationError};
use kumo::models::{Item, Response, Status, Task};
use kumo::registry::Registry;
use kumo::spider::{Spider, SpiderUrls};

fn test_config() -> Arc<Config> {
    let mut config = Config::default();
    config.crawler.max_concurrent_requests = 2;
    config.crawler.pause_timeout_secs = 0;
    config.crawler.report_frequency = 0;
    Arc::new(config)
}

fn controller_for(spider: Arc<dyn Spider>, config: Arc<Config>) -> Arc<Controller> {
    let registry = Registry::with_defaults();
    Arc::new(Controller::new(spider, config, &registry).unwrap())
}

fn page(nav_home: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html><html><body>
        <nav><ul>
            <li><a href="{nav_home}">home</a></li>
            <li><a href="/men-jeans/">men-jeans</a></li>
            <li><a href="/sale/99/">sale</a></li>
        </ul></nav>
        {body}
        </body></html>"#
    )
}

fn product_block() -> &'static str {
    r#"<div class="product" product-id="11001" product-slug="men-jeans-name-11001">
        <h2>name 11001</h2>
        <p>some desc 11001</p>
        <span>men-jeans</span>
        <em>34.99</em>
        <div class="images"><img src="/images/name-4/4.png"/></div>
        <a href="/men-jeans/11001/">name 11001</a>
    </div>"#
}

/// Full crawl: three pages, one avoided section, every page fetched
/// exactly once, items counted.
#[tokio::test]
async fn test_crawl_to_queue_empty_termination() {
    let server = MockServer::start().await;

    let index = page(
        "/",
        r#"<div id="product-list"><a href="/men-jeans/11001/">name 11001</a></div>"#,
    );
    let listing = page("/", product_block());
    let detail = page("/", product_block());

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/men-jeans/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/men-jeans/11001/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(detail))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sale/99/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let spider = Arc::new(DemoSpider::with_start_urls(vec![format!(
        "{}/",
        server.uri()
    )]));
    let controller = controller_for(spider, test_config());

    controller.initialise().await.unwrap();
    controller.run().await.unwrap();

    let snapshot = controller.manager().storage().snapshot().await.unwrap();
    assert_eq!(snapshot.tasks_processed, 3);
    assert_eq!(snapshot.tasks_failed, 0);
    assert_eq!(snapshot.tasks_queued, 0);
    // one product on the listing page, one on the detail page
    assert_eq!(snapshot.items_processed, 2);

    controller.finalise().await.unwrap();
    assert!(!controller.manager().running().await);
}

/// Spider that records whether extraction ever ran.
struct ProbeSpider {
    urls: SpiderUrls,
    extractions: Arc<AtomicUsize>,
}

#[async_trait]
impl Spider for ProbeSpider {
    fn name(&self) -> &str {
        "probe"
    }

    fn urls(&self) -> &SpiderUrls {
        &self.urls
    }

    async fn tasks(&self, _task: &Task, _response: &Response) -> Result<HashSet<Task>, BoxError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        Ok(HashSet::new())
    }

    async fn items(
        &self,
        _task: &Task,
        _response: &Response,
    ) -> Result<Vec<Box<dyn Item>>, BoxError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }
}

/// An HTTP status from the configured failure set short-circuits the
/// cycle: extraction never runs, the result carries the status with
/// empty tasks/items, and the task lands in the failed set.
#[tokio::test]
async fn test_http_failure_short_circuits_extraction() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let extractions = Arc::new(AtomicUsize::new(0));
    let spider = Arc::new(ProbeSpider {
        urls: SpiderUrls::default(),
        extractions: Arc::clone(&extractions),
    });
    let controller = controller_for(spider, test_config());
    controller.manager().storage().initialise().await.unwrap();

    let url = format!("{}/missing/", server.uri());
    let result = controller.process(Task::new(&url)).await.unwrap();

    assert_eq!(result.status, Status::Http(404));
    assert!(result.tasks.is_empty());
    assert!(result.items.is_empty());
    assert_eq!(extractions.load(Ordering::SeqCst), 0);

    let failed = controller.manager().storage().get_tasks_failed().await.unwrap();
    assert!(failed.contains(&Task::new(&url)));
}

/// A connection-class error maps to a retrial and resets the session.
#[tokio::test]
async fn test_connection_error_becomes_retrial() {
    let spider = Arc::new(ProbeSpider {
        urls: SpiderUrls::default(),
        extractions: Arc::new(AtomicUsize::new(0)),
    });
    let controller = controller_for(spider, test_config());
    controller.manager().storage().initialise().await.unwrap();

    // nothing listens on this port
    let result = controller
        .process(Task::new("http://127.0.0.1:1/unreachable/"))
        .await
        .unwrap();

    assert_eq!(result.status, Status::Retrial);
    // the retrial is scheduled ahead of queued work
    let batch = controller.manager().scheduled().await.unwrap();
    assert_eq!(batch[0].url, "http://127.0.0.1:1/unreachable/");
}

/// Exhausting the failed-task budget terminates the whole run, and the
/// teardown still completes cleanly.
#[tokio::test]
async fn test_failed_budget_ends_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.crawler.max_failed = 1;
    config.crawler.pause_timeout_secs = 0;
    config.crawler.report_frequency = 0;

    let spider = Arc::new(DemoSpider::with_start_urls(vec![format!(
        "{}/",
        server.uri()
    )]));
    let controller = controller_for(spider, Arc::new(config));

    controller.initialise().await.unwrap();
    let err = controller.run().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Termination(TerminationError::MaxFailedReached)
    ));

    controller.finalise().await.unwrap();
    assert!(!controller.manager().running().await);
}

/// Extraction errors fail the task without ending the run.
#[tokio::test]
async fn test_spider_error_fails_single_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    struct BrokenSpider {
        urls: SpiderUrls,
    }

    #[async_trait]
    impl Spider for BrokenSpider {
        fn name(&self) -> &str {
            "broken"
        }

        fn urls(&self) -> &SpiderUrls {
            &self.urls
        }

        async fn items(
            &self,
            _task: &Task,
            _response: &Response,
        ) -> Result<Vec<Box<dyn Item>>, BoxError> {
            Err("extraction exploded".into())
        }
    }

    let spider = Arc::new(BrokenSpider {
        urls: SpiderUrls::default(),
    });
    let controller = controller_for(spider, test_config());
    controller.manager().storage().initialise().await.unwrap();

    let url = format!("{}/page/", server.uri());
    let result = controller.process(Task::new(&url)).await.unwrap();

    assert_eq!(result.status, Status::Failed);
    assert!(!controller.manager().is_terminated());
}
