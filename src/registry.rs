//! Typed component registries
//!
//! Chain membership and spider discovery are configured as data
//! (string identifiers) and resolved here to constructors, once, at
//! controller construction. This replaces runtime class-path loading
//! with a closed, typed mapping: unknown identifiers fail fast with
//! [`Error::NoSuchComponent`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::demo::DemoSpider;
use crate::error::{Error, Result};
use crate::middleware::{
    Headers, HttpMiddleware, HttpMiddlewareFactory, Session, SpiderMiddleware,
    SpiderMiddlewareFactory,
};
use crate::pipeline::{
    ItemsPipeline, ItemsPipelineFactory, StartupPipeline, StartupPipelineFactory, TasksPipeline,
    TasksPipelineFactory,
};
use crate::spider::Spider;

pub type SpiderFactory = Arc<dyn Fn() -> Arc<dyn Spider> + Send + Sync>;

/// Name-to-factory mappings for every pluggable component kind.
#[derive(Default)]
pub struct Registry {
    spiders: HashMap<String, SpiderFactory>,
    http_middleware: HashMap<String, HttpMiddlewareFactory>,
    spider_middleware: HashMap<String, SpiderMiddlewareFactory>,
    startup_pipelines: HashMap<String, StartupPipelineFactory>,
    items_pipelines: HashMap<String, ItemsPipelineFactory>,
    tasks_pipelines: HashMap<String, TasksPipelineFactory>,
}

impl Registry {
    /// Empty registry with no components.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the framework components: the base
    /// http middleware and the packaged demo spider.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_http_middleware("session", || Box::new(Session));
        registry.register_http_middleware("headers", || Box::new(Headers));
        registry.register_spider("demo", || Arc::new(DemoSpider::new()));
        registry
    }

    pub fn register_spider<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn Spider> + Send + Sync + 'static,
    {
        self.spiders.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_http_middleware<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn HttpMiddleware> + Send + Sync + 'static,
    {
        self.http_middleware
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_spider_middleware<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn SpiderMiddleware> + Send + Sync + 'static,
    {
        self.spider_middleware
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_startup_pipeline<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn StartupPipeline> + Send + Sync + 'static,
    {
        self.startup_pipelines
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_items_pipeline<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn ItemsPipeline> + Send + Sync + 'static,
    {
        self.items_pipelines
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_tasks_pipeline<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn TasksPipeline> + Send + Sync + 'static,
    {
        self.tasks_pipelines
            .insert(name.to_string(), Arc::new(factory));
    }

    /// Construct the named spider.
    pub fn spider(&self, name: &str) -> Result<Arc<dyn Spider>> {
        self.spiders
            .get(name)
            .map(|f| f())
            .ok_or_else(|| Error::NoSuchComponent(format!("spider: {name}")))
    }

    /// Names of all registered spiders, sorted.
    pub fn spider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.spiders.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn http_middleware(&self, names: &[&str]) -> Result<Vec<HttpMiddlewareFactory>> {
        resolve(&self.http_middleware, names, "http middleware")
    }

    pub fn spider_middleware(&self, names: &[&str]) -> Result<Vec<SpiderMiddlewareFactory>> {
        resolve(&self.spider_middleware, names, "spider middleware")
    }

    pub fn startup_pipelines(&self, names: &[&str]) -> Result<Vec<StartupPipelineFactory>> {
        resolve(&self.startup_pipelines, names, "startup pipeline")
    }

    pub fn items_pipelines(&self, names: &[&str]) -> Result<Vec<ItemsPipelineFactory>> {
        resolve(&self.items_pipelines, names, "items pipeline")
    }

    pub fn tasks_pipelines(&self, names: &[&str]) -> Result<Vec<TasksPipelineFactory>> {
        resolve(&self.tasks_pipelines, names, "tasks pipeline")
    }
}

fn resolve<T: Clone>(map: &HashMap<String, T>, names: &[&str], kind: &str) -> Result<Vec<T>> {
    names
        .iter()
        .map(|name| {
            map.get(*name)
                .cloned()
                .ok_or_else(|| Error::NoSuchComponent(format!("{kind}: {name}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_base_middleware() {
        let registry = Registry::with_defaults();
        let factories = registry.http_middleware(&["session", "headers"]).unwrap();
        assert_eq!(factories.len(), 2);
    }

    #[test]
    fn test_defaults_include_demo_spider() {
        let registry = Registry::with_defaults();
        let spider = registry.spider("demo").unwrap();
        assert_eq!(spider.name(), "demo");
        assert_eq!(registry.spider_names(), vec!["demo".to_string()]);
    }

    #[test]
    fn test_unknown_component_fails_fast() {
        let registry = Registry::with_defaults();
        let err = registry.spider("nope").unwrap_err();
        assert!(matches!(err, Error::NoSuchComponent(_)));
        assert!(registry.http_middleware(&["session", "nope"]).is_err());
    }

    #[test]
    fn test_registration_order_preserved_in_resolution() {
        let registry = Registry::with_defaults();
        // Resolution order follows the requested name order, not the
        // registration order.
        let factories = registry.http_middleware(&["headers", "session"]).unwrap();
        assert_eq!(factories.len(), 2);
    }
}
