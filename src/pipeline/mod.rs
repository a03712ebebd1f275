//! Transform pipelines
//!
//! Three forward-only transform chains share the middleware module's
//! ordering rules: the startup pipeline runs once over the spider
//! before the loop starts, and the tasks/items pipelines run once per
//! cycle over whatever extraction produced (and only when the output
//! is non-empty). `initialise` runs forward, `process` forward,
//! `finalise` in reverse.
//!
//! Stage membership is base list plus configured custom list, resolved
//! through the registry at controller construction and instantiated
//! lazily on first use. Default `process` is the identity transform.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::engine::Context;
use crate::error::{BoxError, Error, Result};
use crate::models::{Item, Task};
use crate::signals::SignalKind;
use crate::spider::Spider;

/// Base pipeline stage lists. All empty; custom stages append here.
pub const BASE_STARTUP_PIPELINE: &[&str] = &[];
pub const BASE_ITEMS_PIPELINE: &[&str] = &[];
pub const BASE_TASKS_PIPELINE: &[&str] = &[];

// ============================================================================
// Traits
// ============================================================================

/// Stage of the startup pipeline, mutating or validating the spider
/// once before the run loop starts.
#[async_trait]
pub trait StartupPipeline: Send + Sync {
    async fn initialise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    async fn process(
        &self,
        _ctx: &Context,
        spider: Arc<dyn Spider>,
    ) -> std::result::Result<Arc<dyn Spider>, BoxError> {
        Ok(spider)
    }

    async fn finalise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Stage of the items pipeline, run per cycle over extracted items.
#[async_trait]
pub trait ItemsPipeline: Send + Sync {
    async fn initialise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    async fn process(
        &self,
        _ctx: &Context,
        items: Vec<Box<dyn Item>>,
    ) -> std::result::Result<Vec<Box<dyn Item>>, BoxError> {
        Ok(items)
    }

    async fn finalise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

/// Stage of the tasks pipeline, run per cycle over discovered tasks.
#[async_trait]
pub trait TasksPipeline: Send + Sync {
    async fn initialise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    async fn process(
        &self,
        _ctx: &Context,
        tasks: HashSet<Task>,
    ) -> std::result::Result<HashSet<Task>, BoxError> {
        Ok(tasks)
    }

    async fn finalise(&self, _ctx: &Context) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

pub type StartupPipelineFactory = Arc<dyn Fn() -> Box<dyn StartupPipeline> + Send + Sync>;
pub type ItemsPipelineFactory = Arc<dyn Fn() -> Box<dyn ItemsPipeline> + Send + Sync>;
pub type TasksPipelineFactory = Arc<dyn Fn() -> Box<dyn TasksPipeline> + Send + Sync>;

// ============================================================================
// Chains
// ============================================================================

macro_rules! pipeline_chain {
    ($chain:ident, $stage:ident, $factory:ident, $payload:ty, $error:ident,
     $started:ident, $finished:ident, $doc:literal) => {
        #[doc = $doc]
        pub struct $chain {
            factories: Vec<$factory>,
            cached: OnceLock<Vec<Box<dyn $stage>>>,
        }

        impl $chain {
            pub fn new(factories: Vec<$factory>) -> Self {
                Self {
                    factories,
                    cached: OnceLock::new(),
                }
            }

            fn stages(&self) -> &[Box<dyn $stage>] {
                self.cached
                    .get_or_init(|| self.factories.iter().map(|f| f()).collect())
            }

            pub async fn initialise(&self, ctx: &Context) -> Result<()> {
                for stage in self.stages() {
                    stage.initialise(ctx).await.map_err(Error::$error)?;
                }
                Ok(())
            }

            /// Run the payload through all stages in forward order.
            pub async fn process(&self, ctx: &Context, mut payload: $payload) -> Result<$payload> {
                let stages = self.stages();
                if !stages.is_empty() {
                    ctx.signals.emit(SignalKind::$started, None);
                    for stage in stages {
                        payload = stage.process(ctx, payload).await.map_err(Error::$error)?;
                    }
                    ctx.signals.emit(SignalKind::$finished, None);
                }
                Ok(payload)
            }

            pub async fn finalise(&self, ctx: &Context) -> Result<()> {
                for stage in self.stages().iter().rev() {
                    stage.finalise(ctx).await.map_err(Error::$error)?;
                }
                Ok(())
            }
        }
    };
}

pipeline_chain!(
    StartupPipelineChain,
    StartupPipeline,
    StartupPipelineFactory,
    Arc<dyn Spider>,
    StartupPipeline,
    StartupPipelineStarted,
    StartupPipelineFinished,
    "Startup pipeline chain, run once over the spider at initialise."
);

pipeline_chain!(
    ItemsPipelineChain,
    ItemsPipeline,
    ItemsPipelineFactory,
    Vec<Box<dyn Item>>,
    ItemsPipeline,
    ItemsPipelineStarted,
    ItemsPipelineFinished,
    "Items pipeline chain, run per cycle over extracted items."
);

pipeline_chain!(
    TasksPipelineChain,
    TasksPipeline,
    TasksPipelineFactory,
    HashSet<Task>,
    TasksPipeline,
    TasksPipelineStarted,
    TasksPipelineFinished,
    "Tasks pipeline chain, run per cycle over discovered tasks."
);
