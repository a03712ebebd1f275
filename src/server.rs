//! HTTP facade for single-cycle processing
//!
//! Exposes `/process/?name=<spider>&url=<url>`: one controller is
//! lazily created per spider name, reused across requests, and each
//! request runs exactly one synchronous task cycle, returning the
//! extracted items as JSON.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::engine::Controller;
use crate::models::Task;
use crate::registry::Registry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    registry: Arc<Registry>,
    controllers: Arc<Mutex<HashMap<String, Arc<Controller>>>>,
}

/// HTTP facade server.
pub struct Server {
    address: String,
    state: AppState,
}

impl Server {
    pub fn new(address: &str, config: Arc<Config>, registry: Arc<Registry>) -> Self {
        Self {
            address: address.to_string(),
            state: AppState {
                config,
                registry,
                controllers: Arc::new(Mutex::new(HashMap::new())),
            },
        }
    }

    /// Bind and serve until the process is interrupted. Cached
    /// controllers are finalised on the way out.
    pub async fn start(self) -> Result<()> {
        let app = Router::new()
            .route("/", get(index))
            .route("/process/", get(process))
            .with_state(self.state.clone());

        let listener = tokio::net::TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("failed to bind {}", self.address))?;
        tracing::info!(address = %self.address, "kumo server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("server error")?;

        for (name, controller) in self.state.controllers.lock().await.drain() {
            if let Err(e) = controller.finalise().await {
                tracing::warn!(spider = %name, error = %e, "controller teardown failed");
            }
        }
        tracing::info!("kumo server finished");
        Ok(())
    }
}

async fn index() -> String {
    format!("kumo server - {}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize)]
struct ProcessParams {
    name: String,
    url: String,
}

async fn process(
    State(state): State<AppState>,
    Query(params): Query<ProcessParams>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let controller = controller_for(&state, &params.name)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    let result = controller
        .process(Task::new(&params.url))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let items: Vec<Value> = result
        .items
        .iter()
        .map(|item| Value::Object(item.to_map()))
        .collect();
    Ok(Json(Value::Array(items)))
}

/// Fetch or lazily create the controller for a spider name.
async fn controller_for(state: &AppState, name: &str) -> crate::error::Result<Arc<Controller>> {
    let mut controllers = state.controllers.lock().await;
    if let Some(controller) = controllers.get(name) {
        return Ok(Arc::clone(controller));
    }

    let spider = state.registry.spider(name)?;
    let controller = Arc::new(Controller::new(
        spider,
        Arc::clone(&state.config),
        &state.registry,
    )?);
    controller.manager().storage().initialise().await?;
    controllers.insert(name.to_string(), Arc::clone(&controller));
    tracing::debug!(spider = %name, "controller created");
    Ok(controller)
}
