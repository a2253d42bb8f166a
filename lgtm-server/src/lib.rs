pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod gitlab;
pub mod payload;
pub mod processor;
pub mod reviewers;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use dispatcher::WorkerPool;
pub use processor::ApprovalProcessor;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_version() -> String {
    let git_hash = option_env!("LGTM_GIT_HASH").or(built_info::GIT_COMMIT_HASH);
    match git_hash {
        Some(hash) => format!("{} ({})", built_info::PKG_VERSION, &hash[..hash.len().min(8)]),
        None => built_info::PKG_VERSION.to_string(),
    }
}

/// Route of the health check.
pub const HEALTH_PATH: &str = "/health";

pub struct AppState {
    pub processor: Arc<ApprovalProcessor>,
    pub dispatcher: WorkerPool,
}

async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "lgtm-gate",
        "version": get_version(),
        "approval_threshold": state.processor.threshold.get(),
        "queued_deliveries": state.dispatcher.queued(),
    })))
}

/// The full HTTP surface: health check plus the webhook at `hook_path`.
pub fn app_router(state: Arc<AppState>, hook_path: &str) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_check))
        .merge(webhook::webhook_router(hook_path))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
