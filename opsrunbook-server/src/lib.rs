pub mod clients;
pub mod config;
pub mod dispatch;
pub mod incidents;
pub mod repository;
pub mod webhook;

#[cfg(test)]
mod test_support;

use axum::{extract::State, response::Json, routing::get, Router};
use opsrunbook_core::{
    AutomationConfig, IdempotencyLedger, IncidentRunner, PlanStore, ReplayHarness,
    ReviewCycleController, WebhookIngestor,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(8).collect()
}

pub fn get_service_version() -> String {
    // Deployment-stamped hash first, then whatever `built` found in the checkout
    if let Some(git_hash) = option_env!("OPSRUNBOOK_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        format!("{} (unknown commit)", built_info::PKG_VERSION)
    }
}

pub struct AppState {
    /// Server-wide automation switches; every run is planned and executed
    /// under this value.
    pub automation: AutomationConfig,
    pub ingestor: WebhookIngestor,
    pub review_cycle: ReviewCycleController,
    pub runner: IncidentRunner,
    pub replay: ReplayHarness,
    pub plans: Arc<dyn PlanStore>,
    pub ledger: Arc<dyn IdempotencyLedger>,
}

async fn health_check(State(_): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "opsrunbook",
        "version": get_service_version(),
    }))
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(webhook::webhook_router())
        .merge(incidents::incidents_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
