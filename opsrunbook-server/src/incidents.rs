use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use opsrunbook_core::{AutomationConfig, FindingsPacket, ReplayError, RunError, StoreError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use crate::AppState;

fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> Response {
    error!("{}: {}", context, e);
    error_reply(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Per-request overrides applied on top of the server's automation config
/// for a replay.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayOverrides {
    pub pull_request_enabled: Option<bool>,
    pub confidence_threshold: Option<f64>,
}

impl ReplayOverrides {
    fn apply(&self, base: &AutomationConfig) -> AutomationConfig {
        let mut config = base.clone();
        if let Some(enabled) = self.pull_request_enabled {
            config.pull_request_enabled = enabled;
        }
        if let Some(threshold) = self.confidence_threshold {
            config.confidence_threshold = threshold;
        }
        config
    }
}

async fn run_actions(
    State(state): State<Arc<AppState>>,
    Path((incident_id, run_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let packet: FindingsPacket = match serde_json::from_slice(&body) {
        Ok(packet) => packet,
        Err(e) => {
            return error_reply(
                StatusCode::BAD_REQUEST,
                format!("malformed findings packet: {}", e),
            )
        }
    };
    if packet.incident_id != incident_id || packet.run_id != run_id {
        return error_reply(
            StatusCode::BAD_REQUEST,
            format!(
                "packet is for incident {} run {}, not {} {}",
                packet.incident_id, packet.run_id, incident_id, run_id
            ),
        );
    }

    match state.runner.run(&packet, &state.automation).await {
        Ok(report) => Json(report).into_response(),
        Err(RunError::InvalidPacket(e)) => error_reply(StatusCode::BAD_REQUEST, e.to_string()),
        Err(RunError::Store(StoreError::Conflict(detail))) => {
            warn!(
                "Incident {} run {}: conflicting packet ({})",
                incident_id, run_id, detail
            );
            error_reply(StatusCode::CONFLICT, detail)
        }
        Err(e) => internal_error(
            &format!("Incident {} run {}: run failed", incident_id, run_id),
            e,
        ),
    }
}

async fn get_actions(
    State(state): State<Arc<AppState>>,
    Path((incident_id, run_id)): Path<(String, String)>,
) -> Response {
    let plan = match state.plans.get_plan(&incident_id, &run_id).await {
        Ok(Some(plan)) => plan,
        Ok(None) => {
            return error_reply(
                StatusCode::NOT_FOUND,
                format!("no plan for incident {} run {}", incident_id, run_id),
            )
        }
        Err(e) => return internal_error("Failed to load plan", e),
    };

    match state.ledger.results_for_run(&incident_id, &run_id).await {
        Ok(results) => Json(json!({"plan": plan, "results": results})).into_response(),
        Err(e) => internal_error("Failed to load results", e),
    }
}

async fn replay_run(
    State(state): State<Arc<AppState>>,
    Path((incident_id, run_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let overrides = if body.iter().all(u8::is_ascii_whitespace) {
        ReplayOverrides::default()
    } else {
        match serde_json::from_slice::<ReplayOverrides>(&body) {
            Ok(overrides) => overrides,
            Err(e) => {
                return error_reply(
                    StatusCode::BAD_REQUEST,
                    format!("malformed replay overrides: {}", e),
                )
            }
        }
    };
    if let Some(threshold) = overrides.confidence_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return error_reply(
                StatusCode::BAD_REQUEST,
                "confidence_threshold must be between 0 and 1",
            );
        }
    }
    let config = overrides.apply(&state.automation);

    match state.replay.replay(&incident_id, &run_id, &config).await {
        Ok(report) => Json(report).into_response(),
        Err(e @ (ReplayError::PacketNotFound { .. } | ReplayError::PlanNotFound { .. })) => {
            error_reply(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => internal_error("Replay failed", e),
    }
}

pub fn incidents_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/incidents/:incident_id/runs/:run_id/actions",
            post(run_actions).get(get_actions),
        )
        .route("/incidents/:incident_id/runs/:run_id/replay", post(replay_run))
}
