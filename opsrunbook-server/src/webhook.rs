use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use opsrunbook_core::webhook::RejectReason;
use opsrunbook_core::IngestOutcome;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (Some(delivery_id), Some(event_type)) = (
        header(&headers, "x-github-delivery"),
        header(&headers, "x-github-event"),
    ) else {
        warn!("Webhook without delivery id or event type");
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"status": "rejected", "reason": "missing_headers"}),
        );
    };
    // A missing signature fails verification like a wrong one.
    let signature = header(&headers, "x-hub-signature-256").unwrap_or("");

    let outcome = match state
        .ingestor
        .ingest(&body, signature, delivery_id, event_type)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Failed to record delivery {}: {}", delivery_id, e);
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"status": "error"}),
            );
        }
    };

    match outcome {
        IngestOutcome::Rejected(RejectReason::InvalidSignature) => reply(
            StatusCode::UNAUTHORIZED,
            json!({"status": "rejected", "reason": "invalid_signature"}),
        ),
        IngestOutcome::Rejected(RejectReason::MalformedPayload(detail)) => {
            warn!("Delivery {} has a malformed payload: {}", delivery_id, detail);
            reply(
                StatusCode::BAD_REQUEST,
                json!({"status": "rejected", "reason": "malformed_payload"}),
            )
        }
        IngestOutcome::AlreadyProcessed => {
            info!("Delivery {} already processed", delivery_id);
            reply(StatusCode::ACCEPTED, json!({"status": "already_processed"}))
        }
        IngestOutcome::Skipped(reason) => reply(
            StatusCode::ACCEPTED,
            json!({"status": "skipped", "reason": reason.as_str()}),
        ),
        IngestOutcome::Accepted(event) => match state.review_cycle.handle(&event).await {
            Ok(transition) => {
                let mut response = json!({
                    "status": "accepted",
                    "delivery_id": event.delivery_id,
                    "command": event.command,
                    "review_state": transition.state.status.as_str(),
                });
                // Decision fields (`decision`, `changed`) sit beside the status.
                if let (Some(target), Ok(Value::Object(decision))) = (
                    response.as_object_mut(),
                    serde_json::to_value(transition.decision),
                ) {
                    target.extend(decision);
                }
                reply(StatusCode::ACCEPTED, response)
            }
            Err(e) => {
                error!(
                    "Failed to update review state for {}#{}: {}",
                    event.repo_full_name, event.pr_number, e
                );
                // Leave the delivery reclaimable so the sender's retry applies it.
                if let Err(e) = state.ingestor.mark_failed(&event).await {
                    error!("Failed to mark delivery {} failed: {}", event.delivery_id, e);
                }
                reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"status": "error"}),
                )
            }
        },
    }
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(github_webhook_handler))
}
