//! Fixtures shared by the server's unit tests.

use opsrunbook_core::{
    generate, ActionClients, ActionPlan, ActionsExecutor, AutomationConfig, BotIdentity,
    FindingsPacket, InMemoryStore, IncidentRunner, MappingTable, RepoResolver, ReplayHarness,
    ResolutionResult, ReviewCycleController, ReviewStateStore, WebhookIngestor,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::Unconfigured;
use crate::dispatch::HttpReviewTrigger;
use crate::AppState;

pub(crate) const SECRET: &str = "test-webhook-secret";

pub(crate) fn packet_json() -> serde_json::Value {
    json!({
        "incident_id": "inc-7",
        "collector_run_id": "run-1",
        "service": "payments-api",
        "environment": "prod",
        "findings": [{
            "id": "f1",
            "summary": "Timeouts calling /aws/lambda/payments-api-charge",
            "confidence": 0.9,
            "evidence_refs": [{
                "collector_type": "logs",
                "s3_bucket": "evidence",
                "s3_key": "inc-7/logs.json",
                "sha256": "ab12",
                "byte_size": 2048
            }],
            "notes": "File \"/var/task/payments/charge.py\", line 17, in handler"
        }],
        "suspected_owners": [{"repo": "payments-service", "confidence": 0.7, "reasons": ["service name"]}],
        "all_evidence_refs": [{
            "collector_type": "logs",
            "s3_bucket": "evidence",
            "s3_key": "inc-7/logs.json",
            "sha256": "ab12",
            "byte_size": 2048
        }]
    })
}

pub(crate) fn sample_packet() -> FindingsPacket {
    serde_json::from_value(packet_json()).unwrap()
}

pub(crate) fn sample_plan(pull_request_enabled: bool) -> ActionPlan {
    let config = AutomationConfig {
        pull_request_enabled,
        ..AutomationConfig::default()
    };
    generate(
        &sample_packet(),
        &ResolutionResult::unresolved(vec![], vec![]),
        &config,
    ).unwrap()
}

pub(crate) fn sign(body: &[u8]) -> String {
    opsrunbook_core::webhook::sign_payload(SECRET.as_bytes(), body).unwrap()
}

/// The full router over in-memory stores, with the default automation
/// config (dry run, PRs off) and unconfigured clients.
pub(crate) fn test_app() -> (axum::Router, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    (test_app_with_review_states(store.clone(), store.clone()), store)
}

/// Like [`test_app`], with review state kept in `review_states` instead of
/// `store`.
pub(crate) fn test_app_with_review_states(
    store: Arc<InMemoryStore>,
    review_states: Arc<dyn ReviewStateStore>,
) -> axum::Router {
    let automation = AutomationConfig::default();
    let resolver = RepoResolver::new(Arc::new(MappingTable::default())).with_default_owner("acme");
    let clients = ActionClients {
        ticket: Arc::new(Unconfigured::new("Jira")),
        chat: Arc::new(Unconfigured::new("Teams")),
        pull_request: Arc::new(Unconfigured::new("GitHub")),
    };

    let state = AppState {
        ingestor: WebhookIngestor::new(
            SECRET,
            store.clone(),
            BotIdentity::parse(&automation.bot_login_pattern),
        ),
        review_cycle: ReviewCycleController::new(
            review_states,
            Arc::new(HttpReviewTrigger::new(None, Duration::from_secs(1))),
        ),
        runner: IncidentRunner::new(
            resolver.clone(),
            ActionsExecutor::new(store.clone(), clients),
            store.clone(),
            store.clone(),
        ),
        replay: ReplayHarness::new(resolver, store.clone(), store.clone()),
        plans: store.clone(),
        ledger: store,
        automation,
    };
    crate::app(Arc::new(state))
}
