//! Signed webhook ingestion for PR review events.
//!
//! Gate order matters: the signature is checked before anything is written,
//! and the delivery id is claimed before the body is parsed, so a redelivered
//! event never gets interpreted twice.

use crate::command::{parse_command, ReviewCommand};
use crate::config::DEFAULT_BOT_LOGIN_PATTERN;
use crate::pattern::Glob;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Outcome recorded when an accepted event could not be acted on. A delivery
/// carrying it can be claimed again by a redelivery.
pub const FAILED_OUTCOME: &str = "failed";

pub const SUPPORTED_EVENTS: [&str; 4] = [
    "issue_comment",
    "pull_request_review",
    "pull_request_review_comment",
    "pull_request",
];

const MAX_COMMENT_CHARS: usize = 4000;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time check of a `sha256=<hex>` HMAC signature over `payload`.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    mac.verify_slice(&signature_bytes).is_ok()
}

/// The `sha256=<hex>` header value a sender would attach to `payload`.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(payload);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Logins that belong to the automation itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    patterns: Vec<Glob>,
}

impl BotIdentity {
    /// Comma-separated, case-insensitive globs, e.g. `my-app,*[bot]`.
    pub fn parse(spec: &str) -> Self {
        Self {
            patterns: spec
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(Glob::new)
                .collect(),
        }
    }

    pub fn matches(&self, login: &str) -> bool {
        let login = login.trim();
        !login.is_empty() && self.patterns.iter().any(|p| p.matches_ignore_case(login))
    }
}

impl Default for BotIdentity {
    fn default() -> Self {
        Self::parse(DEFAULT_BOT_LOGIN_PATTERN)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClaim {
    Claimed,
    AlreadyRecorded,
}

/// Audit record of one physical webhook delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub event_type: String,
    pub signature: String,
    pub payload: String,
    pub received_at: DateTime<Utc>,
    pub outcome: Option<String>,
    pub sender_login: Option<String>,
    pub command: Option<ReviewCommand>,
}

/// Delivery deduplication store.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert the record unless its delivery id is already present, as one
    /// atomic conditional operation. A present record whose outcome is
    /// [`FAILED_OUTCOME`] is replaced and claimed again.
    async fn try_claim(&self, record: &DeliveryRecord) -> Result<DeliveryClaim, StoreError>;

    async fn record_outcome(
        &self,
        delivery_id: &str,
        outcome: &str,
        sender_login: Option<&str>,
        command: Option<ReviewCommand>,
    ) -> Result<(), StoreError>;

    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<DeliveryRecord>, StoreError>;
}

// Payload shapes, only the parts we read. Everything is optional so that
// unfamiliar event shapes still parse.

#[derive(Debug, Default, Deserialize)]
struct WebhookPayload {
    action: Option<String>,
    repository: Option<Repository>,
    sender: Option<User>,
    installation: Option<Installation>,
    issue: Option<Issue>,
    pull_request: Option<PullRequest>,
    comment: Option<Comment>,
    review: Option<Review>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Comment {
    body: Option<String>,
    html_url: Option<String>,
    user: Option<User>,
}

#[derive(Debug, Deserialize)]
struct Review {
    body: Option<String>,
    html_url: Option<String>,
    state: Option<String>,
}

/// A normalised PR review event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEvent {
    pub delivery_id: String,
    pub event_type: String,
    pub action: String,
    pub repo_full_name: String,
    pub pr_number: u64,
    pub installation_id: Option<u64>,
    pub sender_login: String,
    pub comment_body: String,
    pub comment_url: Option<String>,
    pub pr_url: Option<String>,
    pub review_state: Option<String>,
    pub command: Option<ReviewCommand>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InvalidSignature,
    MalformedPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SelfEvent,
    UnsupportedEvent,
    NotAPullRequest,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SelfEvent => "self_event",
            SkipReason::UnsupportedEvent => "unsupported_event",
            SkipReason::NotAPullRequest => "not_a_pull_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted(ReviewEvent),
    AlreadyProcessed,
    Rejected(RejectReason),
    Skipped(SkipReason),
}

impl IngestOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted(_) => "accepted",
            IngestOutcome::AlreadyProcessed => "already_processed",
            IngestOutcome::Rejected(_) => "rejected",
            IngestOutcome::Skipped(_) => "skipped",
        }
    }

    /// Outcome string written back to the delivery record.
    pub fn label(&self) -> String {
        match self {
            IngestOutcome::Skipped(reason) => format!("skipped:{}", reason.as_str()),
            IngestOutcome::Rejected(RejectReason::InvalidSignature) => {
                "rejected:invalid_signature".to_string()
            }
            IngestOutcome::Rejected(RejectReason::MalformedPayload(_)) => {
                "rejected:malformed_payload".to_string()
            }
            other => other.status().to_string(),
        }
    }
}

pub struct WebhookIngestor {
    secret: Vec<u8>,
    deliveries: Arc<dyn DeliveryStore>,
    bot: BotIdentity,
}

impl WebhookIngestor {
    pub fn new(secret: impl Into<Vec<u8>>, deliveries: Arc<dyn DeliveryStore>, bot: BotIdentity) -> Self {
        Self {
            secret: secret.into(),
            deliveries,
            bot,
        }
    }

    pub async fn ingest(
        &self,
        raw_body: &[u8],
        signature: &str,
        delivery_id: &str,
        event_type: &str,
    ) -> Result<IngestOutcome, StoreError> {
        if self.secret.is_empty() || !verify_signature(&self.secret, raw_body, signature) {
            warn!(
                "Rejecting delivery {} ({}): invalid signature",
                delivery_id, event_type
            );
            return Ok(IngestOutcome::Rejected(RejectReason::InvalidSignature));
        }

        if delivery_id.trim().is_empty() {
            return Ok(IngestOutcome::Rejected(RejectReason::MalformedPayload(
                "missing delivery id".to_string(),
            )));
        }

        let received_at = Utc::now();
        let record = DeliveryRecord {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            signature: signature.to_string(),
            payload: String::from_utf8_lossy(raw_body).into_owned(),
            received_at,
            outcome: None,
            sender_login: None,
            command: None,
        };
        if self.deliveries.try_claim(&record).await? == DeliveryClaim::AlreadyRecorded {
            info!("Delivery {} already processed", delivery_id);
            return Ok(IngestOutcome::AlreadyProcessed);
        }

        let outcome = self.classify(raw_body, delivery_id, event_type, received_at);
        info!(
            "Delivery {} ({}): {}",
            delivery_id,
            event_type,
            outcome.label()
        );

        let (sender, command) = match &outcome {
            IngestOutcome::Accepted(event) => (Some(event.sender_login.as_str()), event.command),
            _ => (None, None),
        };
        if let Err(e) = self
            .deliveries
            .record_outcome(delivery_id, &outcome.label(), sender, command)
            .await
        {
            error!("Failed to record outcome for delivery {}: {}", delivery_id, e);
        }

        Ok(outcome)
    }

    /// Record that an accepted delivery was not acted on, so that the
    /// sender's retry of the same delivery id is processed instead of being
    /// answered as already processed.
    pub async fn mark_failed(&self, event: &ReviewEvent) -> Result<(), StoreError> {
        warn!(
            "Delivery {} marked failed; a redelivery will be processed again",
            event.delivery_id
        );
        self.deliveries
            .record_outcome(
                &event.delivery_id,
                FAILED_OUTCOME,
                Some(&event.sender_login),
                event.command,
            )
            .await
    }

    fn classify(
        &self,
        raw_body: &[u8],
        delivery_id: &str,
        event_type: &str,
        received_at: DateTime<Utc>,
    ) -> IngestOutcome {
        let payload: WebhookPayload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(e) => {
                return IngestOutcome::Rejected(RejectReason::MalformedPayload(e.to_string()));
            }
        };

        if !SUPPORTED_EVENTS.contains(&event_type) {
            return IngestOutcome::Skipped(SkipReason::UnsupportedEvent);
        }

        if event_type == "issue_comment"
            && payload
                .issue
                .as_ref()
                .map_or(true, |issue| issue.pull_request.is_none())
        {
            return IngestOutcome::Skipped(SkipReason::NotAPullRequest);
        }

        match normalize(payload, delivery_id, event_type, received_at) {
            Ok(event) if self.bot.matches(&event.sender_login) => {
                IngestOutcome::Skipped(SkipReason::SelfEvent)
            }
            Ok(event) => IngestOutcome::Accepted(event),
            Err(reason) => IngestOutcome::Rejected(RejectReason::MalformedPayload(reason)),
        }
    }
}

fn normalize(
    payload: WebhookPayload,
    delivery_id: &str,
    event_type: &str,
    received_at: DateTime<Utc>,
) -> Result<ReviewEvent, String> {
    let repo_full_name = payload
        .repository
        .map(|r| r.full_name)
        .ok_or_else(|| "missing repository".to_string())?;

    let (pr_number, pr_url) = match (event_type, &payload.issue, &payload.pull_request) {
        ("issue_comment", Some(issue), _) => (
            issue.number,
            issue
                .pull_request
                .as_ref()
                .and_then(|link| link.get("html_url"))
                .and_then(|url| url.as_str())
                .map(str::to_string),
        ),
        (_, _, Some(pr)) => (pr.number, pr.html_url.clone()),
        _ => return Err("missing pull request number".to_string()),
    };

    let (comment_body, comment_url, review_state) = match event_type {
        "issue_comment" | "pull_request_review_comment" => match &payload.comment {
            Some(c) => (c.body.clone().unwrap_or_default(), c.html_url.clone(), None),
            None => (String::new(), None, None),
        },
        "pull_request_review" => match &payload.review {
            Some(r) => (
                r.body.clone().unwrap_or_default(),
                r.html_url.clone(),
                r.state.clone(),
            ),
            None => (String::new(), None, None),
        },
        _ => (String::new(), None, None),
    };
    let comment_body: String = comment_body.chars().take(MAX_COMMENT_CHARS).collect();

    let sender_login = payload
        .sender
        .map(|s| s.login)
        .or_else(|| payload.comment.and_then(|c| c.user).map(|u| u.login))
        .unwrap_or_default();

    Ok(ReviewEvent {
        delivery_id: delivery_id.to_string(),
        event_type: event_type.to_string(),
        action: payload.action.unwrap_or_default(),
        repo_full_name,
        pr_number,
        installation_id: payload.installation.map(|i| i.id),
        sender_login,
        command: parse_command(&comment_body),
        comment_body,
        comment_url,
        pr_url,
        review_state,
        received_at,
    })
}
