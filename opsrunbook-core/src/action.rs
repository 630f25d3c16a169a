//! The action model: what a plan asks for, and what executing it produced.

use crate::packet::EvidenceRef;
use crate::resolver::ResolutionResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Bumping this changes every action id, so old ledger entries no longer
/// short-circuit new plans.
pub const PLAN_VERSION: &str = "v1";

const ACTION_ID_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateTicket,
    NotifyChat,
    CreatePullRequest,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::CreateTicket => "create_ticket",
            ActionType::NotifyChat => "notify_chat",
            ActionType::CreatePullRequest => "create_pull_request",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier for an action within an incident
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub String);

impl ActionId {
    /// Hex SHA-256 prefix over `incident_id|action_type|plan_version`.
    pub fn derive(incident_id: &str, action_type: ActionType, plan_version: &str) -> Self {
        let digest = Sha256::digest(format!("{}|{}|{}", incident_id, action_type, plan_version));
        let mut hex = hex::encode(digest);
        hex.truncate(ACTION_ID_LEN);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketAction {
    pub action_id: ActionId,
    pub incident_id: String,
    pub title: String,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub body: String,
    pub evidence_refs: Vec<EvidenceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatAction {
    pub action_id: ActionId,
    pub incident_id: String,
    pub title: String,
    pub body: String,
    pub evidence_refs: Vec<EvidenceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestAction {
    pub action_id: ActionId,
    pub incident_id: String,
    pub run_id: String,
    /// Target repository; absent when resolution failed.
    pub repo: Option<String>,
    pub branch: String,
    pub title: String,
    pub body: String,
    pub notes_path: String,
    pub notes_content: String,
    pub commit_message: String,
    pub evidence_refs: Vec<EvidenceRef>,
    pub resolution: ResolutionResult,
    pub confidence_threshold: f64,
}

/// Outcome of the pull-request confidence gate
#[derive(Debug, Clone, PartialEq)]
pub enum Gate<'a> {
    Open { repo: &'a str },
    Blocked(ActionReason),
}

impl PullRequestAction {
    /// Whether automation may touch code for this action. Decided from the
    /// action's own resolution and threshold so that replay sees the same
    /// answer the executor did.
    pub fn gate(&self) -> Gate<'_> {
        let Some(repo) = self.repo.as_deref() else {
            return Gate::Blocked(ActionReason::new(
                ReasonCode::NoRepository,
                "no repository could be resolved",
            ));
        };
        if self.resolution.confidence < self.confidence_threshold {
            return Gate::Blocked(ActionReason::new(
                ReasonCode::RepoConfidence,
                format!(
                    "repo confidence {} ({}) below threshold {}",
                    self.resolution.confidence, self.resolution.provenance, self.confidence_threshold
                ),
            ));
        }
        Gate::Open { repo }
    }
}

/// A planned external side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum Action {
    CreateTicket(TicketAction),
    NotifyChat(ChatAction),
    CreatePullRequest(PullRequestAction),
}

impl Action {
    pub fn action_id(&self) -> &ActionId {
        match self {
            Action::CreateTicket(a) => &a.action_id,
            Action::NotifyChat(a) => &a.action_id,
            Action::CreatePullRequest(a) => &a.action_id,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Action::CreateTicket(_) => ActionType::CreateTicket,
            Action::NotifyChat(_) => ActionType::NotifyChat,
            Action::CreatePullRequest(_) => ActionType::CreatePullRequest,
        }
    }

    pub fn resolution(&self) -> Option<&ResolutionResult> {
        match self {
            Action::CreatePullRequest(a) => Some(&a.resolution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        }
    }
}

/// Machine-readable cause of a skip or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    AutomationDisabled,
    RepoConfidence,
    NoRepository,
    NotConfigured,
    ClientError,
    Timeout,
    LedgerUnavailable,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::AutomationDisabled => "automation_disabled",
            ReasonCode::RepoConfidence => "repo_confidence",
            ReasonCode::NoRepository => "no_repository",
            ReasonCode::NotConfigured => "not_configured",
            ReasonCode::ClientError => "client_error",
            ReasonCode::Timeout => "timeout",
            ReasonCode::LedgerUnavailable => "ledger_unavailable",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReason {
    pub code: ReasonCode,
    pub detail: String,
}

impl ActionReason {
    pub fn new(code: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

/// Terminal result of one action in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: ActionId,
    pub action_type: ActionType,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ActionReason>,
    #[serde(default)]
    pub external_refs: BTreeMap<String, String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionResult>,
    pub recorded_at: DateTime<Utc>,
}

impl ActionResult {
    fn base(action: &Action, status: ActionStatus, now: DateTime<Utc>) -> Self {
        Self {
            action_id: action.action_id().clone(),
            action_type: action.action_type(),
            status,
            reason: None,
            external_refs: BTreeMap::new(),
            dry_run: false,
            resolution: action.resolution().cloned(),
            recorded_at: now,
        }
    }

    pub fn success(action: &Action, external_refs: BTreeMap<String, String>, now: DateTime<Utc>) -> Self {
        Self {
            external_refs,
            ..Self::base(action, ActionStatus::Success, now)
        }
    }

    /// A success that never reached the external system.
    pub fn dry_run(action: &Action, now: DateTime<Utc>) -> Self {
        Self {
            dry_run: true,
            ..Self::base(action, ActionStatus::Success, now)
        }
    }

    pub fn skipped(action: &Action, reason: ActionReason, now: DateTime<Utc>) -> Self {
        Self {
            reason: Some(reason),
            ..Self::base(action, ActionStatus::Skipped, now)
        }
    }

    pub fn failed(action: &Action, reason: ActionReason, now: DateTime<Utc>) -> Self {
        Self {
            reason: Some(reason),
            ..Self::base(action, ActionStatus::Failed, now)
        }
    }

    pub fn reason_code(&self) -> Option<ReasonCode> {
        self.reason.as_ref().map(|r| r.code)
    }
}
