//! Per-PR review-cycle state machine.
//!
//! Two states, `active` and `paused`, driven by `/copilot stop` and
//! `/copilot resume`. The transition function is pure; stores apply it
//! atomically per PR and the controller acts on the returned decision.

use crate::command::ReviewCommand;
use crate::executor::ClientError;
use crate::store::StoreError;
use crate::webhook::ReviewEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Active,
    Paused,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Active => "active",
            ReviewStatus::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ReviewStatus::Active),
            "paused" => Some(ReviewStatus::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullRequestId {
    pub repo_full_name: String,
    pub pr_number: u64,
}

impl PullRequestId {
    pub fn new(repo_full_name: impl Into<String>, pr_number: u64) -> Self {
        Self {
            repo_full_name: repo_full_name.into(),
            pr_number,
        }
    }
}

impl fmt::Display for PullRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo_full_name, self.pr_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrReviewState {
    pub pr: PullRequestId,
    pub status: ReviewStatus,
    pub last_command_author: Option<String>,
    pub last_transition_at: DateTime<Utc>,
}

impl PrReviewState {
    pub fn new(pr: PullRequestId, now: DateTime<Utc>) -> Self {
        Self {
            pr,
            status: ReviewStatus::Active,
            last_command_author: None,
            last_transition_at: now,
        }
    }
}

/// What the caller should do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// `/copilot stop`; `changed` is false when already paused.
    Paused { changed: bool },
    /// `/copilot resume`; `changed` is false when already active.
    Resumed { changed: bool },
    /// Non-command signal on an active PR: run the review cycle.
    Dispatch,
    /// Non-command signal on a paused PR: recorded, nothing triggered.
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: PrReviewState,
    pub decision: ReviewDecision,
}

/// Pure transition. `current` is `None` on first touch, which starts active.
pub fn transition(
    current: Option<PrReviewState>,
    pr: &PullRequestId,
    command: Option<ReviewCommand>,
    author: &str,
    now: DateTime<Utc>,
) -> Transition {
    let state = current.unwrap_or_else(|| PrReviewState::new(pr.clone(), now));

    match (state.status, command) {
        (ReviewStatus::Active, Some(ReviewCommand::Stop)) => Transition {
            state: PrReviewState {
                status: ReviewStatus::Paused,
                last_command_author: Some(author.to_string()),
                last_transition_at: now,
                ..state
            },
            decision: ReviewDecision::Paused { changed: true },
        },
        (ReviewStatus::Paused, Some(ReviewCommand::Stop)) => Transition {
            state,
            decision: ReviewDecision::Paused { changed: false },
        },
        (ReviewStatus::Paused, Some(ReviewCommand::Resume)) => Transition {
            state: PrReviewState {
                status: ReviewStatus::Active,
                last_command_author: Some(author.to_string()),
                last_transition_at: now,
                ..state
            },
            decision: ReviewDecision::Resumed { changed: true },
        },
        (ReviewStatus::Active, Some(ReviewCommand::Resume)) => Transition {
            state,
            decision: ReviewDecision::Resumed { changed: false },
        },
        (ReviewStatus::Active, None) => Transition {
            state,
            decision: ReviewDecision::Dispatch,
        },
        (ReviewStatus::Paused, None) => Transition {
            state,
            decision: ReviewDecision::Suppressed,
        },
    }
}

#[async_trait]
pub trait ReviewStateStore: Send + Sync {
    async fn get_state(&self, pr: &PullRequestId) -> Result<Option<PrReviewState>, StoreError>;

    /// Read, [`transition`] and write back as one atomic step for `pr`.
    async fn apply(
        &self,
        pr: &PullRequestId,
        command: Option<ReviewCommand>,
        author: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError>;
}

/// Starts the downstream review cycle for an active PR.
#[async_trait]
pub trait ReviewCycleTrigger: Send + Sync {
    async fn dispatch(&self, event: &ReviewEvent) -> Result<(), ClientError>;
}

pub struct ReviewCycleController {
    states: Arc<dyn ReviewStateStore>,
    trigger: Arc<dyn ReviewCycleTrigger>,
}

impl ReviewCycleController {
    pub fn new(states: Arc<dyn ReviewStateStore>, trigger: Arc<dyn ReviewCycleTrigger>) -> Self {
        Self { states, trigger }
    }

    /// Apply an accepted event to its PR and dispatch the review cycle when
    /// the PR is active. A failed dispatch is logged; the state change stands.
    pub async fn handle(&self, event: &ReviewEvent) -> Result<Transition, StoreError> {
        let pr = PullRequestId::new(&event.repo_full_name, event.pr_number);
        let result = self
            .states
            .apply(&pr, event.command, &event.sender_login, Utc::now())
            .await?;

        match result.decision {
            ReviewDecision::Dispatch => {
                if let Err(e) = self.trigger.dispatch(event).await {
                    warn!("Review cycle dispatch for {} failed: {}", pr, e);
                }
            }
            ReviewDecision::Suppressed => {
                info!(
                    "PR {} is paused; delivery {} recorded without dispatch",
                    pr, event.delivery_id
                );
            }
            ReviewDecision::Paused { changed } | ReviewDecision::Resumed { changed } => {
                info!(
                    "PR {} is now {} (by {}, changed: {})",
                    pr,
                    result.state.status.as_str(),
                    event.sender_login,
                    changed
                );
            }
        }

        Ok(result)
    }
}
