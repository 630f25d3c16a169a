//! Idempotency ledger: one terminal [`ActionResult`] per action per run.

use crate::action::{ActionId, ActionResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub incident_id: String,
    pub run_id: String,
    pub action_id: ActionId,
}

impl LedgerKey {
    pub fn new(incident_id: impl Into<String>, run_id: impl Into<String>, action_id: ActionId) -> Self {
        Self {
            incident_id: incident_id.into(),
            run_id: run_id.into(),
            action_id,
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.incident_id, self.run_id, self.action_id)
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq)]
pub struct PutOutcome {
    /// Whether this writer's result was stored.
    pub accepted: bool,
    /// The stored result: ours when accepted, otherwise the earlier winner.
    pub winning: ActionResult,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Storage(String),
    #[error("ledger record corrupted: {0}")]
    Corrupted(String),
}

/// Durable record that prevents an action from running twice in one run.
///
/// `put_if_absent` must be a single conditional write: of any number of
/// concurrent callers for one key exactly one sees `accepted == true`, and
/// all of them get the same `winning` result back.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn get(&self, key: &LedgerKey) -> Result<Option<ActionResult>, LedgerError>;

    async fn put_if_absent(
        &self,
        key: &LedgerKey,
        result: ActionResult,
    ) -> Result<PutOutcome, LedgerError>;

    /// Append to the attempt log. Attempts are never deduplicated.
    async fn record_attempt(&self, key: &LedgerKey, result: &ActionResult) -> Result<(), LedgerError>;

    /// Attempt log for one key, oldest first.
    async fn attempts(&self, key: &LedgerKey) -> Result<Vec<ActionResult>, LedgerError>;

    /// Terminal results of a run, ordered by action id.
    async fn results_for_run(
        &self,
        incident_id: &str,
        run_id: &str,
    ) -> Result<Vec<ActionResult>, LedgerError>;
}
