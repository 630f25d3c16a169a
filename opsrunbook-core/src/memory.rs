//! In-memory implementation of every store trait.
//!
//! All state is lost on restart. Used by tests, the CLI, and as the
//! reference behavior the SQLite repository must match.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::action::ActionResult;
use crate::command::ReviewCommand;
use crate::ledger::{IdempotencyLedger, LedgerError, LedgerKey, PutOutcome};
use crate::packet::FindingsPacket;
use crate::plan::ActionPlan;
use crate::review_state::{transition, PrReviewState, PullRequestId, ReviewStateStore, Transition};
use crate::store::{PacketStore, PlanStore, StoreError};
use crate::webhook::{DeliveryClaim, DeliveryRecord, DeliveryStore, FAILED_OUTCOME};

type RunKey = (String, String);

/// In-memory store.
///
/// Conditional writes take the write lock for the whole check-and-insert,
/// which gives the same single-winner guarantee as a unique index.
#[derive(Default)]
pub struct InMemoryStore {
    results: RwLock<HashMap<LedgerKey, ActionResult>>,
    attempts: RwLock<HashMap<LedgerKey, Vec<ActionResult>>>,
    plans: RwLock<HashMap<RunKey, ActionPlan>>,
    packets: RwLock<HashMap<RunKey, FindingsPacket>>,
    deliveries: RwLock<HashMap<String, DeliveryRecord>>,
    review_states: RwLock<HashMap<PullRequestId, PrReviewState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn run_key(incident_id: &str, run_id: &str) -> RunKey {
    (incident_id.to_string(), run_id.to_string())
}

#[async_trait]
impl IdempotencyLedger for InMemoryStore {
    async fn get(&self, key: &LedgerKey) -> Result<Option<ActionResult>, LedgerError> {
        let results = self.results.read().await;
        Ok(results.get(key).cloned())
    }

    async fn put_if_absent(
        &self,
        key: &LedgerKey,
        result: ActionResult,
    ) -> Result<PutOutcome, LedgerError> {
        let mut results = self.results.write().await;
        match results.entry(key.clone()) {
            Entry::Occupied(existing) => Ok(PutOutcome {
                accepted: false,
                winning: existing.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(result.clone());
                Ok(PutOutcome {
                    accepted: true,
                    winning: result,
                })
            }
        }
    }

    async fn record_attempt(&self, key: &LedgerKey, result: &ActionResult) -> Result<(), LedgerError> {
        let mut attempts = self.attempts.write().await;
        attempts.entry(key.clone()).or_default().push(result.clone());
        Ok(())
    }

    async fn attempts(&self, key: &LedgerKey) -> Result<Vec<ActionResult>, LedgerError> {
        let attempts = self.attempts.read().await;
        Ok(attempts.get(key).cloned().unwrap_or_default())
    }

    async fn results_for_run(
        &self,
        incident_id: &str,
        run_id: &str,
    ) -> Result<Vec<ActionResult>, LedgerError> {
        let results = self.results.read().await;
        let mut found: Vec<ActionResult> = results
            .iter()
            .filter(|(key, _)| key.incident_id == incident_id && key.run_id == run_id)
            .map(|(_, result)| result.clone())
            .collect();
        found.sort_by(|a, b| a.action_id.cmp(&b.action_id));
        Ok(found)
    }
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn put_plan_if_absent(&self, plan: &ActionPlan) -> Result<(bool, ActionPlan), StoreError> {
        let mut plans = self.plans.write().await;
        match plans.entry(run_key(&plan.incident_id, &plan.run_id)) {
            Entry::Occupied(existing) => Ok((false, existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(plan.clone());
                Ok((true, plan.clone()))
            }
        }
    }

    async fn get_plan(&self, incident_id: &str, run_id: &str) -> Result<Option<ActionPlan>, StoreError> {
        let plans = self.plans.read().await;
        Ok(plans.get(&run_key(incident_id, run_id)).cloned())
    }
}

#[async_trait]
impl PacketStore for InMemoryStore {
    async fn put_packet(&self, packet: &FindingsPacket) -> Result<(), StoreError> {
        let mut packets = self.packets.write().await;
        match packets.entry(run_key(&packet.incident_id, &packet.run_id)) {
            Entry::Occupied(existing) if existing.get() != packet => Err(StoreError::Conflict(format!(
                "a different packet is already stored for incident {} run {}",
                packet.incident_id, packet.run_id
            ))),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(packet.clone());
                Ok(())
            }
        }
    }

    async fn get_packet(
        &self,
        incident_id: &str,
        run_id: &str,
    ) -> Result<Option<FindingsPacket>, StoreError> {
        let packets = self.packets.read().await;
        Ok(packets.get(&run_key(incident_id, run_id)).cloned())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn try_claim(&self, record: &DeliveryRecord) -> Result<DeliveryClaim, StoreError> {
        let mut deliveries = self.deliveries.write().await;
        match deliveries.entry(record.delivery_id.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().outcome.as_deref() == Some(FAILED_OUTCOME) {
                    slot.insert(record.clone());
                    Ok(DeliveryClaim::Claimed)
                } else {
                    Ok(DeliveryClaim::AlreadyRecorded)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(DeliveryClaim::Claimed)
            }
        }
    }

    async fn record_outcome(
        &self,
        delivery_id: &str,
        outcome: &str,
        sender_login: Option<&str>,
        command: Option<ReviewCommand>,
    ) -> Result<(), StoreError> {
        let mut deliveries = self.deliveries.write().await;
        let record = deliveries.get_mut(delivery_id).ok_or_else(|| {
            StoreError::Storage(format!("delivery {} was never claimed", delivery_id))
        })?;
        record.outcome = Some(outcome.to_string());
        record.sender_login = sender_login.map(str::to_string);
        record.command = command;
        Ok(())
    }

    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<DeliveryRecord>, StoreError> {
        let deliveries = self.deliveries.read().await;
        Ok(deliveries.get(delivery_id).cloned())
    }
}

#[async_trait]
impl ReviewStateStore for InMemoryStore {
    async fn get_state(&self, pr: &PullRequestId) -> Result<Option<PrReviewState>, StoreError> {
        let states = self.review_states.read().await;
        Ok(states.get(pr).cloned())
    }

    async fn apply(
        &self,
        pr: &PullRequestId,
        command: Option<ReviewCommand>,
        author: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition, StoreError> {
        let mut states = self.review_states.write().await;
        let result = transition(states.get(pr).cloned(), pr, command, author, now);
        states.insert(pr.clone(), result.state.clone());
        Ok(result)
    }
}
