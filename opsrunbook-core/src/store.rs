//! Storage seams for the inputs and plans that replay depends on.

use crate::packet::FindingsPacket;
use crate::plan::ActionPlan;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("stored record corrupted: {0}")]
    Corrupted(String),
    #[error("conflicting record: {0}")]
    Conflict(String),
}

/// Persisted action plans, one per `(incident_id, run_id)`.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Store `plan` unless one already exists for the run. Returns whether it
    /// was stored and the plan now on record.
    async fn put_plan_if_absent(&self, plan: &ActionPlan) -> Result<(bool, ActionPlan), StoreError>;

    async fn get_plan(&self, incident_id: &str, run_id: &str) -> Result<Option<ActionPlan>, StoreError>;
}

/// Persisted findings packets, the original inputs of a run.
#[async_trait]
pub trait PacketStore: Send + Sync {
    /// Store the packet for its run. Storing an identical packet again is a
    /// no-op; a different packet for the same run is a `Conflict`.
    async fn put_packet(&self, packet: &FindingsPacket) -> Result<(), StoreError>;

    async fn get_packet(&self, incident_id: &str, run_id: &str) -> Result<Option<FindingsPacket>, StoreError>;
}
