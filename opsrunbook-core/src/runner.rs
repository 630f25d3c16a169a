//! One incident run end to end: store the packet, resolve, plan, execute.

use crate::config::AutomationConfig;
use crate::executor::{ActionsExecutor, ExecutedAction};
use crate::packet::{FindingsPacket, PacketError};
use crate::plan::{generate, PlanError};
use crate::resolver::RepoResolver;
use crate::store::{PacketStore, PlanStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid findings packet: {0}")]
    InvalidPacket(#[from] PacketError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub incident_id: String,
    pub run_id: String,
    pub fingerprint: String,
    /// True when a plan stored by an earlier invocation was executed.
    pub plan_reused: bool,
    pub results: Vec<ExecutedAction>,
}

pub struct IncidentRunner {
    resolver: RepoResolver,
    executor: ActionsExecutor,
    plans: Arc<dyn PlanStore>,
    packets: Arc<dyn PacketStore>,
}

impl IncidentRunner {
    pub fn new(
        resolver: RepoResolver,
        executor: ActionsExecutor,
        plans: Arc<dyn PlanStore>,
        packets: Arc<dyn PacketStore>,
    ) -> Self {
        Self {
            resolver,
            executor,
            plans,
            packets,
        }
    }

    /// The first plan stored for a run is the one every later invocation
    /// executes, so retries cannot drift onto a different plan.
    pub async fn run(
        &self,
        packet: &FindingsPacket,
        config: &AutomationConfig,
    ) -> Result<RunReport, RunError> {
        packet.validate()?;
        self.packets.put_packet(packet).await?;

        let (plan, plan_reused) = match self
            .plans
            .get_plan(&packet.incident_id, &packet.run_id)
            .await?
        {
            Some(existing) => (existing, true),
            None => {
                let resolution = self.resolver.resolve(packet).await;
                info!(
                    "Incident {} run {}: resolved {} ({}, confidence {})",
                    packet.incident_id,
                    packet.run_id,
                    resolution.repo.as_deref().unwrap_or("no repository"),
                    resolution.provenance,
                    resolution.confidence
                );
                let fresh = generate(packet, &resolution, config)?;
                let (stored, plan) = self.plans.put_plan_if_absent(&fresh).await?;
                (plan, !stored)
            }
        };

        info!(
            "Incident {} run {}: executing plan {} ({} action(s), reused: {})",
            plan.incident_id,
            plan.run_id,
            plan.fingerprint,
            plan.actions.len(),
            plan_reused
        );
        let results = self.executor.execute(&plan, config).await;

        Ok(RunReport {
            incident_id: plan.incident_id.clone(),
            run_id: plan.run_id.clone(),
            fingerprint: plan.fingerprint.clone(),
            plan_reused,
            results,
        })
    }
}
