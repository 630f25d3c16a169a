//! Replay: regenerate a run's plan from its stored packet and diff it
//! against the plan that was persisted at the time.

use crate::action::{Action, Gate};
use crate::config::AutomationConfig;
use crate::plan::{generate, ActionPlan, PlanError};
use crate::resolver::RepoResolver;
use crate::store::{PacketStore, PlanStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Payload fields that are not compared directly. The threshold only
/// matters through the gate status it produces.
const UNCOMPARED_FIELDS: [&str; 2] = ["action_type", "confidence_threshold"];

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("no stored packet for incident {incident_id} run {run_id}")]
    PacketNotFound { incident_id: String, run_id: String },
    #[error("no stored plan for incident {incident_id} run {run_id}")]
    PlanNotFound { incident_id: String, run_id: String },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDiff {
    /// Location in the plan, e.g. `resolution.confidence` or `actions[2].status`.
    pub path: String,
    pub stored: Value,
    pub replayed: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub incident_id: String,
    pub run_id: String,
    #[serde(rename = "match")]
    pub matches: bool,
    pub diffs: Vec<FieldDiff>,
    pub stored_fingerprint: String,
    pub replayed_fingerprint: String,
    pub fingerprint_match: bool,
}

pub struct ReplayHarness {
    resolver: RepoResolver,
    plans: Arc<dyn PlanStore>,
    packets: Arc<dyn PacketStore>,
}

impl ReplayHarness {
    pub fn new(resolver: RepoResolver, plans: Arc<dyn PlanStore>, packets: Arc<dyn PacketStore>) -> Self {
        Self {
            resolver,
            plans,
            packets,
        }
    }

    /// Re-resolve and re-plan under `config`. Never executes anything.
    pub async fn replay(
        &self,
        incident_id: &str,
        run_id: &str,
        config: &AutomationConfig,
    ) -> Result<ReplayReport, ReplayError> {
        let packet = self
            .packets
            .get_packet(incident_id, run_id)
            .await?
            .ok_or_else(|| ReplayError::PacketNotFound {
                incident_id: incident_id.to_string(),
                run_id: run_id.to_string(),
            })?;
        let stored = self
            .plans
            .get_plan(incident_id, run_id)
            .await?
            .ok_or_else(|| ReplayError::PlanNotFound {
                incident_id: incident_id.to_string(),
                run_id: run_id.to_string(),
            })?;

        let resolution = self.resolver.resolve(&packet).await;
        let replayed = generate(&packet, &resolution, config)?;
        let diffs = diff_plans(&stored, &replayed);

        if diffs.is_empty() {
            info!("Replay of incident {} run {} matches", incident_id, run_id);
        } else {
            warn!(
                "Replay of incident {} run {} diverged in {} field(s): {}",
                incident_id,
                run_id,
                diffs.len(),
                diffs
                    .iter()
                    .map(|d| d.path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        Ok(ReplayReport {
            incident_id: incident_id.to_string(),
            run_id: run_id.to_string(),
            matches: diffs.is_empty(),
            fingerprint_match: stored.fingerprint == replayed.fingerprint,
            stored_fingerprint: stored.fingerprint,
            replayed_fingerprint: replayed.fingerprint,
            diffs,
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// `planned`, or `skipped:<reason>` when the PR gate would block.
pub fn projected_status(action: &Action) -> String {
    match action {
        Action::CreatePullRequest(pr) => match pr.gate() {
            Gate::Open { .. } => "planned".to_string(),
            Gate::Blocked(reason) => format!("skipped:{}", reason.code),
        },
        _ => "planned".to_string(),
    }
}

/// Field-by-field differences between a stored and a regenerated plan, in
/// a stable order: resolution first, then actions by position.
pub fn diff_plans(stored: &ActionPlan, replayed: &ActionPlan) -> Vec<FieldDiff> {
    let mut diffs = Vec::new();
    let mut push = |path: String, stored: Value, replayed: Value| {
        if stored != replayed {
            diffs.push(FieldDiff {
                path,
                stored,
                replayed,
            });
        }
    };

    let (a, b) = (&stored.resolution, &replayed.resolution);
    push("resolution.repo".to_string(), to_value(&a.repo), to_value(&b.repo));
    push(
        "resolution.confidence".to_string(),
        to_value(&a.confidence),
        to_value(&b.confidence),
    );
    push(
        "resolution.provenance".to_string(),
        to_value(&a.provenance),
        to_value(&b.provenance),
    );
    push("resolution.reasons".to_string(), to_value(&a.reasons), to_value(&b.reasons));

    let count = stored.actions.len().max(replayed.actions.len());
    for i in 0..count {
        match (stored.actions.get(i), replayed.actions.get(i)) {
            (Some(old), Some(new)) if old.action_type() != new.action_type() => {
                push(
                    format!("actions[{}].action_type", i),
                    to_value(&old.action_type()),
                    to_value(&new.action_type()),
                );
            }
            (Some(old), Some(new)) => {
                diff_payload(i, &to_value(old), &to_value(new), &mut push);
                push(
                    format!("actions[{}].status", i),
                    Value::String(projected_status(old)),
                    Value::String(projected_status(new)),
                );
            }
            (Some(old), None) => push(format!("actions[{}]", i), to_value(old), Value::Null),
            (None, Some(new)) => push(format!("actions[{}]", i), Value::Null, to_value(new)),
            (None, None) => {}
        }
    }

    diffs
}

fn diff_payload(
    index: usize,
    stored: &Value,
    replayed: &Value,
    push: &mut impl FnMut(String, Value, Value),
) {
    let (Some(old), Some(new)) = (stored.as_object(), replayed.as_object()) else {
        push(format!("actions[{}]", index), stored.clone(), replayed.clone());
        return;
    };

    let mut fields: Vec<&String> = old.keys().chain(new.keys()).collect();
    fields.sort();
    fields.dedup();

    for field in fields {
        if UNCOMPARED_FIELDS.contains(&field.as_str()) {
            continue;
        }
        push(
            format!("actions[{}].{}", index, field),
            old.get(field).cloned().unwrap_or(Value::Null),
            new.get(field).cloned().unwrap_or(Value::Null),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::packet::tests::sample_packet;
    use crate::plan::tests::{pr_config, resolution};
    use crate::resolver::tests::FakeProbe;
    use crate::resolver::{MappingTable, Provenance};

    async fn seeded(threshold: f64) -> (Arc<InMemoryStore>, ReplayHarness) {
        let store = Arc::new(InMemoryStore::new());
        let probe = FakeProbe::with(&["acme/orders-service:orders/handler.py"]);
        let resolver = RepoResolver::new(Arc::new(MappingTable::default()))
            .with_probe(Arc::new(probe))
            .with_default_owner("acme");

        let packet = sample_packet();
        let res = resolver.resolve(&packet).await;
        assert_eq!(res.provenance, Provenance::TraceVerified);
        store.put_packet(&packet).await.unwrap();
        store
            .put_plan_if_absent(&generate(&packet, &res, &pr_config(threshold)).unwrap())
            .await
            .unwrap();

        let harness = ReplayHarness::new(resolver, store.clone(), store.clone());
        (store, harness)
    }

    #[tokio::test]
    async fn test_unchanged_replay_matches() {
        let (_, harness) = seeded(0.7).await;
        let report = harness.replay("inc-42", "run-1", &pr_config(0.7)).await.unwrap();
        assert!(report.matches);
        assert!(report.fingerprint_match);
        assert!(report.diffs.is_empty());
    }

    #[tokio::test]
    async fn test_raised_threshold_diverges_only_at_pr_status() {
        let (_, harness) = seeded(0.7).await;
        let report = harness.replay("inc-42", "run-1", &pr_config(0.99)).await.unwrap();

        assert!(!report.matches);
        assert!(!report.fingerprint_match);
        assert_eq!(
            report.diffs,
            vec![FieldDiff {
                path: "actions[2].status".to_string(),
                stored: Value::String("planned".to_string()),
                replayed: Value::String("skipped:repo_confidence".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn test_disabling_pr_reports_removed_action() {
        let (_, harness) = seeded(0.7).await;
        let config = AutomationConfig {
            pull_request_enabled: false,
            ..pr_config(0.7)
        };
        let report = harness.replay("inc-42", "run-1", &config).await.unwrap();
        assert_eq!(report.diffs.len(), 1);
        assert_eq!(report.diffs[0].path, "actions[2]");
        assert_eq!(report.diffs[0].replayed, Value::Null);
    }

    #[tokio::test]
    async fn test_missing_run_is_an_error() {
        let (_, harness) = seeded(0.7).await;
        let err = harness.replay("inc-42", "run-9", &pr_config(0.7)).await.unwrap_err();
        assert!(matches!(err, ReplayError::PacketNotFound { .. }));
    }

    #[test]
    fn test_resolution_changes_are_reported_per_field() {
        let packet = sample_packet();
        let stored = generate(&packet, &resolution(0.85, Provenance::TraceVerified), &pr_config(0.7)).unwrap();
        let replayed = generate(&packet, &resolution(0.5, Provenance::Heuristic), &pr_config(0.7)).unwrap();

        let paths: Vec<String> = diff_plans(&stored, &replayed).into_iter().map(|d| d.path).collect();
        assert_eq!(
            paths,
            vec![
                "resolution.confidence",
                "resolution.provenance",
                "actions[2].body",
                "actions[2].notes_content",
                "actions[2].resolution",
                "actions[2].status",
            ]
        );
    }

    #[test]
    fn test_projected_status_for_non_pr_actions_is_planned() {
        let plan = generate(
            &sample_packet(),
            &resolution(0.1, Provenance::Heuristic),
            &pr_config(0.7),
        ).unwrap();
        assert_eq!(projected_status(&plan.actions[0]), "planned");
        assert_eq!(projected_status(&plan.actions[2]), "skipped:repo_confidence");
    }
}
