//! Idempotent execution of an [`ActionPlan`].
//!
//! Each action is handled independently: kill switch, ledger lookup,
//! confidence gate, then the external call under a timeout, and finally a
//! conditional write. A failing action never prevents its siblings from
//! running, and every action yields exactly one result.

use crate::action::{
    Action, ActionReason, ActionResult, ChatAction, Gate, PullRequestAction, ReasonCode,
    TicketAction,
};
use crate::config::AutomationConfig;
use crate::ledger::{IdempotencyLedger, LedgerKey, PutOutcome};
use crate::plan::ActionPlan;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifiers of what an external system created (issue key, PR URL, ...)
pub type ExternalRefs = BTreeMap<String, String>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("client not configured: {0}")]
    NotConfigured(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected response {status}: {body}")]
    Status { status: u16, body: String },
}

#[async_trait]
pub trait TicketClient: Send + Sync {
    async fn create_ticket(&self, action: &TicketAction) -> Result<ExternalRefs, ClientError>;
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn notify(&self, action: &ChatAction) -> Result<ExternalRefs, ClientError>;
}

#[async_trait]
pub trait PullRequestClient: Send + Sync {
    /// Create the branch, commit the notes file and open (or update) the PR.
    async fn create_or_update(
        &self,
        repo: &str,
        action: &PullRequestAction,
    ) -> Result<ExternalRefs, ClientError>;
}

/// The external collaborators an executor talks to
#[derive(Clone)]
pub struct ActionClients {
    pub ticket: Arc<dyn TicketClient>,
    pub chat: Arc<dyn ChatClient>,
    pub pull_request: Arc<dyn PullRequestClient>,
}

/// Where a returned result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrigin {
    /// Executed now and recorded by this caller.
    Executed,
    /// A terminal result already existed; nothing was called.
    AlreadyRecorded,
    /// Executed now, but a concurrent caller recorded first; theirs is returned.
    ConcurrentWinner,
    /// Automation is disabled; the ledger was not touched.
    KillSwitch,
    /// The ledger could not be read or written; the result is not durable.
    Unrecorded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutedAction {
    pub result: ActionResult,
    pub origin: ResultOrigin,
}

pub struct ActionsExecutor {
    ledger: Arc<dyn IdempotencyLedger>,
    clients: ActionClients,
    call_timeout: Duration,
}

impl ActionsExecutor {
    pub fn new(ledger: Arc<dyn IdempotencyLedger>, clients: ActionClients) -> Self {
        Self {
            ledger,
            clients,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// One result per action, in plan order. Actions run concurrently.
    pub async fn execute(&self, plan: &ActionPlan, config: &AutomationConfig) -> Vec<ExecutedAction> {
        let steps = plan
            .actions
            .iter()
            .map(|action| self.execute_action(plan, action, config));
        join_all(steps).await
    }

    async fn execute_action(
        &self,
        plan: &ActionPlan,
        action: &Action,
        config: &AutomationConfig,
    ) -> ExecutedAction {
        if !config.automation_enabled {
            info!(
                "Incident {} run {}: automation disabled, skipping {}",
                plan.incident_id,
                plan.run_id,
                action.action_type()
            );
            return ExecutedAction {
                result: ActionResult::skipped(
                    action,
                    ActionReason::new(ReasonCode::AutomationDisabled, "automation kill switch is engaged"),
                    Utc::now(),
                ),
                origin: ResultOrigin::KillSwitch,
            };
        }

        let key = LedgerKey::new(&plan.incident_id, &plan.run_id, action.action_id().clone());

        match self.ledger.get(&key).await {
            Ok(Some(existing)) => {
                info!(
                    "Incident {} run {}: {} already recorded as {}",
                    plan.incident_id,
                    plan.run_id,
                    action.action_type(),
                    existing.status.as_str()
                );
                return ExecutedAction {
                    result: existing,
                    origin: ResultOrigin::AlreadyRecorded,
                };
            }
            Ok(None) => {}
            Err(e) => {
                error!("Ledger lookup failed for {}: {}", key, e);
                return ExecutedAction {
                    result: ActionResult::failed(
                        action,
                        ActionReason::new(ReasonCode::LedgerUnavailable, e.to_string()),
                        Utc::now(),
                    ),
                    origin: ResultOrigin::Unrecorded,
                };
            }
        }

        let result = self.attempt(action, config).await;
        info!(
            "Incident {} run {}: {} finished with {}{}",
            plan.incident_id,
            plan.run_id,
            action.action_type(),
            result.status.as_str(),
            result
                .reason
                .as_ref()
                .map(|r| format!(" ({}: {})", r.code, r.detail))
                .unwrap_or_default()
        );

        if let Err(e) = self.ledger.record_attempt(&key, &result).await {
            warn!("Failed to append attempt for {}: {}", key, e);
        }

        match self.ledger.put_if_absent(&key, result.clone()).await {
            Ok(PutOutcome {
                accepted: true,
                winning,
            }) => ExecutedAction {
                result: winning,
                origin: ResultOrigin::Executed,
            },
            Ok(PutOutcome {
                accepted: false,
                winning,
            }) => {
                info!(
                    "Incident {} run {}: lost race for {}, adopting recorded result",
                    plan.incident_id,
                    plan.run_id,
                    action.action_type()
                );
                ExecutedAction {
                    result: winning,
                    origin: ResultOrigin::ConcurrentWinner,
                }
            }
            Err(e) => {
                error!("Failed to record result for {}: {}", key, e);
                ExecutedAction {
                    result,
                    origin: ResultOrigin::Unrecorded,
                }
            }
        }
    }

    /// Gate, dry-run and external call for a single action.
    async fn attempt(&self, action: &Action, config: &AutomationConfig) -> ActionResult {
        let pr_repo = match action {
            Action::CreatePullRequest(pr) => match pr.gate() {
                Gate::Open { repo } => Some(repo),
                Gate::Blocked(reason) => return ActionResult::skipped(action, reason, Utc::now()),
            },
            _ => None,
        };

        if config.dry_run {
            return ActionResult::dry_run(action, Utc::now());
        }

        let call = async {
            match action {
                Action::CreateTicket(ticket) => self.clients.ticket.create_ticket(ticket).await,
                Action::NotifyChat(chat) => self.clients.chat.notify(chat).await,
                Action::CreatePullRequest(pr) => {
                    let repo = pr_repo.unwrap_or_default();
                    self.clients.pull_request.create_or_update(repo, pr).await
                }
            }
        };

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(refs)) => ActionResult::success(action, refs, Utc::now()),
            Ok(Err(ClientError::NotConfigured(what))) => ActionResult::skipped(
                action,
                ActionReason::new(ReasonCode::NotConfigured, what),
                Utc::now(),
            ),
            Ok(Err(e)) => ActionResult::failed(
                action,
                ActionReason::new(ReasonCode::ClientError, e.to_string()),
                Utc::now(),
            ),
            Err(_) => ActionResult::failed(
                action,
                ActionReason::new(
                    ReasonCode::Timeout,
                    format!("no response within {}s", self.call_timeout.as_secs_f64()),
                ),
                Utc::now(),
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::action::{ActionStatus, ActionType};
    use crate::memory::InMemoryStore;
    use crate::packet::tests::sample_packet;
    use crate::plan::generate;
    use crate::plan::tests::{pr_config, resolution};
    use crate::resolver::Provenance;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client fake that counts calls and can be told to fail or hang.
    #[derive(Default)]
    pub(crate) struct FakeClient {
        pub(crate) calls: AtomicUsize,
        fail: bool,
        hang: bool,
        unconfigured: bool,
    }

    impl FakeClient {
        pub(crate) fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        fn hanging() -> Self {
            Self { hang: true, ..Self::default() }
        }

        fn unconfigured() -> Self {
            Self { unconfigured: true, ..Self::default() }
        }

        async fn respond(&self, key: &str, value: &str) -> Result<ExternalRefs, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.unconfigured {
                return Err(ClientError::NotConfigured("no credentials".to_string()));
            }
            if self.fail {
                return Err(ClientError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(BTreeMap::from([(key.to_string(), value.to_string())]))
        }
    }

    #[async_trait]
    impl TicketClient for FakeClient {
        async fn create_ticket(&self, _action: &TicketAction) -> Result<ExternalRefs, ClientError> {
            self.respond("issue_key", "OPS-1").await
        }
    }

    #[async_trait]
    impl ChatClient for FakeClient {
        async fn notify(&self, _action: &ChatAction) -> Result<ExternalRefs, ClientError> {
            self.respond("status_code", "200").await
        }
    }

    #[async_trait]
    impl PullRequestClient for FakeClient {
        async fn create_or_update(
            &self,
            repo: &str,
            action: &PullRequestAction,
        ) -> Result<ExternalRefs, ClientError> {
            self.respond("pr_url", &format!("https://github.com/{}/pull/{}", repo, action.branch))
                .await
        }
    }

    pub(crate) struct Fakes {
        pub(crate) ticket: Arc<FakeClient>,
        pub(crate) chat: Arc<FakeClient>,
        pub(crate) pull_request: Arc<FakeClient>,
    }

    impl Fakes {
        pub(crate) fn new() -> Self {
            Self::with(FakeClient::default(), FakeClient::default(), FakeClient::default())
        }

        fn with(ticket: FakeClient, chat: FakeClient, pull_request: FakeClient) -> Self {
            Self {
                ticket: Arc::new(ticket),
                chat: Arc::new(chat),
                pull_request: Arc::new(pull_request),
            }
        }

        pub(crate) fn clients(&self) -> ActionClients {
            ActionClients {
                ticket: self.ticket.clone(),
                chat: self.chat.clone(),
                pull_request: self.pull_request.clone(),
            }
        }

        fn total_calls(&self) -> usize {
            self.ticket.calls.load(Ordering::SeqCst)
                + self.chat.calls.load(Ordering::SeqCst)
                + self.pull_request.calls.load(Ordering::SeqCst)
        }
    }

    fn live(threshold: f64) -> AutomationConfig {
        AutomationConfig {
            dry_run: false,
            ..pr_config(threshold)
        }
    }

    fn statuses(results: &[ExecutedAction]) -> Vec<ActionStatus> {
        results.iter().map(|r| r.result.status).collect()
    }

    #[tokio::test]
    async fn test_second_execution_returns_recorded_results_without_calls() {
        let fakes = Fakes::new();
        let store = Arc::new(InMemoryStore::new());
        let executor = ActionsExecutor::new(store.clone(), fakes.clients());
        let config = live(0.7);
        let plan = generate(&sample_packet(), &resolution(0.85, Provenance::TraceVerified), &config).unwrap();

        let first = executor.execute(&plan, &config).await;
        assert_eq!(fakes.total_calls(), 3);
        assert!(first.iter().all(|r| r.origin == ResultOrigin::Executed));
        assert_eq!(statuses(&first), vec![ActionStatus::Success; 3]);

        let second = executor.execute(&plan, &config).await;
        assert_eq!(fakes.total_calls(), 3);
        assert!(second.iter().all(|r| r.origin == ResultOrigin::AlreadyRecorded));
        let first_results: Vec<_> = first.into_iter().map(|r| r.result).collect();
        let second_results: Vec<_> = second.into_iter().map(|r| r.result).collect();
        assert_eq!(first_results, second_results);
    }

    #[tokio::test]
    async fn test_low_confidence_skips_pr_and_records_resolution() {
        let fakes = Fakes::new();
        let store = Arc::new(InMemoryStore::new());
        let executor = ActionsExecutor::new(store, fakes.clients());
        let config = live(0.7);
        let plan = generate(&sample_packet(), &resolution(0.5, Provenance::Heuristic), &config).unwrap();

        let results = executor.execute(&plan, &config).await;
        let pr = &results[2].result;
        assert_eq!(pr.action_type, ActionType::CreatePullRequest);
        assert_eq!(pr.status, ActionStatus::Skipped);
        assert_eq!(pr.reason_code(), Some(ReasonCode::RepoConfidence));
        assert_eq!(pr.resolution.as_ref().map(|r| r.confidence), Some(0.5));
        assert_eq!(fakes.pull_request.calls.load(Ordering::SeqCst), 0);
        // Siblings are unaffected by the gate
        assert_eq!(results[0].result.status, ActionStatus::Success);
        assert_eq!(results[1].result.status, ActionStatus::Success);
    }

    #[tokio::test]
    async fn test_verified_confidence_opens_pr() {
        let fakes = Fakes::new();
        let executor = ActionsExecutor::new(Arc::new(InMemoryStore::new()), fakes.clients());
        let config = live(0.7);
        let plan = generate(&sample_packet(), &resolution(0.85, Provenance::TraceVerified), &config).unwrap();

        let results = executor.execute(&plan, &config).await;
        let pr = &results[2].result;
        assert_eq!(pr.status, ActionStatus::Success);
        assert!(pr.external_refs["pr_url"].starts_with("https://github.com/acme/orders-service/"));
        assert_eq!(fakes.pull_request.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kill_switch_skips_without_touching_ledger() {
        let fakes = Fakes::new();
        let store = Arc::new(InMemoryStore::new());
        let executor = ActionsExecutor::new(store.clone(), fakes.clients());
        let config = AutomationConfig {
            automation_enabled: false,
            ..live(0.7)
        };
        let plan = generate(&sample_packet(), &resolution(0.85, Provenance::TraceVerified), &config).unwrap();

        let results = executor.execute(&plan, &config).await;
        assert!(results.iter().all(|r| r.origin == ResultOrigin::KillSwitch
            && r.result.reason_code() == Some(ReasonCode::AutomationDisabled)));
        assert_eq!(fakes.total_calls(), 0);
        assert!(store.results_for_run("inc-42", "run-1").await.unwrap().is_empty());

        // Re-enabling later still executes: nothing was recorded
        let results = executor.execute(&plan, &live(0.7)).await;
        assert_eq!(statuses(&results), vec![ActionStatus::Success; 3]);
    }

    #[tokio::test]
    async fn test_dry_run_records_marked_success_without_calls() {
        let fakes = Fakes::new();
        let store = Arc::new(InMemoryStore::new());
        let executor = ActionsExecutor::new(store.clone(), fakes.clients());
        let config = pr_config(0.7);
        let plan = generate(&sample_packet(), &resolution(0.85, Provenance::TraceVerified), &config).unwrap();

        let results = executor.execute(&plan, &config).await;
        assert!(results.iter().all(|r| r.result.dry_run && r.result.status == ActionStatus::Success));
        assert_eq!(fakes.total_calls(), 0);
        assert_eq!(store.results_for_run("inc-42", "run-1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failure_is_terminal_and_isolated() {
        let fakes = Fakes::with(FakeClient::failing(), FakeClient::default(), FakeClient::unconfigured());
        let store = Arc::new(InMemoryStore::new());
        let executor = ActionsExecutor::new(store.clone(), fakes.clients());
        let config = live(0.7);
        let plan = generate(&sample_packet(), &resolution(0.85, Provenance::TraceVerified), &config).unwrap();

        let results = executor.execute(&plan, &config).await;
        assert_eq!(
            statuses(&results),
            vec![ActionStatus::Failed, ActionStatus::Success, ActionStatus::Skipped]
        );
        assert_eq!(results[0].result.reason_code(), Some(ReasonCode::ClientError));
        assert_eq!(results[2].result.reason_code(), Some(ReasonCode::NotConfigured));

        // The failure is terminal for this run: no retry on re-execution
        let again = executor.execute(&plan, &config).await;
        assert_eq!(again[0].origin, ResultOrigin::AlreadyRecorded);
        assert_eq!(fakes.ticket.calls.load(Ordering::SeqCst), 1);

        let key = LedgerKey::new("inc-42", "run-1", plan.actions[0].action_id().clone());
        assert_eq!(store.attempts(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let fakes = Fakes::with(FakeClient::hanging(), FakeClient::default(), FakeClient::default());
        let executor = ActionsExecutor::new(Arc::new(InMemoryStore::new()), fakes.clients())
            .with_call_timeout(Duration::from_millis(50));
        let config = live(0.7);
        let plan = generate(&sample_packet(), &resolution(0.85, Provenance::TraceVerified), &config).unwrap();

        let results = executor.execute(&plan, &config).await;
        assert_eq!(results[0].result.status, ActionStatus::Failed);
        assert_eq!(results[0].result.reason_code(), Some(ReasonCode::Timeout));
        assert_eq!(results[1].result.status, ActionStatus::Success);
    }

    #[tokio::test]
    async fn test_concurrent_executors_agree_on_recorded_results() {
        let fakes = Fakes::new();
        let store = Arc::new(InMemoryStore::new());
        let config = live(0.7);
        let plan = Arc::new(generate(
            &sample_packet(),
            &resolution(0.85, Provenance::TraceVerified),
            &config,
        ).unwrap());
        let executor = Arc::new(ActionsExecutor::new(store.clone(), fakes.clients()));

        // Seed a winner for the ticket so the first writer is deterministic
        let ticket_key = LedgerKey::new("inc-42", "run-1", plan.actions[0].action_id().clone());
        let seeded = ActionResult::success(
            &plan.actions[0],
            BTreeMap::from([("issue_key".to_string(), "OPS-0".to_string())]),
            Utc::now(),
        );
        store.put_if_absent(&ticket_key, seeded.clone()).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let executor = executor.clone();
                let plan = plan.clone();
                let config = config.clone();
                tokio::spawn(async move { executor.execute(&plan, &config).await })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.push(handle.await.unwrap());
        }

        assert_eq!(fakes.ticket.calls.load(Ordering::SeqCst), 0);
        for results in &all {
            assert_eq!(results[0].result, seeded);
            assert_eq!(results[1].result, all[0][1].result);
            assert_eq!(results[2].result, all[0][2].result);
        }
    }
}
