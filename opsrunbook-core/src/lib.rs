pub mod action;
pub mod command;
pub mod config;
pub mod executor;
pub mod ledger;
pub mod memory;
pub mod packet;
pub mod pattern;
pub mod plan;
pub mod replay;
pub mod resolver;
pub mod review_state;
pub mod runner;
pub mod store;
pub mod trace;
pub mod webhook;

pub use action::{
    Action, ActionId, ActionReason, ActionResult, ActionStatus, ActionType, ReasonCode,
    PLAN_VERSION,
};
pub use command::{parse_comment, parse_command, ParseResult, ReviewCommand};
pub use config::AutomationConfig;
pub use executor::{
    ActionClients, ActionsExecutor, ChatClient, ClientError, ExecutedAction, ExternalRefs,
    PullRequestClient, ResultOrigin, TicketClient,
};
pub use ledger::{IdempotencyLedger, LedgerError, LedgerKey, PutOutcome};
pub use memory::InMemoryStore;
pub use packet::{EvidenceRef, Finding, FindingsPacket, PacketError, SuspectedOwner};
pub use plan::{generate, ActionPlan, PlanError};
pub use replay::{diff_plans, FieldDiff, ReplayError, ReplayHarness, ReplayReport};
pub use resolver::{
    MappingError, MappingRule, MappingTable, PathProbe, ProbeError, Provenance, RepoResolver,
    ResolutionResult,
};
pub use review_state::{
    PrReviewState, PullRequestId, ReviewCycleController, ReviewCycleTrigger, ReviewDecision,
    ReviewStateStore, ReviewStatus, Transition,
};
pub use runner::{IncidentRunner, RunError, RunReport};
pub use store::{PacketStore, PlanStore, StoreError};
pub use webhook::{
    verify_signature, BotIdentity, DeliveryClaim, DeliveryRecord, DeliveryStore, IngestOutcome,
    ReviewEvent, WebhookIngestor,
};
