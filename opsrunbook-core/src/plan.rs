//! Deterministic action plan generation.
//!
//! `generate` is pure: the same packet, resolution and configuration always
//! produce a byte-identical plan, which is what makes replay meaningful.
//! Nothing here reads the clock or the environment.

use crate::action::{
    Action, ActionId, ActionType, ChatAction, Priority, PullRequestAction, TicketAction,
    PLAN_VERSION,
};
use crate::config::AutomationConfig;
use crate::packet::{EvidenceRef, FindingsPacket};
use crate::resolver::ResolutionResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use thiserror::Error;

/// Findings at or above this confidence raise the ticket to P1.
pub const HIGH_PRIORITY_CONFIDENCE: f64 = 0.8;

pub const TICKET_LABELS: [&str; 2] = ["opsrunbook", "auto-generated"];

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to serialize actions for the plan fingerprint: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub incident_id: String,
    pub run_id: String,
    pub plan_version: String,
    pub resolution: ResolutionResult,
    pub actions: Vec<Action>,
    pub fingerprint: String,
}

impl ActionPlan {
    pub fn action(&self, action_type: ActionType) -> Option<&Action> {
        self.actions.iter().find(|a| a.action_type() == action_type)
    }
}

pub fn generate(
    packet: &FindingsPacket,
    resolution: &ResolutionResult,
    config: &AutomationConfig,
) -> Result<ActionPlan, PlanError> {
    let evidence = packet.ordered_evidence_refs();

    let mut actions = vec![
        Action::CreateTicket(ticket_action(packet, &evidence)),
        Action::NotifyChat(chat_action(packet, &evidence)),
    ];
    if config.pull_request_enabled {
        actions.push(Action::CreatePullRequest(pull_request_action(
            packet,
            resolution,
            &evidence,
            config.confidence_threshold,
        )));
    }

    let fingerprint = fingerprint(&actions)?;
    Ok(ActionPlan {
        incident_id: packet.incident_id.clone(),
        run_id: packet.run_id.clone(),
        plan_version: PLAN_VERSION.to_string(),
        resolution: resolution.clone(),
        actions,
        fingerprint,
    })
}

/// Hex SHA-256 over the canonical JSON of the ordered action list.
pub fn fingerprint(actions: &[Action]) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    serde_json::to_writer(&mut hasher, actions)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Git ref component: anything outside `[A-Za-z0-9_-]` becomes `-`. When that
/// changes the value, the first 8 hex digits of its SHA-256 are appended so
/// that ids like `a/b` and `a-b` stay on different branches.
fn ref_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    let base = if trimmed.is_empty() { "unknown" } else { trimmed };
    if base == value {
        return base.to_string();
    }
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    format!("{}-{}", base, &digest[..8])
}

pub fn branch_name(incident_id: &str, run_id: &str) -> String {
    format!("opsrunbook/{}/{}", ref_component(incident_id), ref_component(run_id))
}

pub fn pull_request_title(incident_id: &str, run_id: &str) -> String {
    format!("opsrunbook: incident {} analysis (run {})", incident_id, run_id)
}

pub fn notes_path(incident_id: &str) -> String {
    format!(".opsrunbook/pr-notes/{}.md", ref_component(incident_id))
}

fn ticket_action(packet: &FindingsPacket, evidence: &[EvidenceRef]) -> TicketAction {
    let priority = if packet.max_finding_confidence() >= HIGH_PRIORITY_CONFIDENCE {
        Priority::P1
    } else {
        Priority::P2
    };
    TicketAction {
        action_id: ActionId::derive(&packet.incident_id, ActionType::CreateTicket, PLAN_VERSION),
        incident_id: packet.incident_id.clone(),
        title: format!(
            "[{}] {}: incident {}",
            packet.environment, packet.service, packet.incident_id
        ),
        priority,
        labels: TICKET_LABELS.iter().map(|l| l.to_string()).collect(),
        body: render_ticket_body(packet, evidence),
        evidence_refs: evidence.to_vec(),
    }
}

fn chat_action(packet: &FindingsPacket, evidence: &[EvidenceRef]) -> ChatAction {
    ChatAction {
        action_id: ActionId::derive(&packet.incident_id, ActionType::NotifyChat, PLAN_VERSION),
        incident_id: packet.incident_id.clone(),
        title: format!(
            "Incident {} on {} ({})",
            packet.incident_id, packet.service, packet.environment
        ),
        body: render_chat_body(packet, evidence),
        evidence_refs: evidence.to_vec(),
    }
}

fn pull_request_action(
    packet: &FindingsPacket,
    resolution: &ResolutionResult,
    evidence: &[EvidenceRef],
    confidence_threshold: f64,
) -> PullRequestAction {
    PullRequestAction {
        action_id: ActionId::derive(
            &packet.incident_id,
            ActionType::CreatePullRequest,
            PLAN_VERSION,
        ),
        incident_id: packet.incident_id.clone(),
        run_id: packet.run_id.clone(),
        repo: resolution.repo.clone(),
        branch: branch_name(&packet.incident_id, &packet.run_id),
        title: pull_request_title(&packet.incident_id, &packet.run_id),
        body: render_pull_request_body(packet, resolution, evidence),
        notes_path: notes_path(&packet.incident_id),
        notes_content: render_notes(packet, resolution, evidence),
        commit_message: format!(
            "Add incident analysis notes for {} (run {})",
            packet.incident_id, packet.run_id
        ),
        evidence_refs: evidence.to_vec(),
        resolution: resolution.clone(),
        confidence_threshold,
    }
}

// Rendering. `write!` into a String cannot fail, so results are discarded.

fn render_findings(out: &mut String, packet: &FindingsPacket) {
    if packet.findings.is_empty() {
        let _ = writeln!(out, "No findings were produced.");
        return;
    }
    for finding in &packet.findings {
        let _ = writeln!(
            out,
            "- [{}] {} ({} evidence ref(s))",
            finding.confidence,
            finding.summary,
            finding.evidence_refs.len()
        );
    }
}

fn render_evidence(out: &mut String, evidence: &[EvidenceRef]) {
    for e in evidence {
        let _ = writeln!(out, "- {}: s3://{}/{}", e.collector_type, e.bucket, e.key);
    }
}

fn render_limits(out: &mut String, packet: &FindingsPacket) {
    if packet.limits.is_empty() {
        return;
    }
    let _ = writeln!(out, "\nLimits:");
    for limit in &packet.limits {
        let _ = writeln!(out, "- {}", limit);
    }
}

fn render_ticket_body(packet: &FindingsPacket, evidence: &[EvidenceRef]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Incident: {}", packet.incident_id);
    let _ = writeln!(out, "Run: {}", packet.run_id);
    let _ = writeln!(out, "Service: {}", packet.service);
    let _ = writeln!(out, "Environment: {}", packet.environment);
    let _ = writeln!(out, "\nFindings:");
    render_findings(&mut out, packet);
    if !packet.suspected_owners.is_empty() {
        let _ = writeln!(out, "\nSuspected owners:");
        for owner in &packet.suspected_owners {
            let _ = writeln!(out, "- {} ({})", owner.repo, owner.confidence);
        }
    }
    render_limits(&mut out, packet);
    let _ = writeln!(out, "\nEvidence:");
    render_evidence(&mut out, evidence);
    out
}

fn render_chat_body(packet: &FindingsPacket, evidence: &[EvidenceRef]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Incident {} on {} ({}), run {}",
        packet.incident_id, packet.service, packet.environment, packet.run_id
    );
    match packet.findings.first() {
        Some(top) => {
            let _ = writeln!(out, "Top finding [{}]: {}", top.confidence, top.summary);
        }
        None => {
            let _ = writeln!(out, "No findings were produced.");
        }
    }
    let _ = writeln!(
        out,
        "{} finding(s), {} evidence object(s)",
        packet.findings.len(),
        evidence.len()
    );
    out
}

fn render_resolution(out: &mut String, resolution: &ResolutionResult) {
    let _ = writeln!(out, "### Repo Resolution\n");
    let _ = writeln!(
        out,
        "- **Repo**: `{}`",
        resolution.repo.as_deref().unwrap_or("none")
    );
    let _ = writeln!(out, "- **Confidence**: {}", resolution.confidence);
    let _ = writeln!(out, "- **Provenance**: {}", resolution.provenance);
    for reason in &resolution.reasons {
        let _ = writeln!(out, "- {}", reason);
    }
    if !resolution.trace_frames.is_empty() {
        let _ = writeln!(
            out,
            "- **Trace frames**: {} app frame(s)",
            resolution.trace_frames.len()
        );
        for frame in &resolution.trace_frames {
            let line = frame.line.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string());
            let _ = writeln!(out, "  - `{}:{}`", frame.normalized_path, line);
        }
    }
}

fn render_pull_request_body(
    packet: &FindingsPacket,
    resolution: &ResolutionResult,
    evidence: &[EvidenceRef],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Incident `{}`\n", packet.incident_id);
    let _ = writeln!(out, "| Field | Value |");
    let _ = writeln!(out, "|-------|-------|");
    let _ = writeln!(out, "| **Service** | {} |", packet.service);
    let _ = writeln!(out, "| **Environment** | {} |", packet.environment);
    let _ = writeln!(out, "| **Run** | {} |", packet.run_id);
    let _ = writeln!(
        out,
        "| **Repo Confidence** | {} ({}) |\n",
        resolution.confidence, resolution.provenance
    );
    let _ = writeln!(out, "### {} Finding(s)\n", packet.findings.len());
    render_findings(&mut out, packet);
    let _ = writeln!(out, "\n### Evidence\n");
    render_evidence(&mut out, evidence);
    out.push('\n');
    render_resolution(&mut out, resolution);
    let _ = writeln!(out, "\n---");
    let _ = writeln!(
        out,
        "*Generated by opsrunbook. Human review required before merge.*"
    );
    out
}

fn render_notes(
    packet: &FindingsPacket,
    resolution: &ResolutionResult,
    evidence: &[EvidenceRef],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Incident {} analysis notes\n", packet.incident_id);
    let _ = writeln!(out, "Run `{}`, service `{}` ({}).\n", packet.run_id, packet.service, packet.environment);
    let _ = writeln!(out, "## Findings\n");
    render_findings(&mut out, packet);
    render_limits(&mut out, packet);
    let _ = writeln!(out, "\n## Evidence\n");
    render_evidence(&mut out, evidence);
    out.push('\n');
    render_resolution(&mut out, resolution);
    out
}
