//! The findings packet produced by the upstream analysis pipeline.
//!
//! Packets are read-only inputs: everything downstream (resolution, planning,
//! replay) is derived from them and nothing here mutates one.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;

/// Findings above this confidence must cite evidence.
pub const EVIDENCE_REQUIRED_ABOVE: f64 = 0.6;

/// Structured analysis output for one incident run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingsPacket {
    pub incident_id: String,
    #[serde(alias = "collector_run_id")]
    pub run_id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub suspected_owners: Vec<SuspectedOwner>,
    #[serde(default)]
    pub limits: Vec<String>,
    #[serde(default)]
    pub all_evidence_refs: Vec<EvidenceRef>,
}

fn default_environment() -> String {
    "dev".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub summary: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence_refs: Vec<EvidenceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Finding {
    /// Summary and notes joined, which is where stack traces show up.
    pub fn trace_text(&self) -> String {
        match &self.notes {
            Some(notes) => format!("{}\n{}", self.summary, notes),
            None => self.summary.clone(),
        }
    }
}

/// Pointer to a stored evidence blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub collector_type: String,
    #[serde(alias = "s3_bucket")]
    pub bucket: String,
    #[serde(alias = "s3_key")]
    pub key: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub byte_size: u64,
    /// Name of the cloud resource the evidence was collected from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspectedOwner {
    pub repo: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PacketError {
    #[error("packet is missing incident_id")]
    MissingIncidentId,
    #[error("packet is missing run_id")]
    MissingRunId,
    #[error("{what} has confidence {value} outside [0, 1]")]
    ConfidenceOutOfRange { what: String, value: f64 },
    #[error("finding '{finding_id}' has confidence {confidence} > 0.6 but cites no evidence")]
    UncitedFinding { finding_id: String, confidence: f64 },
}

fn lambda_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/aws/lambda/([\w-]+)").expect("valid lambda regex"))
}

fn state_machine_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"arn:aws:states:[^:]+:\d+:stateMachine:([\w-]+)")
            .expect("valid state machine regex")
    })
}

impl FindingsPacket {
    pub fn validate(&self) -> Result<(), PacketError> {
        if self.incident_id.trim().is_empty() {
            return Err(PacketError::MissingIncidentId);
        }
        if self.run_id.trim().is_empty() {
            return Err(PacketError::MissingRunId);
        }

        for finding in &self.findings {
            check_confidence(&format!("finding '{}'", finding.id), finding.confidence)?;
            if finding.confidence > EVIDENCE_REQUIRED_ABOVE && finding.evidence_refs.is_empty() {
                return Err(PacketError::UncitedFinding {
                    finding_id: finding.id.clone(),
                    confidence: finding.confidence,
                });
            }
        }
        for owner in &self.suspected_owners {
            check_confidence(&format!("suspected owner '{}'", owner.repo), owner.confidence)?;
        }
        Ok(())
    }

    /// Highest finding confidence, or 0 when there are no findings.
    pub fn max_finding_confidence(&self) -> f64 {
        self.findings
            .iter()
            .map(|f| f.confidence)
            .fold(0.0, f64::max)
    }

    /// Evidence references in citation order: each finding's references in
    /// finding order, then `all_evidence_refs`. Duplicates by (bucket, key)
    /// keep their first position.
    pub fn ordered_evidence_refs(&self) -> Vec<EvidenceRef> {
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        let mut ordered = Vec::new();
        let cited = self.findings.iter().flat_map(|f| f.evidence_refs.iter());
        for evidence in cited.chain(self.all_evidence_refs.iter()) {
            if seen.insert((evidence.bucket.as_str(), evidence.key.as_str())) {
                ordered.push(evidence.clone());
            }
        }
        ordered
    }

    /// Every resource name the packet refers to, in first-seen order.
    ///
    /// Sources: the service name, evidence `resource` fields, and Lambda
    /// functions, log groups and state machines mentioned in finding
    /// summaries and suspected-owner reasons.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names = NameSet::default();
        names.push(&self.service);

        let all_refs = self
            .findings
            .iter()
            .flat_map(|f| f.evidence_refs.iter())
            .chain(self.all_evidence_refs.iter());
        for evidence in all_refs {
            if let Some(resource) = &evidence.resource {
                names.push(resource);
            }
        }

        let texts = self
            .findings
            .iter()
            .map(|f| f.summary.as_str())
            .chain(
                self.suspected_owners
                    .iter()
                    .flat_map(|o| o.reasons.iter().map(String::as_str)),
            );
        for text in texts {
            for caps in lambda_regex().captures_iter(text) {
                names.push(&caps[1]);
                names.push(&format!("/aws/lambda/{}", &caps[1]));
            }
            for caps in state_machine_regex().captures_iter(text) {
                names.push(&caps[1]);
            }
        }

        names.into_vec()
    }
}

fn check_confidence(what: &str, value: f64) -> Result<(), PacketError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PacketError::ConfidenceOutOfRange {
            what: what.to_string(),
            value,
        })
    }
}

#[derive(Default)]
struct NameSet {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl NameSet {
    fn push(&mut self, name: &str) {
        let name = name.trim();
        if !name.is_empty() && self.seen.insert(name.to_string()) {
            self.ordered.push(name.to_string());
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}
