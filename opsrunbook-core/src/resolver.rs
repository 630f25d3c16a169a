//! Confidence-gated repository resolution.
//!
//! A fixed ladder: a curated mapping rule, then trace-driven verification
//! against candidate repositories, then the best suspected owner. The first
//! rung that yields a repository wins.

use crate::packet::FindingsPacket;
use crate::pattern::Glob;
use crate::trace::{extract_app_frames, TraceFrame, MAX_APP_FRAMES};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAPPING_RULE_CONFIDENCE: f64 = 0.95;
pub const TRACE_VERIFIED_CONFIDENCE: f64 = 0.85;
pub const HEURISTIC_CONFIDENCE: f64 = 0.5;

const MAX_PATHS_PER_CANDIDATE: usize = 2;
const MAX_PROBE_CALLS: usize = 4;

/// Deadline for a single path check.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which rung of the ladder produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    MappingRule,
    TraceVerified,
    Heuristic,
    Unresolved,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::MappingRule => "mapping_rule",
            Provenance::TraceVerified => "trace_verified",
            Provenance::Heuristic => "heuristic",
            Provenance::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub repo: Option<String>,
    pub confidence: f64,
    pub provenance: Provenance,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub trace_frames: Vec<TraceFrame>,
}

impl ResolutionResult {
    pub fn unresolved(reasons: Vec<String>, trace_frames: Vec<TraceFrame>) -> Self {
        Self {
            repo: None,
            confidence: 0.0,
            provenance: Provenance::Unresolved,
            reasons,
            trace_frames,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub pattern: Glob,
    pub repo: String,
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("failed to read mapping table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mapping table is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("mapping rule {index} is invalid: {reason}")]
    InvalidRule { index: usize, reason: String },
}

#[derive(Deserialize)]
struct MappingFile {
    #[serde(default)]
    rules: Vec<MappingRule>,
}

/// Ordered, operator-curated table of `pattern -> repo` rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    rules: Vec<MappingRule>,
}

impl MappingTable {
    pub fn new(rules: Vec<MappingRule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Parse `{"rules": [{"pattern": "...", "repo": "..."}]}`.
    pub fn from_json(json: &str) -> Result<Self, MappingError> {
        let file: MappingFile = serde_json::from_str(json)?;
        for (index, rule) in file.rules.iter().enumerate() {
            if rule.pattern.as_str().trim().is_empty() {
                return Err(MappingError::InvalidRule {
                    index,
                    reason: "empty pattern".to_string(),
                });
            }
            if rule.repo.trim().is_empty() {
                return Err(MappingError::InvalidRule {
                    index,
                    reason: "empty repo".to_string(),
                });
            }
        }
        Ok(Self::new(file.rules))
    }

    /// Load from disk. A missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self, MappingError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(MappingError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The most specific rule matching any of `names`, with the name it
    /// matched. Equal specificity keeps the earlier rule.
    pub fn best_match<'a>(&'a self, names: &'a [String]) -> Option<(&'a MappingRule, &'a str)> {
        let mut best: Option<(&MappingRule, &str)> = None;
        for rule in &self.rules {
            let Some(name) = names.iter().find(|n| rule.pattern.matches(n)) else {
                continue;
            };
            let better = match best {
                Some((current, _)) => rule.pattern.specificity() > current.pattern.specificity(),
                None => true,
            };
            if better {
                best = Some((rule, name.as_str()));
            }
        }
        best
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Transport(String),
    #[error("probe timed out")]
    Timeout,
    #[error("unexpected probe response: {0}")]
    Unexpected(String),
}

/// Checks whether a path exists in a repository.
#[async_trait]
pub trait PathProbe: Send + Sync {
    async fn path_exists(&self, repo: &str, path: &str) -> Result<bool, ProbeError>;
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    repo: String,
    confidence: f64,
}

#[derive(Clone)]
pub struct RepoResolver {
    mapping: Arc<MappingTable>,
    probe: Option<Arc<dyn PathProbe>>,
    probe_timeout: Duration,
    default_owner: Option<String>,
}

impl RepoResolver {
    pub fn new(mapping: Arc<MappingTable>) -> Self {
        Self {
            mapping,
            probe: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            default_owner: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn PathProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn with_default_owner(mut self, owner: impl Into<String>) -> Self {
        let owner = owner.into();
        self.default_owner = if owner.trim().is_empty() {
            None
        } else {
            Some(owner)
        };
        self
    }

    pub async fn resolve(&self, packet: &FindingsPacket) -> ResolutionResult {
        let frames = app_frames(packet);

        let names = packet.resource_names();
        if let Some((rule, name)) = self.mapping.best_match(&names) {
            debug!(
                "Incident {} run {}: mapping rule '{}' matched '{}'",
                packet.incident_id, packet.run_id, rule.pattern, name
            );
            return ResolutionResult {
                repo: Some(self.qualify(&rule.repo)),
                confidence: MAPPING_RULE_CONFIDENCE,
                provenance: Provenance::MappingRule,
                reasons: vec![format!(
                    "mapping rule: pattern '{}' matched resource '{}' -> {}",
                    rule.pattern, name, rule.repo
                )],
                trace_frames: frames,
            };
        }

        let candidates = self.candidates(packet);
        let mut reasons = Vec::new();

        if let Some(probe) = &self.probe {
            let paths: Vec<&str> = frames
                .iter()
                .map(|f| f.normalized_path.as_str())
                .filter(|p| !p.is_empty())
                .take(MAX_PATHS_PER_CANDIDATE)
                .collect();
            if let Some(verified) = self
                .verify(probe.as_ref(), packet, &candidates, &paths, &mut reasons)
                .await
            {
                reasons.push(verified.1);
                return ResolutionResult {
                    repo: Some(verified.0),
                    confidence: TRACE_VERIFIED_CONFIDENCE,
                    provenance: Provenance::TraceVerified,
                    reasons,
                    trace_frames: frames,
                };
            }
        }

        if let Some(best) = candidates.first() {
            reasons.push(format!(
                "heuristic: highest-confidence suspected owner {} ({})",
                best.repo, best.confidence
            ));
            return ResolutionResult {
                repo: Some(best.repo.clone()),
                confidence: HEURISTIC_CONFIDENCE,
                provenance: Provenance::Heuristic,
                reasons,
                trace_frames: frames,
            };
        }

        reasons.push("no repository could be determined".to_string());
        ResolutionResult::unresolved(reasons, frames)
    }

    /// Probe candidates in rank order within the call budget. Errors are
    /// treated as "no match" but noted in `reasons`.
    async fn verify(
        &self,
        probe: &dyn PathProbe,
        packet: &FindingsPacket,
        candidates: &[Candidate],
        paths: &[&str],
        reasons: &mut Vec<String>,
    ) -> Option<(String, String)> {
        let mut calls = 0;
        for candidate in candidates {
            for path in paths {
                if calls >= MAX_PROBE_CALLS {
                    return None;
                }
                calls += 1;
                let checked = tokio::time::timeout(
                    self.probe_timeout,
                    probe.path_exists(&candidate.repo, path),
                )
                .await
                .unwrap_or(Err(ProbeError::Timeout));
                match checked {
                    Ok(true) => {
                        return Some((
                            candidate.repo.clone(),
                            format!("verified: {} exists in {}", path, candidate.repo),
                        ));
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            "Incident {} run {}: probe of {}:{} failed: {}",
                            packet.incident_id, packet.run_id, candidate.repo, path, e
                        );
                        reasons.push(format!("probe error: {}:{}: {}", candidate.repo, path, e));
                    }
                }
            }
        }
        None
    }

    /// Suspected owners ranked by confidence (stable), qualified and deduplicated.
    fn candidates(&self, packet: &FindingsPacket) -> Vec<Candidate> {
        let mut owners: Vec<_> = packet
            .suspected_owners
            .iter()
            .filter(|o| !o.repo.trim().is_empty())
            .collect();
        owners.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut seen = HashSet::new();
        owners
            .into_iter()
            .filter_map(|owner| {
                let repo = self.qualify(owner.repo.trim());
                seen.insert(repo.clone()).then_some(Candidate {
                    repo,
                    confidence: owner.confidence,
                })
            })
            .collect()
    }

    fn qualify(&self, repo: &str) -> String {
        match &self.default_owner {
            Some(owner) if !repo.contains('/') => format!("{}/{}", owner, repo),
            _ => repo.to_string(),
        }
    }
}

/// Application frames across all findings, deduplicated and capped.
fn app_frames(packet: &FindingsPacket) -> Vec<TraceFrame> {
    let mut seen = HashSet::new();
    packet
        .findings
        .iter()
        .flat_map(|f| extract_app_frames(&f.trace_text()))
        .filter(|f| seen.insert((f.normalized_path.clone(), f.line)))
        .take(MAX_APP_FRAMES)
        .collect()
}
