use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_BOT_LOGIN_PATTERN: &str = "opsrunbook-copilot-bot,*[bot]";

/// Automation switches passed by value into every planning and execution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Kill switch: when false every action is skipped without touching the ledger.
    pub automation_enabled: bool,
    pub dry_run: bool,
    pub pull_request_enabled: bool,
    pub confidence_threshold: f64,
    pub bot_login_pattern: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            automation_enabled: true,
            dry_run: true,
            pull_request_enabled: false,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            bot_login_pattern: DEFAULT_BOT_LOGIN_PATTERN.to_string(),
        }
    }
}
