use anyhow::{bail, Context, Result};
use opsrunbook_core::config::{DEFAULT_BOT_LOGIN_PATTERN, DEFAULT_CONFIDENCE_THRESHOLD};
use opsrunbook_core::AutomationConfig;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Values that count as "not set" when found in a secret variable.
const PLACEHOLDERS: [&str; 2] = ["REPLACE_ME", "placeholder"];

#[derive(Debug, Clone)]
pub struct JiraConfig {
    pub base_url: String,
    pub email: String,
    pub api_token: String,
    pub project_key: String,
    pub issue_type: String,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub api_url: String,
    pub owner: String,
    pub token: String,
}

#[derive(Clone)]
pub struct Config {
    pub webhook_secret: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub automation: AutomationConfig,
    pub repo_mapping_path: Option<PathBuf>,
    /// Owner used to qualify bare repository names from mapping rules and
    /// suspected owners.
    pub github_owner: Option<String>,
    /// Present only when both an owner and a token are configured.
    pub github: Option<GitHubConfig>,
    pub jira: Option<JiraConfig>,
    pub teams_webhook_url: Option<String>,
    pub action_timeout: Duration,
    /// Where accepted review events are POSTed. When unset, dispatches are
    /// only logged.
    pub review_cycle_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup, so tests need not touch
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let webhook_secret = parse_secret(lookup("WEBHOOK_SECRET"))
            .context("WEBHOOK_SECRET environment variable is required")?;

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let confidence_threshold = match lookup("PR_CONFIDENCE_THRESHOLD") {
            Some(raw) => parse_threshold(&raw)?,
            None => DEFAULT_CONFIDENCE_THRESHOLD,
        };

        let automation = AutomationConfig {
            automation_enabled: parse_flag(lookup("AUTOMATION_ENABLED"), true),
            dry_run: parse_flag(lookup("ACTIONS_DRY_RUN"), true),
            pull_request_enabled: parse_flag(lookup("ENABLE_GITHUB_PR_ACTION"), false),
            confidence_threshold,
            bot_login_pattern: lookup("BOT_LOGIN_PATTERN")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BOT_LOGIN_PATTERN.to_string()),
        };

        let github_owner = parse_secret(lookup("GITHUB_OWNER"));
        let github = match (github_owner.clone(), parse_secret(lookup("GITHUB_TOKEN"))) {
            (Some(owner), Some(token)) => Some(GitHubConfig {
                api_url: lookup("GITHUB_API_URL")
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "https://api.github.com".to_string()),
                owner,
                token,
            }),
            _ => None,
        };

        let jira = match (
            parse_secret(lookup("JIRA_BASE_URL")),
            parse_secret(lookup("JIRA_EMAIL")),
            parse_secret(lookup("JIRA_API_TOKEN")),
            parse_secret(lookup("JIRA_PROJECT_KEY")),
        ) {
            (Some(base_url), Some(email), Some(api_token), Some(project_key)) => Some(JiraConfig {
                base_url,
                email,
                api_token,
                project_key,
                issue_type: lookup("JIRA_ISSUE_TYPE")
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| "Bug".to_string()),
            }),
            _ => None,
        };

        let action_timeout_secs = lookup("ACTION_TIMEOUT_SECS")
            .unwrap_or_else(|| "10".to_string())
            .parse::<u64>()
            .context("ACTION_TIMEOUT_SECS must be a whole number of seconds")?;
        if action_timeout_secs == 0 {
            bail!("ACTION_TIMEOUT_SECS must be greater than zero");
        }

        Ok(Config {
            webhook_secret,
            port,
            state_dir,
            automation,
            repo_mapping_path: lookup("REPO_MAPPING_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            github_owner,
            github,
            jira,
            teams_webhook_url: parse_secret(lookup("TEAMS_WEBHOOK_URL")),
            action_timeout: Duration::from_secs(action_timeout_secs),
            review_cycle_url: parse_secret(lookup("REVIEW_CYCLE_URL")),
        })
    }
}

/// `true`, `1` and `yes` (any case) are on; any other value is off.
pub fn parse_flag(value: Option<String>, default: bool) -> bool {
    match value {
        None => default,
        Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
    }
}

/// Returns None if the value is missing, blank, or a known placeholder.
pub fn parse_secret(value: Option<String>) -> Option<String> {
    value.filter(|s| {
        let trimmed = s.trim();
        !trimmed.is_empty() && !PLACEHOLDERS.iter().any(|p| trimmed.eq_ignore_ascii_case(p))
    })
}

pub fn parse_threshold(raw: &str) -> Result<f64> {
    let value = raw
        .trim()
        .parse::<f64>()
        .context("PR_CONFIDENCE_THRESHOLD must be a number")?;
    if !(0.0..=1.0).contains(&value) {
        bail!("PR_CONFIDENCE_THRESHOLD must be between 0 and 1, got {}", value);
    }
    Ok(value)
}
