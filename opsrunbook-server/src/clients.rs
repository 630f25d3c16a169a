//! HTTP implementations of the executor's client traits and the resolver's
//! path probe.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use opsrunbook_core::action::{ChatAction, Priority, PullRequestAction, TicketAction};
use opsrunbook_core::{
    ChatClient, ClientError, ExternalRefs, PathProbe, ProbeError, PullRequestClient,
    TicketClient,
};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{GitHubConfig, JiraConfig};

const USER_AGENT: &str = "opsrunbook";
const MAX_SUMMARY_CHARS: usize = 255;
const MAX_DESCRIPTION_CHARS: usize = 30_000;
const MAX_LABELS: usize = 10;
const MAX_CARD_TEXT_CHARS: usize = 4_000;
const MAX_ERROR_BODY_CHARS: usize = 500;

pub fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|e| {
            warn!("Failed to build HTTP client ({}); using defaults", e);
            Client::new()
        })
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Pass successful responses through; turn anything else into `Status`.
async fn check(response: Response, context: &str) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    error!("{} failed: {} - {}", context, status, truncate(&body, 200));
    Err(ClientError::Status {
        status: status.as_u16(),
        body: truncate(&body, MAX_ERROR_BODY_CHARS),
    })
}

fn request_error(e: reqwest::Error) -> ClientError {
    ClientError::Request(e.to_string())
}

/// Stand-in for a client whose credentials are not configured.
pub struct Unconfigured {
    what: &'static str,
}

impl Unconfigured {
    pub fn new(what: &'static str) -> Self {
        Self { what }
    }

    fn error(&self) -> ClientError {
        ClientError::NotConfigured(format!("{} credentials are not set", self.what))
    }
}

#[async_trait]
impl TicketClient for Unconfigured {
    async fn create_ticket(&self, _action: &TicketAction) -> Result<ExternalRefs, ClientError> {
        Err(self.error())
    }
}

#[async_trait]
impl ChatClient for Unconfigured {
    async fn notify(&self, _action: &ChatAction) -> Result<ExternalRefs, ClientError> {
        Err(self.error())
    }
}

#[async_trait]
impl PullRequestClient for Unconfigured {
    async fn create_or_update(
        &self,
        _repo: &str,
        _action: &PullRequestAction,
    ) -> Result<ExternalRefs, ClientError> {
        Err(self.error())
    }
}

// ---------------------------------------------------------------------------
// Jira
// ---------------------------------------------------------------------------

pub struct JiraClient {
    client: Client,
    base_url: String,
    auth: String,
    project_key: String,
    issue_type: String,
}

#[derive(Debug, Deserialize)]
struct CreatedIssue {
    id: String,
    key: String,
}

fn jira_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::P1 => "High",
        Priority::P2 => "Medium",
    }
}

impl JiraClient {
    pub fn new(config: &JiraConfig, timeout: Duration) -> Self {
        let credentials = format!("{}:{}", config.email, config.api_token);
        Self {
            client: http_client(timeout),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: general_purpose::STANDARD.encode(credentials),
            project_key: config.project_key.clone(),
            issue_type: config.issue_type.clone(),
        }
    }

    fn issue_payload(&self, action: &TicketAction) -> Value {
        let mut fields = json!({
            "project": {"key": self.project_key},
            "issuetype": {"name": self.issue_type},
            "summary": truncate(&action.title, MAX_SUMMARY_CHARS),
            "description": truncate(&action.body, MAX_DESCRIPTION_CHARS),
            "priority": {"name": jira_priority(action.priority)},
        });
        if !action.labels.is_empty() {
            let labels: Vec<&String> = action.labels.iter().take(MAX_LABELS).collect();
            fields["labels"] = json!(labels);
        }
        json!({ "fields": fields })
    }
}

#[async_trait]
impl TicketClient for JiraClient {
    async fn create_ticket(&self, action: &TicketAction) -> Result<ExternalRefs, ClientError> {
        let url = format!("{}/rest/api/2/issue", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Basic {}", self.auth))
            .header("Accept", "application/json")
            .json(&self.issue_payload(action))
            .send()
            .await
            .map_err(request_error)?;

        let created: CreatedIssue = check(response, "Jira create issue")
            .await?
            .json()
            .await
            .map_err(request_error)?;
        info!(
            "Created Jira issue {} for incident {}",
            created.key, action.incident_id
        );

        Ok(ExternalRefs::from([
            ("issue_key".to_string(), created.key.clone()),
            ("issue_id".to_string(), created.id),
            (
                "url".to_string(),
                format!("{}/browse/{}", self.base_url, created.key),
            ),
        ]))
    }
}

// ---------------------------------------------------------------------------
// Teams
// ---------------------------------------------------------------------------

pub struct TeamsNotifier {
    client: Client,
    webhook_url: String,
}

impl TeamsNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            webhook_url: webhook_url.into(),
        }
    }
}

fn message_card(action: &ChatAction) -> Value {
    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "themeColor": "d63384",
        "summary": truncate(&action.title, 200),
        "sections": [{
            "activityTitle": action.title,
            "text": truncate(&action.body, MAX_CARD_TEXT_CHARS),
            "markdown": true,
        }],
    })
}

#[async_trait]
impl ChatClient for TeamsNotifier {
    async fn notify(&self, action: &ChatAction) -> Result<ExternalRefs, ClientError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&message_card(action))
            .send()
            .await
            .map_err(request_error)?;

        let response = check(response, "Teams notification").await?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        info!("Posted Teams notification for incident {}", action.incident_id);

        Ok(ExternalRefs::from([
            ("status_code".to_string(), status.to_string()),
            ("response".to_string(), truncate(&text, 200)),
        ]))
    }
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    client: Client,
    api_url: String,
    owner: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentWriteResponse {
    commit: CommitInfo,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    html_url: String,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig, timeout: Duration) -> Self {
        Self {
            client: http_client(timeout),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            token: config.token.clone(),
        }
    }

    /// `owner/name`, or a bare name under the configured owner.
    fn split_repo<'a>(&'a self, repo: &'a str) -> (&'a str, &'a str) {
        match repo.split_once('/') {
            Some((owner, name)) => (owner, name),
            None => (self.owner.as_str(), repo),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, context: &str) -> Result<T, ClientError> {
        let response = self
            .request(Method::GET, path)
            .send()
            .await
            .map_err(request_error)?;
        check(response, context).await?.json().await.map_err(request_error)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
        context: &str,
    ) -> Result<T, ClientError> {
        let response = self
            .request(method, path)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        check(response, context).await?.json().await.map_err(request_error)
    }

    async fn default_branch(&self, owner: &str, name: &str) -> String {
        match self
            .get_json::<RepoResponse>(&format!("/repos/{}/{}", owner, name), "GitHub get repository")
            .await
        {
            Ok(RepoResponse {
                default_branch: Some(branch),
            }) => branch,
            Ok(_) => "main".to_string(),
            Err(e) => {
                warn!(
                    "Could not read default branch of {}/{} ({}); assuming main",
                    owner, name, e
                );
                "main".to_string()
            }
        }
    }

    /// Returns true when the branch was created, false when it already existed.
    async fn create_branch(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
        sha: &str,
    ) -> Result<bool, ClientError> {
        let response = self
            .request(Method::POST, &format!("/repos/{}/{}/git/refs", owner, name))
            .json(&json!({"ref": format!("refs/heads/{}", branch), "sha": sha}))
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(false);
        }
        check(response, "GitHub create branch").await?;
        Ok(true)
    }

    async fn existing_file_sha(&self, owner: &str, name: &str, path: &str, branch: &str) -> Option<String> {
        self.get_json::<ContentResponse>(
            &format!("/repos/{}/{}/contents/{}?ref={}", owner, name, path, branch),
            "GitHub get file",
        )
        .await
        .ok()
        .map(|c| c.sha)
    }

    async fn find_open_pull(&self, owner: &str, name: &str, branch: &str) -> Option<PullResponse> {
        self.get_json::<Vec<PullResponse>>(
            &format!(
                "/repos/{}/{}/pulls?head={}:{}&state=open",
                owner, name, owner, branch
            ),
            "GitHub list pulls",
        )
        .await
        .ok()
        .and_then(|pulls| pulls.into_iter().next())
    }
}

#[async_trait]
impl PathProbe for GitHubClient {
    async fn path_exists(&self, repo: &str, path: &str) -> Result<bool, ProbeError> {
        let (owner, name) = self.split_repo(repo);
        let branch = self.default_branch(owner, name).await;

        let response = self
            .request(
                Method::GET,
                &format!("/repos/{}/{}/contents/{}?ref={}", owner, name, path, branch),
            )
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout
                } else {
                    ProbeError::Transport(e.to_string())
                }
            })?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(ProbeError::Unexpected(format!(
                "{} for {}:{}",
                other, repo, path
            ))),
        }
    }
}

#[async_trait]
impl PullRequestClient for GitHubClient {
    async fn create_or_update(
        &self,
        repo: &str,
        action: &PullRequestAction,
    ) -> Result<ExternalRefs, ClientError> {
        let (owner, name) = self.split_repo(repo);
        let default_branch = self.default_branch(owner, name).await;

        let base: RefResponse = self
            .get_json(
                &format!("/repos/{}/{}/git/ref/heads/{}", owner, name, default_branch),
                "GitHub get base ref",
            )
            .await?;
        let created = self
            .create_branch(owner, name, &action.branch, &base.object.sha)
            .await?;

        let mut file = json!({
            "message": action.commit_message,
            "content": general_purpose::STANDARD.encode(&action.notes_content),
            "branch": action.branch,
        });
        if !created {
            if let Some(sha) = self
                .existing_file_sha(owner, name, &action.notes_path, &action.branch)
                .await
            {
                file["sha"] = json!(sha);
            }
        }
        let written: ContentWriteResponse = self
            .send_json(
                Method::PUT,
                &format!("/repos/{}/{}/contents/{}", owner, name, action.notes_path),
                &file,
                "GitHub write notes",
            )
            .await?;

        let mut refs = ExternalRefs::from([
            ("github_repo".to_string(), format!("{}/{}", owner, name)),
            ("branch".to_string(), action.branch.clone()),
            ("default_branch".to_string(), default_branch.clone()),
            ("commit_sha".to_string(), written.commit.sha),
        ]);

        let existing = if created {
            None
        } else {
            self.find_open_pull(owner, name, &action.branch).await
        };
        let pull = match existing {
            Some(pull) => {
                refs.insert("reused_pr".to_string(), "true".to_string());
                pull
            }
            None => {
                self.send_json(
                    Method::POST,
                    &format!("/repos/{}/{}/pulls", owner, name),
                    &json!({
                        "title": action.title,
                        "body": action.body,
                        "head": action.branch,
                        "base": default_branch,
                    }),
                    "GitHub create pull request",
                )
                .await?
            }
        };
        info!(
            "Pull request {} for incident {} run {}",
            pull.html_url, action.incident_id, action.run_id
        );

        refs.insert("pr_url".to_string(), pull.html_url);
        refs.insert("pr_number".to_string(), pull.number.to_string());
        Ok(refs)
    }
}
