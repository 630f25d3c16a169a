use anyhow::{Context, Result};
use opsrunbook_core::{
    ActionClients, ActionsExecutor, BotIdentity, ChatClient, IncidentRunner, MappingTable,
    PathProbe, PullRequestClient, RepoResolver, ReplayHarness, ReviewCycleController,
    TicketClient, WebhookIngestor,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use opsrunbook_server::clients::{GitHubClient, JiraClient, TeamsNotifier, Unconfigured};
use opsrunbook_server::config::Config;
use opsrunbook_server::dispatch::HttpReviewTrigger;
use opsrunbook_server::repository::SqliteRepository;
use opsrunbook_server::{app, get_service_version, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting opsrunbook {}", get_service_version());

    let config = Config::from_env().context("Failed to load configuration from environment")?;
    info!(
        "Automation enabled: {}, dry run: {}, PR action: {} (threshold {})",
        config.automation.automation_enabled,
        config.automation.dry_run,
        config.automation.pull_request_enabled,
        config.automation.confidence_threshold
    );

    let mapping = match &config.repo_mapping_path {
        Some(path) => {
            let table = MappingTable::load(path)
                .with_context(|| format!("Failed to load repo mapping {}", path.display()))?;
            info!("Loaded {} repo mapping rule(s) from {}", table.len(), path.display());
            table
        }
        None => {
            warn!("REPO_MAPPING_PATH not set; resolving from traces and owners only");
            MappingTable::default()
        }
    };

    let db_path = config.state_dir.join("opsrunbook-state.db");
    info!("Using state database: {}", db_path.display());
    let repo = Arc::new(
        SqliteRepository::new(&db_path)
            .with_context(|| format!("Failed to open state database {}", db_path.display()))?,
    );

    let github = config
        .github
        .as_ref()
        .map(|gh| Arc::new(GitHubClient::new(gh, config.action_timeout)));

    let ticket: Arc<dyn TicketClient> = match &config.jira {
        Some(jira) => Arc::new(JiraClient::new(jira, config.action_timeout)),
        None => {
            warn!("Jira credentials not set; ticket actions will be skipped unless dry run");
            Arc::new(Unconfigured::new("Jira"))
        }
    };
    let chat: Arc<dyn ChatClient> = match &config.teams_webhook_url {
        Some(url) => Arc::new(TeamsNotifier::new(url.clone(), config.action_timeout)),
        None => {
            warn!("TEAMS_WEBHOOK_URL not set; chat actions will be skipped unless dry run");
            Arc::new(Unconfigured::new("Teams"))
        }
    };
    let pull_request: Arc<dyn PullRequestClient> = match &github {
        Some(client) => client.clone() as Arc<dyn PullRequestClient>,
        None => Arc::new(Unconfigured::new("GitHub")),
    };

    let mut resolver = RepoResolver::new(Arc::new(mapping));
    if let Some(client) = &github {
        let probe: Arc<dyn PathProbe> = client.clone();
        resolver = resolver
            .with_probe(probe)
            .with_probe_timeout(config.action_timeout);
    }
    if let Some(owner) = &config.github_owner {
        resolver = resolver.with_default_owner(owner.clone());
    }

    let executor = ActionsExecutor::new(
        repo.clone(),
        ActionClients {
            ticket,
            chat,
            pull_request,
        },
    )
    .with_call_timeout(config.action_timeout);

    let state = Arc::new(AppState {
        ingestor: WebhookIngestor::new(
            config.webhook_secret.clone(),
            repo.clone(),
            BotIdentity::parse(&config.automation.bot_login_pattern),
        ),
        review_cycle: ReviewCycleController::new(
            repo.clone(),
            Arc::new(HttpReviewTrigger::new(
                config.review_cycle_url.clone(),
                config.action_timeout,
            )),
        ),
        runner: IncidentRunner::new(resolver.clone(), executor, repo.clone(), repo.clone()),
        replay: ReplayHarness::new(resolver, repo.clone(), repo.clone()),
        plans: repo.clone(),
        ledger: repo,
        automation: config.automation.clone(),
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
