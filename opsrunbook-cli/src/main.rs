use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use opsrunbook_core::config::DEFAULT_CONFIDENCE_THRESHOLD;
use opsrunbook_core::{
    generate, verify_signature, ActionPlan, AutomationConfig, FindingsPacket, InMemoryStore,
    MappingTable, PacketStore, PlanStore, RepoResolver, ReplayHarness,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// opsrunbook: offline tooling for incident action plans
#[derive(Parser, Debug)]
#[command(name = "opsrunbook")]
#[command(about = "Resolve, plan and diff incident runs without touching external systems", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the repository for a findings packet
    Resolve(ResolveArgs),
    /// Print the action plan a findings packet would produce
    Plan(PlanArgs),
    /// Regenerate a plan and compare it with a stored one
    Diff(DiffArgs),
    /// Check a webhook payload against its X-Hub-Signature-256 header value
    VerifySignature(VerifyArgs),
}

#[derive(Args, Debug)]
struct ResolveArgs {
    /// Findings packet JSON file
    #[arg(long)]
    packet: PathBuf,

    /// Repo mapping table JSON file
    #[arg(long)]
    mapping: Option<PathBuf>,

    /// Owner used to qualify bare repository names
    #[arg(long)]
    owner: Option<String>,
}

#[derive(Args, Debug)]
struct PlanningArgs {
    /// Include the pull request action
    #[arg(long)]
    enable_pr: bool,

    /// Minimum resolution confidence for the pull request action
    #[arg(long, default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
    threshold: f64,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[command(flatten)]
    resolve: ResolveArgs,

    #[command(flatten)]
    planning: PlanningArgs,
}

#[derive(Args, Debug)]
struct DiffArgs {
    /// Stored action plan JSON file
    #[arg(long)]
    stored: PathBuf,

    #[command(flatten)]
    resolve: ResolveArgs,

    #[command(flatten)]
    planning: PlanningArgs,
}

#[derive(Args, Debug)]
struct VerifyArgs {
    /// Raw payload file, exactly as delivered
    #[arg(long)]
    payload: PathBuf,

    /// Signature header value, e.g. sha256=...
    #[arg(long)]
    signature: String,

    /// Environment variable holding the webhook secret
    #[arg(long, default_value = "WEBHOOK_SECRET")]
    secret_env: String,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {} {}", what, path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {} {}", what, path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn load_packet(path: &Path) -> Result<FindingsPacket> {
    let packet: FindingsPacket = read_json(path, "findings packet")?;
    packet
        .validate()
        .with_context(|| format!("Invalid findings packet {}", path.display()))?;
    Ok(packet)
}

fn build_resolver(args: &ResolveArgs) -> Result<RepoResolver> {
    let mapping = match &args.mapping {
        Some(path) => MappingTable::load(path)
            .with_context(|| format!("Failed to load repo mapping {}", path.display()))?,
        None => MappingTable::default(),
    };
    let mut resolver = RepoResolver::new(Arc::new(mapping));
    if let Some(owner) = &args.owner {
        resolver = resolver.with_default_owner(owner.clone());
    }
    Ok(resolver)
}

fn automation_config(args: &PlanningArgs) -> Result<AutomationConfig> {
    if !(0.0..=1.0).contains(&args.threshold) {
        bail!("--threshold must be between 0 and 1, got {}", args.threshold);
    }
    Ok(AutomationConfig {
        pull_request_enabled: args.enable_pr,
        confidence_threshold: args.threshold,
        ..AutomationConfig::default()
    })
}

async fn run_resolve(args: ResolveArgs) -> Result<()> {
    let packet = load_packet(&args.packet)?;
    let resolution = build_resolver(&args)?.resolve(&packet).await;
    print_json(&resolution)
}

async fn run_plan(args: PlanArgs) -> Result<()> {
    let packet = load_packet(&args.resolve.packet)?;
    let config = automation_config(&args.planning)?;
    let resolution = build_resolver(&args.resolve)?.resolve(&packet).await;
    print_json(&generate(&packet, &resolution, &config)?)
}

async fn run_diff(args: DiffArgs) -> Result<()> {
    let packet = load_packet(&args.resolve.packet)?;
    let stored: ActionPlan = read_json(&args.stored, "stored plan")?;
    if stored.incident_id != packet.incident_id || stored.run_id != packet.run_id {
        bail!(
            "Stored plan is for incident {} run {}, packet is for incident {} run {}",
            stored.incident_id,
            stored.run_id,
            packet.incident_id,
            packet.run_id
        );
    }
    let config = automation_config(&args.planning)?;

    let store = Arc::new(InMemoryStore::new());
    store.put_packet(&packet).await?;
    store.put_plan_if_absent(&stored).await?;
    let harness = ReplayHarness::new(build_resolver(&args.resolve)?, store.clone(), store);

    let report = harness
        .replay(&packet.incident_id, &packet.run_id, &config)
        .await?;
    print_json(&report)?;

    if !report.matches {
        return Err(anyhow!(
            "Regenerated plan diverges from the stored plan in {} field(s)",
            report.diffs.len()
        ));
    }
    Ok(())
}

fn run_verify_signature(args: VerifyArgs) -> Result<()> {
    let secret = std::env::var(&args.secret_env)
        .with_context(|| format!("{} is not set", args.secret_env))?;
    let payload = fs::read(&args.payload)
        .with_context(|| format!("Failed to read payload {}", args.payload.display()))?;

    if verify_signature(secret.as_bytes(), &payload, args.signature.trim()) {
        println!("valid");
        Ok(())
    } else {
        bail!("Signature does not match payload {}", args.payload.display())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Resolve(args) => run_resolve(args).await,
        Commands::Plan(args) => run_plan(args).await,
        Commands::Diff(args) => run_diff(args).await,
        Commands::VerifySignature(args) => run_verify_signature(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn packet_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let packet = json!({
            "incident_id": "inc-9",
            "collector_run_id": "run-3",
            "service": "orders-api",
            "findings": [{
                "id": "f1",
                "summary": "Errors in orders-api",
                "confidence": 0.5,
                "evidence_refs": []
            }],
            "suspected_owners": [{"repo": "orders-service", "confidence": 0.6}]
        });
        write!(file, "{}", packet).unwrap();
        file
    }

    fn resolve_args(packet: &NamedTempFile) -> ResolveArgs {
        ResolveArgs {
            packet: packet.path().to_path_buf(),
            mapping: None,
            owner: Some("acme".to_string()),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_threshold_outside_unit_interval_is_rejected() {
        let args = PlanningArgs {
            enable_pr: true,
            threshold: 1.2,
        };
        assert!(automation_config(&args).is_err());
    }

    #[tokio::test]
    async fn test_diff_of_identical_plan_matches() {
        let packet_file = packet_file();
        let args = resolve_args(&packet_file);
        let packet = load_packet(&args.packet).unwrap();
        let planning = PlanningArgs {
            enable_pr: true,
            threshold: 0.7,
        };
        let resolution = build_resolver(&args).unwrap().resolve(&packet).await;
        let plan = generate(&packet, &resolution, &automation_config(&planning).unwrap()).unwrap();

        let mut stored = NamedTempFile::new().unwrap();
        write!(stored, "{}", serde_json::to_string(&plan).unwrap()).unwrap();

        let result = run_diff(DiffArgs {
            stored: stored.path().to_path_buf(),
            resolve: resolve_args(&packet_file),
            planning: PlanningArgs {
                enable_pr: true,
                threshold: 0.7,
            },
        })
        .await;
        assert!(result.is_ok());

        let diverged = run_diff(DiffArgs {
            stored: stored.path().to_path_buf(),
            resolve: resolve_args(&packet_file),
            planning: PlanningArgs {
                enable_pr: false,
                threshold: 0.7,
            },
        })
        .await;
        assert!(diverged.is_err());
    }

    #[test]
    fn test_verify_signature_round_trip() {
        let mut payload = NamedTempFile::new().unwrap();
        payload.write_all(br#"{"action":"created"}"#).unwrap();
        let signature =
            opsrunbook_core::webhook::sign_payload(b"cli-secret", br#"{"action":"created"}"#)
                .unwrap();
        std::env::set_var("OPSRUNBOOK_CLI_TEST_SECRET", "cli-secret");

        let ok = run_verify_signature(VerifyArgs {
            payload: payload.path().to_path_buf(),
            signature,
            secret_env: "OPSRUNBOOK_CLI_TEST_SECRET".to_string(),
        });
        assert!(ok.is_ok());

        let bad = run_verify_signature(VerifyArgs {
            payload: payload.path().to_path_buf(),
            signature: format!("sha256={}", "ab".repeat(32)),
            secret_env: "OPSRUNBOOK_CLI_TEST_SECRET".to_string(),
        });
        assert!(bad.is_err());
    }
}
