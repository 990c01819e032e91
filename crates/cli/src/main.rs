//! Instance lifecycle CLI
//!
//! Inspects and triggers runs of the lifecycle agent, and classifies fleet
//! fixtures or validates policy documents offline.

mod client;
mod commands;
mod config;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{classify, policy, report, status};
use lifecycle_lib::lifecycle::Verdict;

/// Instance lifecycle CLI
#[derive(Parser)]
#[command(name = "lcctl")]
#[command(author, version, about = "CLI for the instance lifecycle agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (falls back to the config file, then http://localhost:8080)
    #[arg(long, env = "LCCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the agent's latest run report
    Report {
        /// Only show instances of this tenant
        #[arg(long, short)]
        tenant: Option<String>,

        /// Only show instances with this verdict (e.g. shelve, delete_warn)
        #[arg(long, value_parser = parse_verdict)]
        verdict: Option<Verdict>,
    },

    /// Trigger a run on the agent now
    Run {
        /// Report and notify without shelving or deleting anything
        #[arg(long, conflicts_with = "live")]
        dry_run: bool,

        /// Shelve and delete instances for real
        #[arg(long)]
        live: bool,
    },

    /// Classify a fleet fixture offline against a policy
    Classify {
        /// Policy document (TOML, YAML or JSON)
        #[arg(long)]
        policy: PathBuf,

        /// Fleet fixture (JSON)
        #[arg(long)]
        fleet: PathBuf,

        /// Evaluate as of this time instead of now (RFC 3339)
        #[arg(long)]
        now: Option<String>,

        /// Only show instances of this tenant
        #[arg(long, short)]
        tenant: Option<String>,

        /// Only show instances with this verdict
        #[arg(long, value_parser = parse_verdict)]
        verdict: Option<Verdict>,
    },

    /// Policy document commands
    #[command(subcommand)]
    Policy(PolicyCommands),

    /// Show agent health and readiness
    Status,

    /// CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Validate a policy document and print its thresholds
    Check {
        /// Policy document (TOML, YAML or JSON)
        path: PathBuf,

        /// Show the thresholds that apply to this tenant
        #[arg(long, short)]
        tenant: Option<String>,

        /// Show the thresholds that apply to this instance id
        #[arg(long, short)]
        instance: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Store the agent API URL in the config file
    SetApiUrl {
        url: String,
    },
}

fn parse_verdict(raw: &str) -> Result<Verdict, String> {
    report::parse_verdict(raw).map_err(|e| e.to_string())
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = config::Config::load()?;
    let api_url = config.resolve_api_url(cli.api_url.as_deref());

    match cli.command {
        Commands::Report { tenant, verdict } => {
            let client = client::ApiClient::new(&api_url)?;
            let filter = report::ReportFilter { tenant, verdict };
            report::show_report(&client, &filter, cli.format).await?;
        }
        Commands::Run { dry_run, live } => {
            let client = client::ApiClient::new(&api_url)?;
            let mode = match (dry_run, live) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            report::trigger_run(&client, mode, cli.format).await?;
        }
        Commands::Classify {
            policy,
            fleet,
            now,
            tenant,
            verdict,
        } => {
            let filter = report::ReportFilter { tenant, verdict };
            classify::classify(&policy, &fleet, now.as_deref(), &filter, cli.format).await?;
        }
        Commands::Policy(PolicyCommands::Check {
            path,
            tenant,
            instance,
        }) => {
            policy::check_policy(&path, tenant.as_deref(), instance.as_deref(), cli.format)?;
        }
        Commands::Status => {
            let client = client::ApiClient::new(&api_url)?;
            status::show_status(&client, cli.format).await?;
        }
        Commands::Config(ConfigCommands::Show) => {
            output::print_info(&format!("API URL: {}", api_url));
        }
        Commands::Config(ConfigCommands::SetApiUrl { url: new_url }) => {
            url::Url::parse(&new_url)
                .map_err(|e| anyhow::anyhow!("Invalid API URL '{}': {}", new_url, e))?;
            config.api_url = Some(new_url);
            let path = config.save()?;
            output::print_success(&format!("Saved {}", path.display()));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
