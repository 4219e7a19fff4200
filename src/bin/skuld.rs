//! skuld: command-line client for the dashboard API
//!
//! Fetches resources through the query layer and follows diagnostics
//! reports until their scan settles.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use skuld::config::{Config, Secrets};
use skuld::resources::{self, DiagnosticsReport};
use skuld::{QueryClient, QueryKey, QueryState};

/// Skuld CLI
#[derive(Parser)]
#[command(name = "skuld")]
#[command(version = skuld::PKG_VERSION)]
#[command(about = "Dashboard API client with cached, polling queries")]
struct Args {
    /// Config file (default: ~/.skuld/config.toml, then /etc/skuld/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the API base URL from the config file
    #[arg(long, env = "SKULD_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a path once and print the JSON response
    Get {
        /// Path relative to the API base URL (e.g. "teams/7")
        path: String,
    },

    /// Poll a diagnostics report every 10s until its scan settles
    Report {
        /// Service environment id
        #[arg(long)]
        service_env: String,
        /// Report version
        #[arg(long = "report-version")]
        report_version: String,
        /// Path of the report relative to the API base URL
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(base_url) = args.base_url {
        config.api.base_url = base_url;
    }
    let token = Secrets::load()?.api_token();
    let api = config.api_client(token)?;
    let client = QueryClient::with_defaults(config.query.clone());

    match args.command {
        Command::Get { path } => {
            let key = QueryKey::new("get").with(path.as_str());
            let value: serde_json::Value = client
                .fetch_query(key, api.fetcher::<serde_json::Value>(path), client.options())
                .await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }

        Command::Report {
            service_env,
            report_version,
            path,
        } => {
            let mut report = client.watch(
                resources::diagnostics_report(service_env, report_version),
                api.fetcher::<DiagnosticsReport>(path),
                resources::diagnostics_report_options(client.options()),
            );
            let mut last_status = None;
            loop {
                let snapshot = report.wait_for(|s| !s.is_loading() && !s.is_fetching).await;
                match &snapshot.state {
                    QueryState::Success { data, .. } => {
                        if last_status.as_ref() != Some(&data.scan_status) {
                            println!("scan status: {}", data.scan_status);
                            last_status = Some(data.scan_status.clone());
                        }
                        if !data.scan_status.is_running() {
                            println!("{}", serde_json::to_string_pretty(data)?);
                            break;
                        }
                    }
                    QueryState::Error { error, .. } => return Err(error.clone().into()),
                    QueryState::Idle | QueryState::Loading => {}
                }
                report.changed().await;
            }
        }
    }

    Ok(())
}
