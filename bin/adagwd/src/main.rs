//! ---
//! gw_section: "01-core-functionality"
//! gw_subsection: "binary"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "Binary entrypoint for the adapter gateway daemon."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use adagw_common::config::{AppConfig, LinkKind};
use adagw_common::logging::init_tracing;
use adagw_common::{shutdown, Clock, SystemClock};
use adagw_core::Aggregator;
use adagw_messaging::TracingBus;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("VERGEN_CARGO_TARGET_TRIPLE"),
        ", built ",
        env!("VERGEN_BUILD_TIMESTAMP"),
        ")"
    ),
    about = "Adapter gateway delivery daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the server link from the configuration")]
    link: Option<CliLink>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLink {
    Synchronous,
    Correlated,
}

impl From<CliLink> for LinkKind {
    fn from(value: CliLink) -> Self {
        match value {
            CliLink::Synchronous => LinkKind::Synchronous,
            CliLink::Correlated => LinkKind::Correlated,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the gateway until interrupted")]
    Run,
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

fn config_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from("configs/adagw.toml"));
    candidates.push(PathBuf::from("/etc/adagw/adagw.toml"));
    candidates
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = AppConfig::load_with_source(&config_candidates(cli.config.as_deref()))?;
    let mut config = loaded.config;
    if let Some(link) = cli.link {
        config.server.link = link.into();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            config.validate()?;
            println!("# effective configuration from {}", loaded.source.display());
            print!("{}", config.to_toml()?);
        }
        Commands::Run => {
            init_tracing("adagwd", &config.logging)?;
            info!(
                source = %loaded.source.display(),
                link = ?config.server.link,
                server = %format!("{}:{}", config.server.host, config.server.port),
                "configuration loaded"
            );
            run_daemon(config).await?;
        }
    }
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let aggregator = Aggregator::from_config(&config, Arc::new(TracingBus), clock)
        .context("failed to assemble gateway core")?;

    let (trigger, shutdown) = shutdown::channel();
    let tasks = aggregator.start(shutdown);

    info!("daemon running; waiting for termination signal");
    let signalled = signal::ctrl_c().await;
    info!("shutting down");
    trigger.trigger();
    tasks.join().await;
    signalled.context("failed to listen for ctrl-c")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_config_is_inspected_first() {
        let candidates = config_candidates(Some(Path::new("/tmp/custom.toml")));
        assert_eq!(candidates[0], PathBuf::from("/tmp/custom.toml"));
        assert_eq!(candidates.len(), 3);
        assert_eq!(config_candidates(None)[0], PathBuf::from("configs/adagw.toml"));
    }

    #[test]
    fn cli_parses_link_override_and_subcommand() {
        let cli = Cli::parse_from(["adagwd", "--link", "correlated", "check-config"]);
        assert!(matches!(cli.link, Some(CliLink::Correlated)));
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(LinkKind::from(CliLink::Correlated), LinkKind::Correlated);
    }
}
