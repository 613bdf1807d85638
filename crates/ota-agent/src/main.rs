//! ota-agent - dual-bank firmware update agent
//!
//! Polls an update server, stages new images into the inactive slot of a
//! directory-backed partition store and switches the boot record once an
//! image is complete and valid.

#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ota_agent::AgentConfig;
use ota_agent::commands::{self, RunOutcome};
use ota_agent::error::AgentError;

#[derive(Parser)]
#[command(name = "ota-agent")]
#[command(about = "Dual-bank firmware update agent")]
#[command(version)]
struct Cli {
    /// Agent configuration file (JSON or YAML)
    #[arg(
        short,
        long,
        global = true,
        env = "OTA_AGENT_CONFIG",
        default_value = "ota-agent.yaml"
    )]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll for updates until one is committed
    Run {
        /// Make a single attempt now instead of polling
        #[arg(long)]
        once: bool,
    },

    /// Show the partition table and the boot record
    Status {
        /// Output in JSON format for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Mark the boot image invalid and roll back to the other slot
    MarkInvalid,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ota_agent={log_level},ota_updater={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match execute_command(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            let mut source = e.source();
            while let Some(err) = source {
                eprintln!("  Caused by: {err}");
                source = err.source();
            }

            let code = e.downcast_ref::<AgentError>().map_or(1, AgentError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn execute_command(cli: &Cli) -> Result<()> {
    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match &cli.command {
        Commands::Run { once } => match commands::run(&config, *once).await? {
            RunOutcome::Committed(report) => {
                println!(
                    "Installed {} into {} ({} bytes); restart to boot it",
                    report.version, report.target.label, report.bytes_written
                );
                Ok(())
            }
            RunOutcome::NotUpdated(reason) => {
                println!("No update installed: {reason}");
                Ok(())
            }
            RunOutcome::Interrupted => Ok(()),
        },
        Commands::Status { json } => {
            let report = commands::status(&config)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
            Ok(())
        }
        Commands::MarkInvalid => {
            let (invalid, boot) = commands::mark_invalid(&config).await?;
            println!("Marked {} invalid; booting {}", invalid.label, boot.label);
            Ok(())
        }
    }
}
