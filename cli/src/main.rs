// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # AEGIS Node Agent
//!
//! The `aegis-agent` binary runs the attachment reconciler on a node. The
//! control plane announces the external resources it attached to the host
//! (block volumes, for now); the agent confirms each one with a host-side
//! discovery probe and reports the outcome before the attachment's deadline.
//!
//! ## Commands
//!
//! - `aegis-agent run [--input FILE] [--exit-when-idle]` - Reconcile proposals
//!   read as newline-delimited JSON, printing outcomes to stdout
//! - `aegis-agent config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use aegis_node_agent::commands::{self, ConfigCommand, RunArgs};
use aegis_node_agent_core::domain::node_config::AgentConfigManifest;

/// AEGIS Node Agent - Confirm host attachments announced by the control plane
#[derive(Parser)]
#[command(name = "aegis-agent")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AEGIS_AGENT_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "AEGIS_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the attachment reconciler
    #[command(name = "run")]
    Run(RunArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = AgentConfigManifest::load_or_default(cli.config)
                .context("Failed to load configuration")?;
            config
                .validate()
                .context("Configuration validation failed")?;

            let logging = &config.spec.observability.logging;
            let level = cli.log_level.as_deref().unwrap_or(&logging.level);
            init_logging(level, &logging.format)?;
            info!(node = %config.metadata.name, "Configuration loaded");

            commands::run::execute(args, config).await
        }
        Commands::Config { command } => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;
            commands::config::handle_command(command, cli.config).await
        }
    }
}

/// Initialize tracing subscriber for logging
///
/// `RUST_LOG` wins over `level` when set. Logs go to stderr so stdout carries
/// only attachment events.
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }

    Ok(())
}
