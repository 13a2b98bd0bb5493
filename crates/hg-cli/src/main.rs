//! hostguard CLI
//!
//! Converges SSH policy, firewall exposure, brute-force protection,
//! privileged group membership and an emergency credential, pausing for
//! the operator before each step that could cut off remote access.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hostguard::output::print_error;
use hostguard::{commands, exit_code, exit_code_for_error, load_config};
use hg_core::config::Override;
use hg_core::types::ConfigurationDomain;

#[derive(Parser)]
#[command(name = "hostguard")]
#[command(author, version, about = "Host hardening without locking yourself out")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "HOSTGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override a config option, e.g. --set ssh.port=2222 (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    sets: Vec<Override>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge every enabled domain, pausing at each checkpoint
    Apply {
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
        /// Confirm checkpoints automatically when stdin is not a terminal
        #[arg(long)]
        non_interactive_override: bool,
    },

    /// Show what apply would change without touching the host
    Plan {
        /// Print plans as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show live state of every enabled domain and the last run
    Status {
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recorded originals and verify their checksums
    Backups {
        /// Print backups as JSON
        #[arg(long)]
        json: bool,
    },

    /// Put back the original artifact of one domain
    Restore {
        /// ssh-policy, firewall-exposure, intrusion-jail, privileged-group or emergency-credential
        domain: ConfigurationDomain,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration file
    Show,
    /// Print the configuration file path
    Path,
    /// Write the default configuration
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Get a configuration value
    Get {
        /// Dotted key, e.g. ssh.port
        key: String,
    },
    /// Set a configuration value
    Set {
        /// Dotted key, e.g. ssh.port
        key: String,
        /// New value
        value: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            print_error(&format!("{:#}", e));
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Apply {
            json,
            non_interactive_override,
        } => {
            let config = load_config(cli.config.as_deref(), &cli.sets)?;
            if non_interactive_override {
                tracing::warn!("Checkpoint override requested on the command line");
            }
            commands::apply_command(config, json, non_interactive_override).await
        }
        Commands::Plan { json } => {
            let config = load_config(cli.config.as_deref(), &cli.sets)?;
            commands::plan_command(config, json).await?;
            Ok(exit_code::COMPLETED)
        }
        Commands::Status { json } => {
            let config = load_config(cli.config.as_deref(), &cli.sets)?;
            commands::status_command(config, json).await?;
            Ok(exit_code::COMPLETED)
        }
        Commands::Backups { json } => {
            let config = load_config(cli.config.as_deref(), &cli.sets)?;
            commands::backups_command(&config, json)?;
            Ok(exit_code::COMPLETED)
        }
        Commands::Restore { domain } => {
            let config = load_config(cli.config.as_deref(), &cli.sets)?;
            commands::restore_command(&config, domain).await
        }
        Commands::Config { action } => {
            match action {
                ConfigAction::Show => commands::config_show(config_path)?,
                ConfigAction::Path => commands::config_path(config_path)?,
                ConfigAction::Init { force } => commands::config_init(config_path, force)?,
                ConfigAction::Get { key } => commands::config_get(config_path, &key)?,
                ConfigAction::Set { key, value } => {
                    commands::config_set(config_path, &key, &value)?
                }
            }
            Ok(exit_code::COMPLETED)
        }
    }
}
