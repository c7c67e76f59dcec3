//! tunwarden CLI
//!
//! Single binary for all tunwarden operations:
//! - Engine (daemon that owns the tunnel session)
//! - Session commands (connect, disconnect, status, ip)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunwarden::commands;
use tunwarden::output::print_error;
use tw_core::config::{self, EngineConfig};
use tw_engine::Engine;

#[derive(Parser)]
#[command(name = "tunwarden")]
#[command(author, version, about = "VPN session orchestrator")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Observer address of the engine (overrides config)
    #[arg(short, long, global = true)]
    address: Option<String>,

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
    /// Run the engine in the foreground
    /// Alias: start
    #[command(alias = "start")]
    Serve {
        /// Bind address for the observer server (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Establish a tunnel to a country's best host or a specific host
    Connect {
        /// Two-letter country code (US) or host identifier (us720)
        target: String,
        /// Account username for the tunnel endpoint
        #[arg(short, long)]
        username: Option<String>,
        /// Account password; use "-" to read it from stdin
        #[arg(short, long)]
        password: Option<String>,
        /// Read the password from the first line of a file
        #[arg(short = 'f', long)]
        password_file: Option<PathBuf>,
    },

    /// Tear down the active tunnel
    Disconnect,

    /// Show the current session state
    Status,

    /// Show our public IP as seen by the directory service
    Ip,
}

#[tokio::main]
async fn main() {
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
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = run(cli).await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_engine_config(cli.config.as_deref())?;
    let address = cli
        .address
        .clone()
        .unwrap_or_else(|| config.observer.bind_address.clone());

    match cli.command {
        Commands::Serve { bind } => run_engine(config, bind.or(cli.address)).await,

        Commands::Connect {
            target,
            username,
            password,
            password_file,
        } => commands::connect_command(&address, &target, username, password, password_file).await,

        Commands::Disconnect => commands::disconnect_command(&address).await,

        Commands::Status => commands::status_command(&address).await,

        Commands::Ip => commands::ip_command(&config.directory).await,
    }
}

fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            let default_path = config::default_config_path();
            if default_path.exists() {
                Ok(config::load_config(&default_path).unwrap_or_else(|e| {
                    tracing::warn!(
                        "failed to load config from {}: {e}",
                        default_path.display()
                    );
                    EngineConfig::default()
                }))
            } else {
                Ok(EngineConfig::default())
            }
        }
    }
}

/// Run the engine in the foreground until Ctrl+C or SIGTERM
async fn run_engine(mut config: EngineConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.observer.bind_address = bind;
    }

    tracing::info!("tunwarden engine starting");
    let engine = Engine::start(config)?;

    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, initiating shutdown");
            }
        }

        shutdown.cancel();
    });

    engine.serve().await?;
    engine.shutdown().await;

    tracing::info!("engine shutdown complete");
    Ok(())
}
