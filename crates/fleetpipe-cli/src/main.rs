//! Fleetpipe CLI - fleet telemetry simulator and multi-store ingestion tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetpipe_core::config::LogFormat;
use fleetpipe_core::{Config, Error};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Kafka-related error (connection, consumer, producer, admin)
    KafkaError = 2,
    /// Store error (Redis, HBase, MySQL)
    StoreError = 3,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Convert an error to an exit code.
    ///
    /// Library errors are matched by variant; anything else falls back to
    /// inspecting the message.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(e) = error.downcast_ref::<Error>() {
            return match e {
                Error::Config(_) | Error::Serialization(_) => ExitCode::ConfigError,
                Error::Kafka(_) => ExitCode::KafkaError,
                Error::Store(_) => ExitCode::StoreError,
                Error::Shutdown => ExitCode::SignalInterrupt,
                _ => ExitCode::RuntimeError,
            };
        }
        if error.downcast_ref::<fleetpipe_core::KafkaError>().is_some() {
            return ExitCode::KafkaError;
        }
        if error.downcast_ref::<fleetpipe_core::StoreError>().is_some() {
            return ExitCode::StoreError;
        }
        if error.downcast_ref::<toml::de::Error>().is_some() {
            return ExitCode::ConfigError;
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") {
            ExitCode::ConfigError
        } else if error_str.contains("kafka") || error_str.contains("rdkafka") {
            ExitCode::KafkaError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "fleetpipe")]
#[command(about = "Logistics fleet telemetry simulator and ingestion pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device fleet simulator
    Simulate {
        /// Override Kafka bootstrap servers
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override the number of simulated devices
        #[arg(long)]
        devices: Option<usize>,

        /// Seed the random generators for a reproducible run
        #[arg(long)]
        seed: Option<u64>,

        /// Stop after this many seconds instead of waiting for a signal
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Keep records in memory instead of publishing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the ingestion engine
    Ingest {
        /// Override Kafka bootstrap servers
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override consumer group
        #[arg(long)]
        consumer_group: Option<String>,

        /// Write to in-memory stores instead of Redis, HBase and MySQL
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect vehicles in the cache and history stores
    Vehicles {
        #[command(subcommand)]
        action: VehiclesAction,
    },

    /// Manage the telemetry topics
    Topics {
        #[command(subcommand)]
        action: TopicsAction,
    },

    /// Show status and health
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8081")]
        url: String,

        /// Metrics endpoint URL
        #[arg(long, default_value = "http://localhost:9090")]
        metrics_url: String,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Subcommand)]
enum VehiclesAction {
    /// Latest state of every vehicle
    List,
    /// Latest state of one vehicle
    Show { vehicle_id: String },
    /// Position history of one vehicle
    History {
        vehicle_id: String,
        /// Start of the window, Unix seconds (default: one hour before --to)
        #[arg(long)]
        from: Option<i64>,
        /// End of the window, Unix seconds (default: now)
        #[arg(long)]
        to: Option<i64>,
    },
}

#[derive(Subcommand)]
enum TopicsAction {
    /// Create the three telemetry topics
    Create {
        /// Replication factor
        #[arg(long, default_value_t = 1)]
        replication: i32,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log settings come from the config file when it parses; text otherwise
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring);
    let log_format = monitoring
        .as_ref()
        .map(|m| m.log_format.clone())
        .unwrap_or(LogFormat::Text);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map(|m| m.log_level.as_directive())
                    .unwrap_or("info"),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Simulate {
            bootstrap_servers,
            devices,
            seed,
            duration_secs,
            dry_run,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let options = commands::simulate::SimulateOptions {
                bootstrap_servers,
                devices,
                seed,
                duration: duration_secs.map(Duration::from_secs),
                dry_run,
            };
            commands::simulate::run(config, options).await?;
        }

        Commands::Ingest {
            bootstrap_servers,
            consumer_group,
            dry_run,
        } => {
            let config = load_config(cli.config.as_deref())?;
            commands::ingest::run(config, bootstrap_servers, consumer_group, dry_run).await?;
        }

        Commands::Vehicles { action } => {
            let config = load_config(cli.config.as_deref())?;
            match action {
                VehiclesAction::List => commands::vehicles::list(config).await?,
                VehiclesAction::Show { vehicle_id } => {
                    commands::vehicles::show(config, &vehicle_id).await?
                }
                VehiclesAction::History {
                    vehicle_id,
                    from,
                    to,
                } => commands::vehicles::history(config, &vehicle_id, from, to).await?,
            }
        }

        Commands::Topics { action } => {
            let config = load_config(cli.config.as_deref())?;
            match action {
                TopicsAction::Create { replication } => {
                    commands::topics::create(config, replication).await?
                }
            }
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, &metrics_url).await?;
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

/// Default config file looked up when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Load the configuration.
///
/// An explicit path must exist. Without one, `config.toml` is used when
/// present, and built-in defaults against a local broker otherwise. Files
/// are validated on load.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                tracing::warn!("No config.toml found, using built-in defaults");
                return Ok(Config::with_bootstrap_servers(vec![
                    "localhost:29092".to_string()
                ]));
            }
            default
        }
    };

    let config = Config::from_file(&path).map_err(|e| match e {
        Error::Io(io) => Error::Config(format!("{}: {}", path.display(), io)),
        other => other,
    })?;
    Ok(config)
}
