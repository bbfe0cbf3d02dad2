//! poly-account: cached, authenticated view of a Polymarket CLOB account.
//!
//! Usage:
//!   poly-account [OPTIONS] [COMMAND]
//!
//! Commands:
//!   run        Keep account state warm until interrupted (default)
//!   snapshot   Refresh once and print the snapshot as JSON
//!   revoke     Revoke the current API credentials
//!
//! Options:
//!   -c, --config <FILE>         Config file path (default: config/account.toml)
//!   --log-level <LEVEL>         trace, debug, info, warn, error
//!   --clob-api-url <URL>        CLOB REST endpoint (overrides config)
//!   --data-dir <DIR>            Directory for persisted state
//!   --allow-create              Create an API key if none can be derived

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use poly_common::Channel;
use poly_market::SubscriptionRequest;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use poly_account::{AccountConfig, AccountService};

/// CLI arguments for poly-account.
#[derive(Parser, Debug)]
#[command(name = "poly-account")]
#[command(about = "Cached, authenticated view of a Polymarket CLOB account")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/account.toml", global = true)]
    config: PathBuf,

    /// Logging level (overrides config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// CLOB REST endpoint (overrides config file)
    #[arg(long, global = true)]
    clob_api_url: Option<String>,

    /// Directory for persisted snapshot, credentials and activity
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Create an API key when none can be derived
    #[arg(long, global = true)]
    allow_create: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Keep account state warm until interrupted
    Run {
        /// Stream a channel, e.g. "book:123,456" or "user:0xmarket"
        #[arg(long = "subscribe", value_parser = parse_subscription)]
        subscriptions: Vec<SubscriptionRequest>,
    },
    /// Refresh once and print the snapshot as JSON
    Snapshot,
    /// Revoke the current API credentials
    Revoke,
}

/// Parse `channel:id1,id2`. The `user` channel is always authenticated.
fn parse_subscription(value: &str) -> Result<SubscriptionRequest, String> {
    let (channel, ids) = value
        .split_once(':')
        .ok_or_else(|| format!("expected channel:id1,id2, got {value:?}"))?;
    let channel: Channel = channel.parse()?;
    let ids: Vec<String> = ids
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        return Err(format!("no instrument ids in {value:?}"));
    }
    let request = SubscriptionRequest::new(channel, ids);
    Ok(if channel == Channel::User {
        request.authenticated()
    } else {
        request
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let config_missing = !args.config.exists();
    let mut config = if config_missing {
        AccountConfig::default()
    } else {
        AccountConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    };

    config.apply_env_overrides();
    config.apply_cli_overrides(
        args.log_level.clone(),
        args.clob_api_url.clone(),
        args.data_dir.clone(),
        args.allow_create,
    );

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    if config_missing {
        warn!("Config file not found at {:?}, using defaults", args.config);
    }

    config.validate().context("Configuration validation failed")?;

    info!(
        clob_api_url = %config.venue.clob_api_url,
        has_private_key = config.wallet.private_key.is_some(),
        allow_create = config.wallet.allow_create_api_key,
        "Starting poly-account"
    );

    let service = AccountService::from_config(config).context("Failed to build account service")?;

    match args.command.unwrap_or(Command::Run {
        subscriptions: Vec::new(),
    }) {
        Command::Run { subscriptions } => run_service(service, subscriptions).await,
        Command::Snapshot => print_snapshot(service).await,
        Command::Revoke => {
            service
                .credentials()
                .revoke()
                .await
                .context("Failed to revoke API credentials")?;
            info!("API credentials revoked");
            Ok(())
        }
    }
}

async fn run_service(service: AccountService, subscriptions: Vec<SubscriptionRequest>) -> Result<()> {
    service.start(subscriptions).await;

    if let Err(e) = wait_for_shutdown().await {
        error!("Shutdown signal handler error: {}", e);
    }
    info!("Requesting shutdown...");

    service.stop().await;
    Ok(())
}

async fn print_snapshot(service: AccountService) -> Result<()> {
    service
        .credentials()
        .require()
        .await
        .context("Cannot read account state")?;
    let Some(snapshot) = service.cache().refresh().await else {
        bail!("No account snapshot available (no wallet configured, or every account fetch failed)");
    };
    let json = serde_json::to_string_pretty(snapshot.as_ref()).context("Failed to encode snapshot")?;
    println!("{json}");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
