//! Main entry point for the ranked-room service
//!
//! Loads configuration, connects to the broker, starts the command consumer,
//! the scheduled passes and the health server, then runs until SIGINT or
//! SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use ranked_room::club::{ClubLeagueProvider, InMemoryClubLeague, NoClubLeague};
use ranked_room::config::AppConfig;
use ranked_room::service::AppState;
use ranked_room::types::PlayerProfile;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Ranked Room - ranked 1v1 matchmaking and match lifecycle
#[derive(Parser)]
#[command(
    name = "ranked-room",
    version,
    about = "Ranked 1v1 matchmaking and match-lifecycle service",
    long_about = "Ranked Room consumes player commands over AMQP, pairs queued players by rep, \
                 tier, wait time and win rate, drives each match through stage bans, captain \
                 picks, host selection and room codes, and settles reported scores into rep."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// AMQP URL override
    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    /// Health port override
    #[arg(long, value_name = "PORT", help = "Override health and metrics port")]
    health_port: Option<u16>,

    /// Player profiles to load into the store at startup
    #[arg(long, value_name = "FILE", help = "JSON array of player profiles")]
    profiles: Option<PathBuf>,

    /// Clubs tracked by the club league
    #[arg(
        long,
        value_name = "CLUB",
        value_delimiter = ',',
        help = "Comma-separated clubs tracked this season"
    )]
    clubs: Vec<String>,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Validate config and exit
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("Ranked Room");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    info!("   AMQP: {}", config.amqp.url);
    info!("   Command queue: {}", config.amqp.command_queue);
    info!(
        "   Matchmaking: every {}s, threshold {:.2}, cross-region penalty {:.2}",
        config.engine.matchmaking.interval_seconds,
        config.engine.matchmaking.acceptance_threshold,
        config.engine.matchmaking.cross_region_penalty
    );
    info!(
        "   Queue: max age {}s, max attempts {}",
        config.engine.queue.max_queue_age_seconds, config.engine.queue.max_match_attempts
    );
    info!(
        "   Cancellation policy: {:?}",
        config.engine.phases.cancellation_policy
    );
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(amqp_url) = &args.amqp_url {
        config.amqp.url = amqp_url.clone();
    }

    if let Some(health_port) = args.health_port {
        config.service.health_port = health_port;
    }

    ranked_room::config::validate_config(&config)?;
    Ok(config)
}

fn load_profiles(path: &Path) -> Result<Vec<PlayerProfile>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profiles file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse profiles file {}", path.display()))
}

fn club_league(clubs: &[String]) -> Arc<dyn ClubLeagueProvider> {
    if clubs.is_empty() {
        Arc::new(NoClubLeague)
    } else {
        Arc::new(InMemoryClubLeague::with_clubs(clubs.iter().cloned()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let profiles = match &args.profiles {
        Some(path) => load_profiles(path)?,
        None => Vec::new(),
    };

    display_startup_banner(&config);

    if args.dry_run {
        info!(
            "Configuration valid ({} profiles, {} clubs); exiting",
            profiles.len(),
            args.clubs.len()
        );
        return Ok(());
    }

    let mut app_state = match AppState::with_clubs(config.clone(), club_league(&args.clubs)).await
    {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    let store = app_state.engine().store();
    for profile in profiles {
        store.upsert_profile(profile).await?;
    }

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    info!("Ranked Room is running; press Ctrl+C to shut down");

    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, beginning graceful shutdown");
    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("Graceful shutdown completed"),
        Ok(Err(e)) => warn!("Shutdown finished with errors: {}", e),
        Err(_) => warn!("Shutdown timeout exceeded, forcing exit"),
    }

    Ok(())
}
