//! focus-sync - Self-hosted sync server for a focus timer
//!
//! One authoritative timer session per account, pushed to every connected
//! device, with a timezone-aware daily counter reset.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use focus_sync::api;
use focus_sync::clock::{SharedClock, SystemClock};
use focus_sync::config::Config;
use focus_sync::db::Database;
use focus_sync::hub::{self, Hubs};
use focus_sync::models::{ResetConfiguration, ResetTimeOfDay};
use focus_sync::notify::{self, Notifier};
use focus_sync::scheduler;

#[derive(Parser)]
#[command(name = "focus-sync")]
#[command(about = "Self-hosted sync server for a multi-device focus timer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new API token
    Token {
        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// Account (session) the token acts for; defaults to the name
        #[arg(short, long)]
        account: Option<String>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path (for list/revoke operations)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show when the daily counter would next reset
    NextReset {
        /// IANA timezone, e.g. America/New_York
        #[arg(short, long, default_value = "UTC")]
        timezone: String,

        /// "midnight", an hour ("7"), or "HH:MM"
        #[arg(long, default_value = "midnight")]
        time: String,

        /// Compute from this RFC 3339 instant instead of now
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("focus_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = if let Some(path) = config {
                Config::load_from(&path)?
            } else {
                Config::load()?
            };

            // Override with CLI args
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            if cfg.tokens.is_empty() {
                tracing::warn!("No tokens configured; run 'focus-sync token' to create one");
            }

            run_server(cfg).await
        }

        Commands::Token {
            name,
            account,
            list,
            revoke,
            config,
        } => {
            let config_path = if let Some(path) = config {
                path
            } else {
                Config::default_path()?
            };

            if !list && revoke.is_none() {
                let label = name.unwrap_or_else(|| "default".to_string());
                return issue_token(&config_path, &label, account);
            }

            if !config_path.exists() {
                println!("No config file found at {}", config_path.display());
                println!("Run 'focus-sync init' to create one.");
                return Ok(());
            }
            let mut cfg = Config::load_from(&config_path)?;

            if let Some(token_name) = revoke {
                if cfg.revoke_token(&token_name) {
                    cfg.save_to(&config_path)?;
                    println!("Revoked token '{}'.", token_name);
                } else {
                    println!("Token '{}' not found.", token_name);
                }
            } else if cfg.tokens.is_empty() {
                println!("No tokens configured.");
                println!("Generate one with: focus-sync token --name <device> --account <account>");
            } else {
                println!("Configured tokens:");
                for token in &cfg.tokens {
                    println!("  {} -> session '{}'", token.name, token.account());
                }
            }

            Ok(())
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Generate a token: focus-sync token --name phone --account me");
            println!("  2. Set [scheduler.default_reset] to your timezone and reset time");
            println!(
                "  3. Start the server: focus-sync serve --config {}",
                path.display()
            );

            Ok(())
        }

        Commands::NextReset {
            timezone,
            time,
            from,
        } => {
            let reset_time: ResetTimeOfDay = time.parse()?;
            let config = ResetConfiguration {
                timezone,
                reset_time,
                enabled: true,
            };
            let now = from.unwrap_or_else(Utc::now);
            let next = scheduler::compute_next_fire(&config, now)?;
            let tz = scheduler::resolve_timezone(&config.timezone)?;

            println!("Next reset: {}", next.to_rfc3339());
            println!("Local time: {}", next.with_timezone(&tz).to_rfc3339());
            Ok(())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let db = Arc::new(Database::open(&config.database.path).context("Failed to open database")?);
    let clock: SharedClock = Arc::new(SystemClock);
    let notifier = Notifier::new(256);
    notify::start_log_subscriber(&notifier);

    let hubs = Arc::new(Hubs::new(
        config.hub_settings(),
        clock.clone(),
        db.clone(),
        notifier,
    ));

    // Seed every stored session so missed resets fire without device traffic
    hubs.restore_all()
        .await
        .context("Failed to restore sessions")?;

    scheduler::start_scheduler(
        hubs.clone(),
        clock.clone(),
        Duration::from_secs(config.scheduler.check_interval_secs),
    );
    hub::start_sweeper(
        hubs.clone(),
        Duration::from_secs(config.sync.sweep_interval_secs),
        chrono::Duration::seconds(config.sync.idle_timeout_secs as i64),
    );

    let state = api::AppState::new(hubs.clone(), db, config.clone());
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("focus-sync server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hubs.shutdown_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Generate a token, saving it into the config when one exists
fn issue_token(config_path: &Path, label: &str, account: Option<String>) -> Result<()> {
    let (token, cfg) = if config_path.exists() {
        let mut cfg = Config::load_from(config_path)?;
        let token = cfg.issue_token(label, account)?;
        cfg.save_to(config_path)?;
        (token, None)
    } else {
        let mut cfg = Config::default();
        let token = cfg.issue_token(label, account)?;
        (token, Some(cfg))
    };

    println!("Generated API token for '{}'", label);
    println!();
    println!("Token: {}", token);

    // No config file yet: print the entry for manual setup
    if let Some(entry) = cfg.as_ref().and_then(|c| c.tokens.first()) {
        println!();
        println!("Add this to your server's config.toml:");
        println!();
        println!("  [[tokens]]");
        println!("  name = \"{}\"", entry.name);
        println!("  token_hash = \"{}\"", entry.token_hash);
        if let Some(account) = &entry.account {
            println!("  account = \"{}\"", account);
        }
    }

    println!();
    println!("Devices sharing a session must use tokens for the same account.");
    println!("Save this token now - it cannot be retrieved later!");
    Ok(())
}
