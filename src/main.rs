//! # CoachDesk — automation dispatch CLI
//!
//! Usage:
//!   coachdesk sweep                          # One sweep now, report as JSON
//!   coachdesk sweep --at 2026-06-01T09:00:00Z
//!   coachdesk run                            # Sweep periodically until Ctrl-C
//!   coachdesk send --rule r1 --recipient c1  # Manual send
//!   coachdesk bulk --subject Hi --message "Gym closed" --recipients c1,c2
//!   coachdesk stale                          # Reservations never finalized
//!   coachdesk import snapshot.json           # Seed rules/recipients/sessions/charges
//!   coachdesk init                           # Write a default config

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use coachdesk_automation::{
    build_channel, spawn_sweeper, DirectorySnapshot, DispatchLedger, DispatchSettings, DispatchSource, Dispatcher,
    SqliteDirectory, SqliteLedger, TemplateBook,
};
use coachdesk_core::CoachDeskConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coachdesk", version, about = "📬 CoachDesk — automation dispatch engine")]
struct Cli {
    /// Config file (default: ~/.coachdesk/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single sweep over all active rules
    Sweep {
        /// Evaluate as of this instant (RFC 3339) instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Sweep every `automation.sweep_interval_secs` until Ctrl-C
    Run,
    /// Send one rule's message to one recipient now
    Send {
        #[arg(long)]
        rule: String,
        #[arg(long)]
        recipient: String,
    },
    /// Send a rule's message or a raw message to many recipients
    Bulk {
        #[arg(long, conflicts_with_all = ["subject", "message"], required_unless_present = "message")]
        rule: Option<String>,
        #[arg(long, default_value = "")]
        subject: String,
        #[arg(long)]
        message: Option<String>,
        /// Comma-separated recipient ids
        #[arg(long, value_delimiter = ',', required = true)]
        recipients: Vec<String>,
    },
    /// List reservations older than `automation.stale_reservation_secs`
    Stale,
    /// Import a JSON directory snapshot into the database
    Import { file: PathBuf },
    /// Write a default config file to ~/.coachdesk/config.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    if let Command::Init = cli.command {
        let path = CoachDeskConfig::default_path();
        if path.exists() {
            println!("⚠️  Config already exists at {}", path.display());
        } else {
            CoachDeskConfig::default().save()?;
            println!("✅ Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => CoachDeskConfig::load_from(path)?,
        None => CoachDeskConfig::load()?,
    };
    let db_path = config.database_file();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let directory = Arc::new(SqliteDirectory::open(&db_path)?);
    let ledger = Arc::new(SqliteLedger::open(&db_path)?);
    tracing::debug!("🗄️ Database: {}", db_path.display());

    match &cli.command {
        Command::Import { file } => {
            let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
            let snapshot: DirectorySnapshot = serde_json::from_str(&raw).context("parsing snapshot")?;
            directory.import(&snapshot)?;
            return Ok(());
        }
        Command::Stale => {
            let cutoff = Utc::now() - stale_after(&config);
            let stale = ledger.stale_reservations(cutoff).await?;
            println!("{}", serde_json::to_string_pretty(&stale)?);
            return Ok(());
        }
        _ => {}
    }

    let channel = build_channel(&config.channel)?;
    let templates = Arc::new(TemplateBook::new(config.templates.clone()));
    if templates.is_empty() {
        tracing::warn!("⚠️  No templates configured; rule-based sends will fail to render");
    } else {
        tracing::debug!("📝 {} template(s) loaded", templates.len());
    }
    let shutdown = CancellationToken::new();
    let dispatcher = Arc::new(
        Dispatcher::new(
            directory.clone(),
            directory,
            ledger,
            templates,
            channel,
            DispatchSettings::from_config(&config.automation),
        )
        .with_cancel_token(shutdown.clone()),
    );

    match cli.command {
        Command::Sweep { at } => {
            let report = dispatcher.run_sweep(at.unwrap_or_else(Utc::now)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run => {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("🛑 Ctrl-C received, finishing in-flight sends");
                    shutdown.cancel();
                }
            });
            spawn_sweeper(
                dispatcher,
                config.automation.sweep_interval_secs,
                config.automation.stale_reservation_secs,
            )
            .await;
        }
        Command::Send { rule, recipient } => {
            let outcome = dispatcher.dispatch_manual(&rule, &recipient).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Bulk { rule, subject, message, recipients } => {
            let source = match (rule, message) {
                (Some(id), _) => DispatchSource::Rule(id),
                (None, Some(body)) => DispatchSource::Message { subject, body },
                (None, None) => anyhow::bail!("either --rule or --message is required"),
            };
            let batch = dispatcher.dispatch_bulk(&source, &recipients).await?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }
        Command::Import { .. } | Command::Stale | Command::Init => {}
    }
    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "coachdesk=debug,coachdesk_automation=debug"
    } else {
        "coachdesk=info,coachdesk_automation=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn stale_after(config: &CoachDeskConfig) -> Duration {
    let secs = i64::try_from(config.automation.stale_reservation_secs).unwrap_or(i64::MAX);
    Duration::seconds(secs.min(i64::MAX / 1000))
}
