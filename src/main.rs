//! # Ally: adaptive study planner
//!
//! Splits study topics into sessions, fits them into the user's free time,
//! re-plans when sessions are missed and sends reminders.
//!
//! Usage:
//!   ally init                       # Write a default config
//!   ally apply commands.json        # Run one command or a list of commands
//!   ally today                      # Show today's sessions
//!   ally run                        # Run the reminder loop until Ctrl+C
//!   ally demo                       # Simulated week, no persistence

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ally_core::{AllyConfig, AvailabilitySlot, Clock, ManualClock, Session, SystemClock, Topic};
use ally_scheduler::{Command, StudyPlanner, spawn_reminder_loop};
use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ally", version, about = "📚 Ally: adaptive study planner and reminder engine")]
struct Cli {
    /// Config file (default: ~/.ally/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Apply a JSON command (or a JSON array of commands)
    Apply { file: String },
    /// Print today's sessions
    Today,
    /// Run the reminder loop until Ctrl+C
    Run,
    /// Walk through a simulated week with a manual clock
    Demo,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Batch {
    Many(Vec<Command>),
    One(Command),
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(AllyConfig::default_path)
}

fn load_config(path: &Path) -> Result<AllyConfig> {
    if path.exists() {
        Ok(AllyConfig::load_from(path)?)
    } else {
        Ok(AllyConfig::default())
    }
}

async fn open_planner(config: AllyConfig) -> Result<StudyPlanner> {
    let db_path = expand_path(&config.storage.db_path);
    let planner = StudyPlanner::open(config, Arc::new(SystemClock), &db_path)
        .await
        .with_context(|| format!("opening {}", db_path.display()))?;
    Ok(planner)
}

fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("   (nothing planned)");
    }
    for s in sessions {
        println!(
            "   {} → {}  {:<12} #{:<2} {:?}",
            s.start.format("%a %d %H:%M"),
            s.end.format("%H:%M"),
            s.subject,
            s.chunk_index,
            s.status
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "ally=debug,ally_core=debug,ally_scheduler=debug"
    } else {
        "ally=info,ally_core=info,ally_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let path = config_path(&cli);
    match &cli.command {
        Commands::Init { force } => {
            if path.exists() && !force {
                println!("⚠️  Config already exists: {}", path.display());
                return Ok(());
            }
            AllyConfig::default().save_to(&path)?;
            println!("✅ Config written: {}", path.display());
        }
        Commands::Apply { file } => {
            let raw = std::fs::read_to_string(expand_path(file))
                .with_context(|| format!("reading {file}"))?;
            let commands = match serde_json::from_str(&raw).context("parsing commands")? {
                Batch::Many(commands) => commands,
                Batch::One(command) => vec![command],
            };
            let planner = open_planner(load_config(&path)?).await?;
            for command in commands {
                let response = planner.handle(command).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
            }
        }
        Commands::Today => {
            let planner = open_planner(load_config(&path)?).await?;
            println!("📅 Today ({})", planner.now().format("%Y-%m-%d"));
            print_sessions(&planner.query_today().await);
            let at_risk = planner.topics_at_risk().await;
            if !at_risk.is_empty() {
                println!("\n⚠️  At risk:");
                for topic in at_risk {
                    println!("   {} ({} min left)", topic.subject, topic.remaining_minutes);
                }
            }
        }
        Commands::Run => {
            let config = load_config(&path)?;
            let planner = Arc::new(open_planner(config).await?);
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let handle = spawn_reminder_loop(planner.clone(), shutdown_rx);

            println!("📚 Ally v{}", env!("CARGO_PKG_VERSION"));
            println!("   ⏰ Tick:    every {}s", planner.config().reminders.tick_secs);
            println!("   🔔 Targets: {}", planner.router().target_names().join(", "));
            println!("   Press Ctrl+C to stop.");

            tokio::signal::ctrl_c().await?;
            tracing::info!("🛑 Shutting down...");
            shutdown_tx.send(true).ok();
            handle.await?;
        }
        Commands::Demo => demo().await?,
    }

    Ok(())
}

/// Two exams, one week of evenings, one missed session.
async fn demo() -> Result<()> {
    let monday = Utc
        .with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
        .single()
        .context("demo start time")?;
    let clock = ManualClock::new(monday);
    let planner = StudyPlanner::new(AllyConfig::default(), Arc::new(clock.clone()));

    let slots = (0..7)
        .map(|d| {
            let start = monday + Duration::days(d) + Duration::hours(10);
            AvailabilitySlot::new(start, start + Duration::hours(2))
        })
        .collect();
    planner.set_availability(slots).await?;

    let os = Topic::new("OS", 300, 1.0, monday)
        .with_deadline(monday + Duration::days(3) + Duration::hours(1));
    let dbms = Topic::new("DBMS", 300, 1.0, monday)
        .with_deadline(monday + Duration::days(7) + Duration::hours(1));
    let sessions = planner.create_plan(vec![os, dbms], Some(7)).await?;
    println!("🗓️  Initial plan:");
    print_sessions(&sessions);

    let first = sessions.first().cloned().context("nothing was planned")?;
    clock.set(first.start - Duration::minutes(10));
    for payload in planner.tick().await {
        println!(
            "\n🔔 {} for {} at {}",
            payload.kind,
            payload.subject_name,
            payload.scheduled_time.format("%H:%M")
        );
    }

    clock.set(first.end + Duration::minutes(5));
    let (_, report) = planner.mark_missed(&first.id).await?;
    println!(
        "\n❌ Missed {} session; re-plan replaced {} and added {}:",
        first.subject,
        report.removed.len(),
        report.added.len()
    );
    print_sessions(&planner.current_plan(clock.now(), monday + Duration::days(7)).await?);

    let at_risk = planner.topics_at_risk().await;
    println!(
        "\n⚠️  At risk: {}",
        if at_risk.is_empty() {
            "none".to_string()
        } else {
            at_risk.iter().map(|t| t.subject.as_str()).collect::<Vec<_>>().join(", ")
        }
    );
    Ok(())
}
