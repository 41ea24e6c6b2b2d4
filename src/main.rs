//! Lamad Progression CLI
//!
//! Runs the progression engine over JSON files, for inspecting plans and
//! learner snapshots outside the application.
//!
//! ## Usage
//!
//! ```bash
//! # Flat activity list and resume position
//! lamad-progression index --plan plan.json
//!
//! # Full view of one activity
//! lamad-progression evaluate --plan plan.json --snapshot snapshot.json --activity quiz-3
//!
//! # Evaluate a different stage than the activity's own
//! lamad-progression evaluate --plan plan.json --snapshot snapshot.json --activity quiz-3 --stage apply
//!
//! # Usage accounting for 95 seconds on top of a stored total of 120
//! lamad-progression simulate-usage --seconds 95 --server-total 120
//!
//! # Same, on a live timer (tick_interval_ms from the config)
//! lamad-progression simulate-usage --seconds 20 --realtime
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lamad_progression::config::default_config_path;
use lamad_progression::events::spawn_logging_listener;
use lamad_progression::usage::TimerRegistry;
use lamad_progression::{
    normalize, Config, EventBus, InMemoryUsageLedger, PlanDoc, ProgressSnapshot,
    ProgressionEngine, Stage, UsageKey, UsageLedger, UsageSession, UsageTimer,
};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lamad-progression")]
#[command(about = "Progression engine for Lamad study plans")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "LAMAD_PROGRESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Override the quiz pass ratio (0..=1)
    #[arg(long, env = "LAMAD_PASS_RATIO")]
    pass_ratio: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Index a plan and print its flat activity list
    Index {
        /// Plan document (JSON)
        #[arg(long)]
        plan: PathBuf,
    },

    /// Evaluate one activity against a progress snapshot
    Evaluate {
        /// Plan document (JSON)
        #[arg(long)]
        plan: PathBuf,
        /// Progress snapshot (JSON)
        #[arg(long)]
        snapshot: PathBuf,
        /// Activity id
        #[arg(long)]
        activity: String,
        /// Selected stage (defaults to the activity's stage)
        #[arg(long)]
        stage: Option<Stage>,
    },

    /// Simulate usage accounting against an in-memory ledger
    SimulateUsage {
        /// Seconds on the clock
        #[arg(long)]
        seconds: u64,
        /// Total already stored in the ledger
        #[arg(long, default_value = "0")]
        server_total: u64,
        /// Override the lump size in seconds
        #[arg(long)]
        lump_size: Option<u64>,
        /// Drive a real timer at the configured tick interval
        #[arg(long)]
        realtime: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("lamad_progression=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(ratio) = args.pass_ratio {
        config.pass_ratio = ratio;
    }
    if let Commands::SimulateUsage {
        lump_size: Some(lump),
        ..
    } = &args.command
    {
        config.lump_size_secs = *lump;
    }
    config.validate()?;

    debug!(config = ?config, "Configuration loaded");

    match args.command {
        Commands::Index { plan } => run_index(&plan),
        Commands::Evaluate {
            plan,
            snapshot,
            activity,
            stage,
        } => run_evaluate(config, &plan, &snapshot, &activity, stage),
        Commands::SimulateUsage {
            seconds,
            server_total,
            realtime: false,
            ..
        } => run_simulate_usage(&config, seconds, server_total).await,
        Commands::SimulateUsage {
            seconds,
            server_total,
            realtime: true,
            ..
        } => run_realtime_usage(&config, seconds, server_total).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let path = default_config_path();
            if path.exists() {
                info!(path = %path.display(), "Using default config file");
                Ok(Config::load(&path)?)
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn read_plan(path: &Path) -> anyhow::Result<PlanDoc> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    Ok(PlanDoc::from_json(&content)?)
}

fn run_index(plan_path: &Path) -> anyhow::Result<()> {
    let plan = normalize(&read_plan(plan_path)?);

    let output = json!({
        "planId": plan.plan_id(),
        "activities": plan.flat,
        "completion": plan.completion(),
        "resume": plan.resume_cursor(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_evaluate(
    config: Config,
    plan_path: &Path,
    snapshot_path: &Path,
    activity_id: &str,
    stage: Option<Stage>,
) -> anyhow::Result<()> {
    let plan = normalize(&read_plan(plan_path)?);
    let content = std::fs::read_to_string(snapshot_path)
        .with_context(|| format!("failed to read snapshot {}", snapshot_path.display()))?;
    let snapshot = ProgressSnapshot::from_json(&content)?;

    let engine = ProgressionEngine::new(config);
    let view = engine.evaluate(&plan, activity_id, stage, &snapshot)?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn run_simulate_usage(
    config: &Config,
    seconds: u64,
    server_total: u64,
) -> anyhow::Result<()> {
    let key = UsageKey::new("cli", "simulation", "activity");
    let ledger = Arc::new(InMemoryUsageLedger::new());
    if server_total > 0 {
        ledger.add_usage(&key, server_total).await?;
    }

    let mut session = UsageSession::new(
        key.clone(),
        server_total,
        config.lump_size_secs,
        ledger.clone(),
    );
    let mut flushes = Vec::new();

    for second in 1..=seconds {
        let outcome = session.on_tick();
        if let Some(amount) = outcome.flush {
            session.settle().await;
            flushes.push(json!({
                "second": second,
                "seconds": amount,
                "displaySeconds": outcome.display_seconds,
            }));
        }
    }
    session.settle().await;

    let ledger_total = ledger.total(&key).await?;
    let teardown = session.finish(config.flush_remainder_on_stop);

    let output = json!({
        "key": key.to_string(),
        "lumpSize": config.lump_size_secs,
        "flushes": flushes,
        "ledgerTotal": ledger_total,
        "teardown": teardown,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_realtime_usage(
    config: &Config,
    seconds: u64,
    server_total: u64,
) -> anyhow::Result<()> {
    let key = UsageKey::new("cli", "simulation", "activity");
    let ledger = Arc::new(InMemoryUsageLedger::new());
    if server_total > 0 {
        ledger.add_usage(&key, server_total).await?;
    }

    let events = Arc::new(EventBus::with_capacity(config.event_capacity));
    let audit = spawn_logging_listener(&events);

    let ticks = u32::try_from(seconds).context("--seconds is too large for a realtime run")?;
    let run_for = config
        .tick_interval()
        .saturating_mul(ticks)
        .saturating_add(config.tick_interval() / 2);

    let registry = TimerRegistry::new();
    let session = UsageSession::new(
        key.clone(),
        server_total,
        config.lump_size_secs,
        ledger.clone(),
    )
    .with_events(events.clone());
    let timer = UsageTimer::start(&registry, session, config.tick_interval())?;

    // Half a tick of slack so the last tick lands before stopping
    tokio::time::sleep(run_for).await;

    let teardown = timer.stop(config.flush_remainder_on_stop).await?;
    audit.abort();
    let output = json!({
        "key": key.to_string(),
        "lumpSize": config.lump_size_secs,
        "ledgerTotal": ledger.total(&key).await?,
        "teardown": teardown,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
