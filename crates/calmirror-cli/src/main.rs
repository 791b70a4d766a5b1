//! Thin shell over the synchronize entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use calmirror::{CalendarClient, EventTime, SqliteEventStore, SyncEngine, SyncMode, SyncOutcome};

#[derive(Parser)]
#[command(name = "calmirror", about = "Locally cached mirror of a remote calendar")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Synchronize a user's upcoming window and print it.
    Sync {
        /// User identity the cache is partitioned by.
        #[arg(long)]
        user: String,
        /// Force a full resynchronization.
        #[arg(long)]
        full: bool,
        /// Path to the cache database.
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Sync { user, full, db } => sync(&user, full, db).await,
    }
}

async fn sync(user: &str, full: bool, db: Option<PathBuf>) -> Result<()> {
    let token =
        std::env::var("CALMIRROR_TOKEN").context("CALMIRROR_TOKEN environment variable not set")?;
    let db_path = match db {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let store = SqliteEventStore::new(&db_path)?;
    let engine = SyncEngine::new(CalendarClient::new(&token)?, store);
    let outcome = engine.synchronize(user, full).await?;

    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    if let Some(warning) = &outcome.warning {
        eprintln!("warning: {warning}");
    }

    let mode = match outcome.mode {
        SyncMode::Full => "full sync",
        SyncMode::Incremental => "incremental sync",
        SyncMode::CacheFallback => "cached",
    };
    println!("{} events ({}, {} updated)", outcome.events.len(), mode, outcome.updated());

    for event in &outcome.events {
        let start = match &event.start {
            Some(EventTime::DateTime(dt)) => dt.format("%Y-%m-%d %H:%M").to_string(),
            Some(EventTime::Date(d)) => format!("{d} (all day)"),
            None => "(no start)".to_string(),
        };
        println!("  {}  {}", start, event.summary.as_deref().unwrap_or("(untitled)"));
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine a data directory")?;
    Ok(base.join("calmirror").join("cache.db"))
}
