//! spb-engine - command-line entry point
//!
//! Each subcommand is one bounded invocation against the shared SQLite
//! store. `ingest` is what the host scheduler runs on its timer; `analyze`
//! either drains the work queue or runs the consumer pool until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use spb_common::config::{self, TomlConfig};
use spb_common::db::init_database;
use spb_common::events::EventBus;
use sqlx::SqlitePool;
use tokio::signal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spb_engine::db::{cursors, items, meetings};
use spb_engine::queue::{QueueStats, WorkQueue};
use spb_engine::search::{SearchEngine, SearchFilters};
use spb_engine::services::{
    Analyzer, AnalyzerPool, AnthropicClient, Deduplicator, IngestConfig, IngestCursor, Ingestor,
    LegistarClient, MeetingSource, PoolConfig,
};

/// Command-line arguments for spb-engine
#[derive(Parser, Debug)]
#[command(name = "spb-engine")]
#[command(about = "Civic meeting ingestion, AI enrichment and search")]
#[command(version)]
struct Args {
    /// Config file (overrides SPB_CONFIG and the default search path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull one batch of meetings from the source and persist what changed
    Ingest {
        /// Give up (without advancing the cursor) after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Enrich queued agenda items
    Analyze {
        /// Stop once no message is visible instead of polling forever
        #[arg(long)]
        drain: bool,

        /// Number of concurrent workers (overrides [analyzer] workers)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Keyword search over agenda items
    Search {
        query: String,

        /// Only return items carrying this topic (repeatable)
        #[arg(long = "topic")]
        topics: Vec<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// List dead-lettered work messages
    DeadLetters {
        /// Move this message back onto the live queue
        #[arg(long)]
        requeue: Option<String>,
    },

    /// Store and queue counts
    Stats,

    /// Write a config file populated with defaults
    InitConfig {
        /// Destination (defaults to ./spb.toml)
        path: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct StatsOutput {
    meetings: i64,
    items: i64,
    enriched_items: i64,
    queue: QueueStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::InitConfig { path } = &args.command {
        let path = path.clone().unwrap_or_else(|| PathBuf::from("spb.toml"));
        config::write_toml_config(&TomlConfig::default(), &path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let toml_config = config::resolve_config(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing: RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&toml_config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let db_path = config::resolve_database_path(args.database.as_deref(), &toml_config);
    info!("Database: {}", db_path.display());

    let pool = init_database(&db_path).await.context("Failed to open database")?;
    let events = EventBus::default();

    match args.command {
        Command::Ingest { deadline_secs } => run_ingest(&toml_config, pool, events, deadline_secs).await,
        Command::Analyze { drain, workers } => run_analyze(&toml_config, pool, events, drain, workers).await,
        Command::Search { query, topics, limit } => {
            run_search(&toml_config, pool, events, &query, SearchFilters { topics }, limit).await
        }
        Command::DeadLetters { requeue } => run_dead_letters(&toml_config, pool, requeue).await,
        Command::Stats => run_stats(&toml_config, pool).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

fn work_queue(config: &TomlConfig, pool: SqlitePool) -> WorkQueue {
    WorkQueue::new(
        pool,
        Duration::from_secs(config.queue.visibility_timeout_secs),
        Duration::from_secs(config.queue.retry_base_delay_secs),
    )
}

async fn run_ingest(config: &TomlConfig, pool: SqlitePool, events: EventBus, deadline_secs: Option<u64>) -> Result<()> {
    let source: Arc<dyn MeetingSource> =
        Arc::new(LegistarClient::new(&config.source).context("Failed to build Legistar client")?);
    let source_name = source.source_name().to_string();

    let cursor = cursors::load_cursor(&pool, &source_name)
        .await?
        .map(|token| token.parse::<IngestCursor>())
        .transpose()
        .context("Stored ingest cursor is invalid")?;

    let ingestor = Ingestor::new(
        source,
        Deduplicator::new(pool.clone()),
        events,
        IngestConfig::from(&config.source),
    );
    let deadline = deadline_secs.map(|secs| Instant::now() + Duration::from_secs(secs));

    let (next_cursor, report) = ingestor.ingest(cursor, deadline).await?;

    if next_cursor != cursor {
        let token = next_cursor.map(|c| c.to_string());
        cursors::save_cursor(&pool, &source_name, token.as_deref()).await?;
        info!(cursor = token.as_deref().unwrap_or("none"), "Ingest cursor saved");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_analyze(
    config: &TomlConfig,
    pool: SqlitePool,
    events: EventBus,
    drain: bool,
    workers: Option<usize>,
) -> Result<()> {
    let api_key = config::resolve_api_key(config)?;
    let provider = AnthropicClient::new(&config.enrichment, api_key).context("Failed to build enrichment client")?;

    let analyzer = Arc::new(Analyzer::new(
        pool.clone(),
        Arc::new(provider),
        events.clone(),
        config.queue.max_receives,
    ));

    let mut pool_config = PoolConfig::from(&config.analyzer);
    if let Some(workers) = workers {
        pool_config.workers = workers.max(1);
    }

    let analyzer_pool = Arc::new(AnalyzerPool::new(
        analyzer,
        work_queue(config, pool.clone()),
        events.clone(),
        pool_config,
    ));

    let report = if drain {
        analyzer_pool.drain().await?
    } else {
        let search = Arc::new(
            SearchEngine::open(pool, events, Duration::from_secs(config.search.refresh_interval_secs)).await?,
        );
        let cancel = CancellationToken::new();
        let refresher = search.spawn_refresher(cancel.clone());

        let shutdown = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });

        let report = analyzer_pool.run(cancel.clone()).await;
        cancel.cancel();
        if let Err(e) = refresher.await {
            tracing::warn!(error = %e, "Search refresher task failed");
        }
        report?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_search(
    config: &TomlConfig,
    pool: SqlitePool,
    events: EventBus,
    query: &str,
    filters: SearchFilters,
    limit: usize,
) -> Result<()> {
    let engine = SearchEngine::open(pool, events, Duration::from_secs(config.search.refresh_interval_secs)).await?;
    let hits = engine.search(query, &filters, limit).await;
    println!("{}", serde_json::to_string_pretty(&hits)?);
    Ok(())
}

async fn run_dead_letters(config: &TomlConfig, pool: SqlitePool, requeue: Option<String>) -> Result<()> {
    let queue = work_queue(config, pool);

    if let Some(message_id) = requeue {
        queue
            .requeue_dead_letter(&message_id)
            .await
            .with_context(|| format!("Failed to requeue {}", message_id))?;
        println!("Requeued {}", message_id);
        return Ok(());
    }

    let dead = queue.list_dead_letters().await?;
    println!("{}", serde_json::to_string_pretty(&dead)?);
    Ok(())
}

async fn run_stats(config: &TomlConfig, pool: SqlitePool) -> Result<()> {
    let output = StatsOutput {
        meetings: meetings::count(&pool).await?,
        items: items::count(&pool).await?,
        enriched_items: items::count_enriched(&pool).await?,
        queue: work_queue(config, pool).stats().await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
