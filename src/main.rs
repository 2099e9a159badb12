//! Regional query engine - command line entry point
//!
//! Loads a JSON dataset into the in-memory store and runs one engine
//! operation against it. All results are printed as JSON on stdout; logs go
//! to stderr.

use clap::{Parser, Subcommand};
use regional_query_engine::{
    config::EngineConfig,
    error::ErrorReporter,
    logging::{init_logging, LogConfig},
    query::{PageRequest, QueryEngine, QueryFilters, SearchInput},
    search::{NumericRange, QueryPreferences},
    sharding::{MigrationMode, Region},
    storage::InMemoryStore,
    QueryError, Result,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// Regional query engine CLI
#[derive(Parser, Debug)]
#[command(name = "rqe")]
#[command(about = "Resilient, regionally sharded query engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(long, global = true, env = "RQE_CONFIG")]
    config: Option<PathBuf>,

    /// JSON array of documents loaded into the source collection
    #[arg(long, global = true, env = "RQE_DATASET")]
    dataset: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Partition the source collection by region
    Migrate {
        /// Classify and count without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch one page of documents
    Page {
        /// Regions to read (repeatable); all when omitted
        #[arg(long = "region")]
        regions: Vec<Region>,

        /// Items per page; 0 uses the configured default
        #[arg(long, default_value_t = 0)]
        page_size: usize,

        /// Cursor returned by the previous page
        #[arg(long)]
        cursor: Option<String>,

        #[arg(long)]
        include_deleted: bool,

        /// Migrate into partitions before reading
        #[arg(long)]
        migrate: bool,
    },
    /// Ranked search
    Search {
        /// Free-text preferences, e.g. "local 7 commercial 30-50 +perDiem"
        #[arg(long, conflicts_with_all = ["groups", "categories", "min", "max", "flags"])]
        text: Option<String>,

        #[arg(long = "group")]
        groups: Vec<i64>,

        #[arg(long = "category")]
        categories: Vec<String>,

        #[arg(long)]
        min: Option<f64>,

        #[arg(long)]
        max: Option<f64>,

        /// Boolean fields that must be true
        #[arg(long = "flag")]
        flags: Vec<String>,

        #[arg(long = "region")]
        regions: Vec<Region>,

        #[arg(long, default_value_t = 0)]
        limit: usize,

        /// Migrate into partitions before searching
        #[arg(long)]
        migrate: bool,
    },
    /// Fetch one document by id
    Get { id: String },
    /// Print engine statistics
    Stats,
    /// Print the effective configuration as TOML
    ShowConfig,
}

impl Cli {
    fn log_config(&self, config: &EngineConfig) -> LogConfig {
        let mut log_config = LogConfig::from(&config.logging).with_env_overrides();
        if self.debug {
            log_config.level = Level::DEBUG;
        }
        log_config
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_store(dataset: Option<&PathBuf>, collection: &str) -> Result<Arc<InMemoryStore>> {
    let store = Arc::new(InMemoryStore::new());
    if let Some(path) = dataset {
        let raw = tokio::fs::read_to_string(path).await?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let loaded = store
            .load_json(collection, value)
            .await
            .map_err(QueryError::from)?;
        info!(loaded, path = %path.display(), "Dataset loaded");
    } else {
        warn!("No dataset given, the store is empty");
    }
    Ok(store)
}

async fn migrate(engine: &QueryEngine, mode: MigrationMode) -> Result<()> {
    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling migration");
            ctrl_c.cancel();
        }
    });

    let report = engine
        .run_migration(mode, token, |line| info!("{line}"))
        .await?;
    info!("{}", report.summary());
    print_json(&report)
}

async fn run(cli: Cli, config: EngineConfig) -> Result<()> {
    if let Command::ShowConfig = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let store = load_store(cli.dataset.as_ref(), &config.schema.collection).await?;
    let engine = QueryEngine::new(config, store)?;

    match cli.command {
        Command::Migrate { dry_run } => {
            let mode = if dry_run {
                MigrationMode::DryRun
            } else {
                MigrationMode::Live
            };
            migrate(&engine, mode).await
        }
        Command::Page {
            regions,
            page_size,
            cursor,
            include_deleted,
            migrate: migrate_first,
        } => {
            if migrate_first {
                migrate(&engine, MigrationMode::Live).await?;
            }
            let request = PageRequest {
                filters: QueryFilters {
                    regions: regions.into_iter().collect(),
                    include_deleted,
                    ..Default::default()
                },
                page_size,
                cursor,
            };
            print_json(&engine.get_page(request).await?)
        }
        Command::Search {
            text,
            groups,
            categories,
            min,
            max,
            flags,
            regions,
            limit,
            migrate: migrate_first,
        } => {
            if migrate_first {
                migrate(&engine, MigrationMode::Live).await?;
            }
            let input = match text {
                Some(text) => SearchInput::Text(text),
                None => SearchInput::Preferences(QueryPreferences {
                    preferred_groups: groups,
                    categories,
                    numeric_range: (min.is_some() || max.is_some())
                        .then(|| NumericRange::new(min, max)),
                    required_flags: flags,
                    regions: regions.into_iter().collect(),
                }),
            };
            print_json(&engine.search(input, limit).await)
        }
        Command::Get { id } => print_json(&engine.get_document(&id).await?),
        Command::Stats => print_json(&engine.get_statistics().await),
        Command::ShowConfig => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref())?;
    init_logging(cli.log_config(&config))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rqe");

    if let Err(error) = run(cli, config).await {
        ErrorReporter::log_error(&error, "cli", "run");
        print_json(&ErrorReporter::format_api_error(&error))?;
        std::process::exit(1);
    }
    Ok(())
}
