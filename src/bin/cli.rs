//! warc-indexer CLI
//!
//! Runs the indexing strategies against a local storage directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use warc_indexer::{
    error::{AppError, Result},
    lock::LockManager,
    models::Config,
    pipeline::{PipelineDeps, PipelineRuntime},
    rules::{AccessControl, SurtFilter},
    services::HtmlExtractor,
    storage::{LocalStorage, RuleFile},
    strategy::{
        FullReindex, IndexingDomain, OnDemandIndexing, PeriodicIndexing, RuleRecheck, RunWindow,
    },
};

/// warc-indexer - staged indexing for web-archive records
#[derive(Parser, Debug)]
#[command(
    name = "warc-indexer",
    version,
    about = "Index web-archive records into a search sink"
)]
struct Cli {
    /// Path to storage directory containing config, records and index
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate configuration and rule files
    Validate,

    /// Index one record and print the tracked document
    Index {
        record: u64,

        /// Offset of the document to return
        #[arg(long)]
        offset: Option<u64>,
    },

    /// Sweep the record range to completion
    Reindex {
        /// Lowest record id (overrides config)
        #[arg(long)]
        min: Option<u64>,

        /// Highest record id (overrides config)
        #[arg(long)]
        max: Option<u64>,
    },

    /// Index new records inside the configured window until Ctrl-C
    Periodic,

    /// Re-apply changed access rules to committed documents
    Rules {
        /// Run daily at the configured time until Ctrl-C
        #[arg(long)]
        schedule: bool,
    },

    /// List the lock table
    Locks {
        /// Remove expired locks first
        #[arg(long)]
        expire: bool,
    },

    /// Show persisted cursors
    Info,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn load_rules(config: &Config, storage_dir: &Path) -> Result<(SurtFilter, AccessControl)> {
    let surt_filter = match &config.rules.surt_filter {
        Some(path) => SurtFilter::load(storage_dir.join(path))?,
        None => SurtFilter::default(),
    };
    let access = match &config.rules.access_rules {
        Some(path) => AccessControl::load(storage_dir.join(path))?,
        None => AccessControl::default(),
    };
    Ok((surt_filter, access))
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.storage_dir.join("config.toml");
    let mut config = Config::load_or_default(&config_path);
    log::info!("Loaded configuration from {}", cli.storage_dir.display());

    let storage = Arc::new(LocalStorage::new(&cli.storage_dir));
    let locks = Arc::new(LockManager::from_config(storage.clone(), &config.locks));

    match cli.command {
        Command::Validate => {
            log::info!("Validating configuration...");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            RunWindow::from_config(&config.periodic)?;
            let (surt_filter, access) = load_rules(&config, &cli.storage_dir)?;
            log::info!(
                "✓ Config OK ({} filter rules, {} access rules)",
                surt_filter.len(),
                access.len()
            );
        }

        Command::Locks { expire } => {
            if expire {
                let removed = locks.expire_stale(Utc::now()).await?;
                log::info!("Removed {} expired locks", removed);
            }
            let now = Utc::now();
            let table = locks.store().list().await?;
            if table.is_empty() {
                log::info!("No locks held.");
            }
            for lock in table {
                log::info!(
                    "{} held by {} since {} ({})",
                    lock.key,
                    lock.holder,
                    lock.acquired_at,
                    if lock.is_live(now) { "live" } else { "expired" }
                );
            }
        }

        Command::Rules { schedule } => {
            config.validate()?;
            let feed = config
                .rule_recheck
                .feed
                .as_ref()
                .or(config.rules.access_rules.as_ref())
                .ok_or_else(|| AppError::config("no access rule file configured"))?;
            let domain = Arc::new(RuleRecheck::new(
                config.rule_recheck.clone(),
                config.indexing_disabled,
                storage.clone(),
                storage.clone(),
                Arc::new(RuleFile::new(cli.storage_dir.join(feed))),
            )?);

            if schedule {
                Arc::clone(&domain).start().await?;
                tokio::signal::ctrl_c().await?;
                log::info!("Interrupted, stopping after the current rule...");
                domain.stop().await?;
            } else if config.indexing_disabled {
                return Err(AppError::indexing_disabled(domain.name()));
            } else {
                domain.run_once().await?;
            }
            log::info!(
                "{}: {} documents rewritten, {}",
                domain.name(),
                domain.update_count(),
                domain.last_id_processed()
            );
        }

        Command::Info => {
            log::info!("Storage directory: {}", cli.storage_dir.display());
            let cursors = storage.list_cursors().await?;
            if cursors.is_empty() {
                log::info!("No cursors persisted yet.");
            }
            for cursor in cursors {
                log::info!(
                    "{}: warc#{} (updated {})",
                    cursor.name,
                    cursor.last_id,
                    cursor.updated_at
                );
            }
        }

        command => {
            if let Command::Reindex { min, max } = &command {
                if let Some(min) = min {
                    config.full_reindex.min_id = *min;
                }
                if max.is_some() {
                    config.full_reindex.max_id = *max;
                }
            }
            config.validate()?;

            let (surt_filter, access) = load_rules(&config, &cli.storage_dir)?;
            let runtime = Arc::new(PipelineRuntime::new(
                config.pipeline.clone(),
                PipelineDeps {
                    surt_filter,
                    access,
                    locks: Arc::clone(&locks),
                    sink: storage.clone(),
                    extractor: Arc::new(HtmlExtractor),
                },
            ));
            let keepalive = Arc::clone(&locks).spawn_keepalive(
                Duration::from_millis(config.locks.keepalive_ms),
                Duration::from_millis(config.locks.sweep_interval_ms),
            );

            let outcome = run_strategy(command, &config, &runtime, &storage).await;

            runtime.shutdown().await;
            keepalive.stop().await;
            outcome?;
        }
    }

    log::info!("Done!");

    Ok(())
}

async fn run_strategy(
    command: Command,
    config: &Config,
    runtime: &Arc<PipelineRuntime>,
    storage: &Arc<LocalStorage>,
) -> Result<()> {
    match command {
        Command::Index { record, offset } => {
            let domain = Arc::new(OnDemandIndexing::new(
                config.on_demand.clone(),
                config.indexing_disabled,
                Arc::clone(runtime),
                storage.clone(),
            ));
            Arc::clone(&domain).start().await?;
            let result = domain.index(record, offset).await;
            domain.stop().await?;
            println!("{}", result?);
        }

        Command::Reindex { .. } => {
            let domain = FullReindex::new(
                config.full_reindex.clone(),
                config.indexing_disabled,
                Arc::clone(runtime),
                storage.clone(),
                storage.clone(),
            );
            domain.run().await?;
            log::info!("{}: {}", domain.name(), domain.last_id_processed());
        }

        Command::Periodic => {
            let domain = Arc::new(PeriodicIndexing::new(
                config.periodic.clone(),
                config.indexing_disabled,
                Arc::clone(runtime),
                storage.clone(),
                storage.clone(),
            )?);
            Arc::clone(&domain).start().await?;

            tokio::signal::ctrl_c().await?;
            log::info!("Interrupted, stopping after in-flight records...");
            domain.stop().await?;
            log::info!(
                "{}: {} records, last {}",
                domain.name(),
                domain.update_count(),
                domain.last_id_processed()
            );
        }

        other => {
            return Err(AppError::config(format!("{:?} is not a strategy command", other)));
        }
    }
    Ok(())
}
