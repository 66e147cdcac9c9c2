use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use gfscreen::cli::{parse_delimiter, Cli, Commands};
use gfscreen::company::{CompanyKey, LifecycleState};
use gfscreen::config::{self, AppConfig, ConfigError};
use gfscreen::documents::{DocumentStore, FsDocumentStore};
use gfscreen::export;
use gfscreen::fetcher::{ConfiguredSource, Fetcher};
use gfscreen::import;
use gfscreen::interrupt::InterruptFlag;
use gfscreen::logger::{self, VerbosityLevel};
use gfscreen::pipeline::{Pipeline, PipelineSettings};
use gfscreen::qualification::QualificationRule;
use gfscreen::rate_limit::RateGovernor;
use gfscreen::retention;
use gfscreen::store::WorkStore;

/// Exit status after Ctrl-C (128 + SIGINT)
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.validate() {
        eprintln!("Invalid arguments: {}", e);
        std::process::exit(2);
    }

    logger::init(VerbosityLevel::from_verbose_count(cli.verbose), cli.log_file.as_deref())?;

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(config::CONFIG_PATH));

    if let Commands::Init = cli.command {
        let path = AppConfig::create_default_config_at(&config_path)
            .context("Failed to create configuration file")?;
        println!("Created default configuration file at: {}", path.display());
        return Ok(());
    }

    let app_config = load_config(&config_path, cli.config.is_some())?;

    let interrupt = InterruptFlag::new();
    let handler_flag = interrupt.clone();
    ctrlc::set_handler(move || {
        if handler_flag.is_interrupted() {
            eprintln!("\nSecond interrupt, exiting immediately. Leases are reclaimed on the next run.");
            std::process::exit(EXIT_INTERRUPTED);
        }
        handler_flag.interrupt();
        eprintln!("\nInterrupt received. Finishing the current item; press Ctrl-C again to force exit.");
    })
    .unwrap_or_else(|e| {
        warn!("Failed to set Ctrl-C handler: {}. Interrupt signals may not be handled gracefully.", e);
    });

    let store = WorkStore::open(&app_config.store.database_path, app_config.retry.clone()).context(format!(
        "Failed to open work store at {}",
        app_config.store.database_path.display()
    ))?;

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Import { file, delimiter } => {
            let delimiter = delimiter
                .as_deref()
                .map(parse_delimiter)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            run_import(&store, &file, delimiter)
        }
        Commands::Fetch { limit } => {
            let pipeline = build_pipeline(&app_config, store, interrupt)?;
            let report = pipeline.run_fetch(limit).await?;
            println!("{}", report);
            exit_if_interrupted(report.interrupted);
            Ok(())
        }
        Commands::Parse { limit } => {
            let pipeline = build_pipeline(&app_config, store, interrupt)?;
            let report = pipeline.run_parse(limit).await?;
            println!("{}", report);
            exit_if_interrupted(report.interrupted);
            Ok(())
        }
        Commands::Run { limit } => {
            let pipeline = build_pipeline(&app_config, store, interrupt)?;
            let report = pipeline.run(limit).await?;
            println!("{}", report);
            let interrupted = report.fetch.interrupted || report.parse.as_ref().is_some_and(|p| p.interrupted);
            exit_if_interrupted(interrupted);
            Ok(())
        }
        Commands::Status { events } => show_status(&app_config, &store, events),
        Commands::Export { output } => {
            let count = export::export_qualified(&store, &output)?;
            println!("Exported {} qualified companies to {}", count, output.display());
            Ok(())
        }
        Commands::Requeue { key, phase } => {
            let key = CompanyKey::from(key.trim());
            let replaced = store
                .reset(&key, phase.reset_kind())
                .context(format!("Failed to requeue {}", key))?;
            if let Some(handle) = replaced {
                let documents = FsDocumentStore::open(&app_config.store.documents_dir)?;
                if let Err(e) = documents.remove(&handle) {
                    warn!("Could not delete replaced document {}: {}", handle.location, e);
                }
            }
            println!("{} requeued for {}", key, phase.phase());
            Ok(())
        }
        Commands::Purge { max_age_days, dry_run } => {
            let documents = FsDocumentStore::open(&app_config.store.documents_dir)?;
            let days = max_age_days.unwrap_or(app_config.retention.max_age_days);
            let report = retention::purge(&store, &documents, days, dry_run)?;
            println!("{}", report);
            if !report.failed.is_empty() {
                bail!("{} document(s) could not be deleted", report.failed.len());
            }
            Ok(())
        }
    }
}

/// Load the configuration; an explicitly named file must exist
fn load_config(path: &Path, explicit: bool) -> Result<AppConfig> {
    match AppConfig::load_from_path(path) {
        Ok(config) => {
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        }
        Err(ConfigError::FileNotFound(missing)) if !explicit => match AppConfig::prompt_create_config(&missing) {
            Ok(Some(created)) => {
                println!("Created default configuration file at: {}", created.display());
                Ok(AppConfig::load_from_path(&created)?)
            }
            Ok(None) => {
                warn!(
                    "No configuration file at {}; using built-in defaults (run `gfscreen init` to create one)",
                    missing.display()
                );
                let config: AppConfig = toml::from_str(config::DEFAULT_CONFIG)?;
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(e).context("Failed to create configuration file"),
        },
        Err(e) => {
            error!("Configuration error: {}", e);
            Err(e).context(format!("Failed to load configuration from {}", path.display()))
        }
    }
}

fn build_pipeline(
    config: &AppConfig,
    store: WorkStore,
    interrupt: InterruptFlag,
) -> Result<Pipeline<ConfiguredSource, WorkStore>> {
    let source = ConfiguredSource::from_config(&config.fetch).context("Failed to build HTTP client")?;
    let documents: Arc<dyn DocumentStore> = Arc::new(
        FsDocumentStore::open(&config.store.documents_dir).context(format!(
            "Failed to open document directory {}",
            config.store.documents_dir.display()
        ))?,
    );
    let governor = RateGovernor::new(store.clone(), &config.rate_limit).with_interrupt(interrupt.clone());
    let fetcher = Fetcher::new(source, governor, documents);

    Ok(Pipeline::new(
        store,
        fetcher,
        QualificationRule::from_config(&config.qualification, &config.extraction),
        PipelineSettings::from_config(config),
        interrupt,
    ))
}

fn run_import(store: &WorkStore, file: &Path, delimiter: Option<u8>) -> Result<()> {
    let batch = import::read_company_file(file, delimiter)?;
    for skipped in &batch.skipped {
        warn!("Line {} skipped: {}", skipped.line, skipped.reason);
    }

    let summary = store
        .upsert_companies(&batch.companies)
        .context("Failed to store imported companies")?;

    println!(
        "Imported {} companies ({} new, {} updated, {} rows skipped)",
        batch.companies.len(),
        summary.inserted,
        summary.updated,
        batch.skipped.len()
    );
    Ok(())
}

fn show_status(config: &AppConfig, store: &WorkStore, events: usize) -> Result<()> {
    let stats = store.stats()?;
    print!("{}", stats);

    let waiting = stats.count(LifecycleState::Pending) + stats.count(LifecycleState::FetchFailed);
    if waiting > 0 {
        let hours = waiting as f64 * config.rate_limit.min_spacing_secs as f64 / 3600.0;
        println!("Estimated fetch time remaining: {:.1} h ({:.1} days)", hours, hours / 24.0);
    }

    let governor = RateGovernor::new(store.clone(), &config.rate_limit);
    let state = governor.snapshot()?;
    println!(
        "Rate window: {}/{} lookups in the last {}s",
        state.grants.len(),
        config.rate_limit.max_per_window,
        config.rate_limit.window_secs
    );
    let next = state.next_allowed(Utc::now(), &config.rate_limit);
    if next > Utc::now() {
        println!("Next lookup allowed at {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(blocked) = state.blocked_until {
        println!("Register access paused until {}", blocked.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if events > 0 {
        let recent = store.recent_events(events)?;
        if !recent.is_empty() {
            println!("\nRecent events:");
            for event in recent {
                println!(
                    "  {} {:<8} {:<12} {} {}",
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    event.phase,
                    event.status,
                    event.key,
                    event.message
                );
            }
        }
    }
    Ok(())
}

fn exit_if_interrupted(interrupted: bool) {
    if interrupted {
        eprintln!("Interrupted; run the same command again to resume.");
        std::process::exit(EXIT_INTERRUPTED);
    }
}
