use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use epitrack_sync::{EtlPipeline, QueryFacade, RunSummary, SyncConfig, SyncOutcome};

#[derive(Debug, Parser)]
#[command(name = "epitrack")]
#[command(about = "Incremental loader for daily epidemic reports and reference data")]
struct Cli {
    /// Show info-level logs (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every source, replace reference tables and load new reports.
    Run {
        /// Refresh the report mirror even inside the cooldown.
        #[arg(long)]
        force: bool,
    },
    /// Refresh the report mirror and population archive only.
    Sync {
        #[arg(long)]
        force: bool,
    },
    /// Load reports from the local mirror without network access.
    Load,
    /// Latest totals, worldwide or for one country.
    Summary {
        #[arg(long)]
        country: Option<String>,
    },
    /// Store state and last sync.
    Status,
}

fn init_tracing(cli: &Cli) {
    let fallback = if cli.verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| fallback.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let pipeline = EtlPipeline::new(SyncConfig::from_env())?;
    tracing::debug!(
        data_dir = %pipeline.config().data_dir.display(),
        database = %pipeline.config().database_path.display(),
        "configuration loaded"
    );
    match cli.command.unwrap_or(Commands::Run { force: false }) {
        Commands::Run { force } => finish(pipeline.run_once(force).await?),
        Commands::Sync { force } => finish(pipeline.sync_only(force).await?),
        Commands::Load => finish(pipeline.load_offline().await?),
        Commands::Summary { country } => summary(&pipeline, country.as_deref()).await,
        Commands::Status => {
            let status = pipeline.status().await?;
            if !status.initialized {
                println!("store: not initialized ({})", pipeline.config().database_path.display());
            } else {
                match (status.first_date, status.last_date) {
                    (Some(first), Some(last)) => println!(
                        "store: {} report dates ({first} .. {last}), {} rows",
                        status.loaded_dates, status.report_rows
                    ),
                    _ => println!("store: initialized, no reports loaded"),
                }
            }
            match status.last_synced {
                Some(marker) => println!("last sync: {} (run {})", marker.synced_at, marker.run_id),
                None => println!("last sync: never"),
            }
            Ok(())
        }
    }
}

fn finish(summary: RunSummary) -> Result<()> {
    println!("run {}", summary.run_id);
    if let Some(sync) = &summary.reports_sync {
        println!("  reports mirror: {}", outcome_label(sync));
    }
    if let Some(population) = &summary.population {
        println!("  population: {} countries", population.rows);
    }
    if let Some(flags) = &summary.flags {
        let stale = if flags.stale { " (stale copy)" } else { "" };
        println!("  flags: {} countries{stale}", flags.rows);
    }
    if let Some(load) = &summary.load {
        println!(
            "  reports: {} new files, {} rows, {} skipped, {} duplicates dropped, {} rows rejected",
            load.files_loaded,
            load.rows_inserted,
            load.files_skipped,
            load.duplicates_dropped,
            load.rows_rejected
        );
        for failure in &load.failures {
            println!("  failed: {} ({})", failure.file, failure.reason);
        }
    }
    for gap in &summary.join_gaps {
        match &gap.suggestion {
            Some(suggestion) => println!(
                "  join gap: {} not in {} (did you mean {suggestion:?}?)",
                gap.country_region, gap.missing_from
            ),
            None => println!("  join gap: {} not in {}", gap.country_region, gap.missing_from),
        }
    }
    for failure in &summary.failures {
        println!("  failed: {failure}");
    }
    if summary.has_failures() {
        bail!("run {} finished with failures", summary.run_id);
    }
    Ok(())
}

fn outcome_label(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Cloned => "cloned".to_string(),
        SyncOutcome::Updated => "updated".to_string(),
        SyncOutcome::Cooldown { last_synced } => {
            format!("fresh (last synced {last_synced})")
        }
        SyncOutcome::Stale { reason } => format!("stale, refresh failed: {reason}"),
    }
}

async fn summary(pipeline: &EtlPipeline, country: Option<&str>) -> Result<()> {
    let store = pipeline.open_store().await?;
    store.ensure_schema().await?;
    let facade = QueryFacade::new(&store);

    if let Some(updated) = facade.last_update().await? {
        println!("last update: {updated}");
    }
    match country {
        Some(name) => match facade.country(name).await? {
            Some(rollup) => {
                println!(
                    "{} on {}: confirmed {} deaths {} recovered {} active {}",
                    rollup.country_region,
                    rollup.file_date,
                    rollup.totals.confirmed,
                    rollup.totals.deaths,
                    rollup.totals.recovered,
                    rollup.totals.active
                );
                if let Some(per_100k) = rollup.confirmed_per_100k() {
                    println!("  confirmed per 100k: {per_100k:.1}");
                }
                if let Some(url) = rollup.flag_url() {
                    println!("  flag: {url}");
                }
            }
            None => bail!("{name} has no joined rollup in the latest snapshot"),
        },
        None => {
            match facade.worldwide_totals().await? {
                Some(world) => println!(
                    "worldwide on {}: confirmed {} deaths {} recovered {} active {}",
                    world.file_date,
                    world.totals.confirmed,
                    world.totals.deaths,
                    world.totals.recovered,
                    world.totals.active
                ),
                None => println!("no reports loaded"),
            }
            for rollup in facade.latest_by_country().await? {
                println!(
                    "  {:<32} {:>12} {:>10}",
                    rollup.country_region, rollup.totals.confirmed, rollup.totals.deaths
                );
            }
        }
    }
    store.close().await;
    Ok(())
}
