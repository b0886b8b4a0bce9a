//! One run of the ETL: sync sources, replace reference tables, append new reports.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use epitrack_canon::{parse_flags_json, parse_population_file, AliasBook};
use epitrack_storage::{write_atomic, SyncMarker};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::loader::{IncrementalLoader, LoadReport};
use crate::query::{JoinGap, QueryFacade};
use crate::sources::{PopulationOutcome, SourceSynchronizer, SyncOutcome};
use crate::store::{Store, StoreState};

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceSummary {
    pub rows: usize,
    pub duplicates_dropped: usize,
    /// Loaded from a previously stored copy because the refresh failed.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports_sync: Option<SyncOutcome>,
    pub population_sync: Option<PopulationOutcome>,
    pub population: Option<ReferenceSummary>,
    pub flags: Option<ReferenceSummary>,
    pub load: Option<LoadReport>,
    pub join_gaps: Vec<JoinGap>,
    /// Non-fatal step failures; the run carried on past each of them.
    pub failures: Vec<String>,
}

impl RunSummary {
    fn started(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            reports_sync: None,
            population_sync: None,
            population: None,
            flags: None,
            load: None,
            join_gaps: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
            || self
                .load
                .as_ref()
                .map(|l| !l.failures.is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub initialized: bool,
    pub loaded_dates: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub report_rows: i64,
    pub last_synced: Option<SyncMarker>,
}

pub struct EtlPipeline {
    config: SyncConfig,
    sources: SourceSynchronizer,
    aliases: AliasBook,
}

impl EtlPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let sources = SourceSynchronizer::new(&config)?;
        Self::with_sources(config, sources)
    }

    pub fn with_sources(config: SyncConfig, sources: SourceSynchronizer) -> Result<Self> {
        let aliases = AliasBook::load(config.aliases_file.as_deref())
            .context("loading country alias tables")?;
        Ok(Self {
            config,
            sources,
            aliases,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn open_store(&self) -> Result<Store> {
        Store::open(&self.config.database_path)
            .await
            .with_context(|| format!("opening store {}", self.config.database_path.display()))
    }

    /// Full run. Only a missing report mirror or a store integrity violation
    /// aborts; reference-source problems are recorded and the run continues.
    pub async fn run_once(&self, force: bool) -> Result<RunSummary> {
        let mut summary = RunSummary::started(Uuid::new_v4());
        info!(run_id = %summary.run_id, force, "starting run");

        let store = self.open_store().await?;
        store.ensure_schema().await.context("creating store schema")?;

        summary.reports_sync = Some(
            self.sources
                .sync_reports(summary.run_id, force)
                .await
                .context("synchronizing report mirror")?,
        );

        self.refresh_population(&store, &mut summary).await;
        self.refresh_flags(&store, &mut summary).await;

        self.load_reports(&store, &mut summary).await?;
        self.finish(&store, &mut summary).await?;
        store.close().await;
        Ok(summary)
    }

    /// Refresh the report mirror and population archive without touching the store.
    pub async fn sync_only(&self, force: bool) -> Result<RunSummary> {
        let mut summary = RunSummary::started(Uuid::new_v4());
        summary.reports_sync = Some(
            self.sources
                .sync_reports(summary.run_id, force)
                .await
                .context("synchronizing report mirror")?,
        );
        match self.sources.sync_population(summary.run_id).await {
            Ok(outcome) => summary.population_sync = Some(outcome),
            Err(err) => record_failure(&mut summary, "population", &err),
        }
        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Load whatever the local mirror holds; no network access.
    pub async fn load_offline(&self) -> Result<RunSummary> {
        let mut summary = RunSummary::started(Uuid::new_v4());
        let store = self.open_store().await?;
        store.ensure_schema().await.context("creating store schema")?;
        self.load_reports(&store, &mut summary).await?;
        self.finish(&store, &mut summary).await?;
        store.close().await;
        Ok(summary)
    }

    pub async fn status(&self) -> Result<StoreStatus> {
        let store = self.open_store().await?;
        let state = store.state().await?;
        let (initialized, dates) = match state {
            StoreState::Uninitialized => (false, BTreeSet::new()),
            StoreState::Initialized => (true, BTreeSet::new()),
            StoreState::Steady { loaded_dates } => (true, loaded_dates),
        };
        let report_rows = if initialized {
            store.report_row_count().await?
        } else {
            0
        };
        let status = StoreStatus {
            initialized,
            loaded_dates: dates.len(),
            first_date: dates.first().copied(),
            last_date: dates.last().copied(),
            report_rows,
            last_synced: self.sources.last_synced().await,
        };
        store.close().await;
        Ok(status)
    }

    async fn refresh_population(&self, store: &Store, summary: &mut RunSummary) {
        let outcome = match self.sources.sync_population(summary.run_id).await {
            Ok(outcome) => outcome,
            Err(err) => return record_failure(summary, "population", &err),
        };
        let parsed = parse_population_file(
            outcome.csv(),
            &self.aliases.population,
            self.config.population_year,
        );
        summary.population_sync = Some(outcome);
        let load = match parsed {
            Ok(load) => load,
            Err(err) => return record_failure(summary, "population", &err.into()),
        };
        match store.replace_population(&load.rows).await {
            Ok(rows) => {
                summary.population = Some(ReferenceSummary {
                    rows,
                    duplicates_dropped: load.duplicates_dropped,
                    stale: false,
                })
            }
            Err(err) => record_failure(summary, "population", &err.into()),
        }
    }

    async fn refresh_flags(&self, store: &Store, summary: &mut RunSummary) {
        let payload = match self.sources.fetch_flags(summary.run_id).await {
            Ok(payload) => payload,
            Err(err) => return record_failure(summary, "flags", &err),
        };
        let load = match parse_flags_json(&payload.bytes, &self.aliases.flags) {
            Ok(load) => load,
            Err(err) => return record_failure(summary, "flags", &err.into()),
        };
        match store.replace_flags(&load.rows).await {
            Ok(rows) => {
                summary.flags = Some(ReferenceSummary {
                    rows,
                    duplicates_dropped: load.duplicates_dropped,
                    stale: payload.stale,
                })
            }
            Err(err) => record_failure(summary, "flags", &err.into()),
        }
    }

    async fn load_reports(&self, store: &Store, summary: &mut RunSummary) -> Result<()> {
        let reports_dir = self.config.reports_dir();
        let load = IncrementalLoader::new(store, &self.aliases.reports)
            .load_directory(&reports_dir)
            .await
            .with_context(|| format!("loading reports from {}", reports_dir.display()))?;
        summary.load = Some(load);
        Ok(())
    }

    async fn finish(&self, store: &Store, summary: &mut RunSummary) -> Result<()> {
        summary.join_gaps = QueryFacade::new(store)
            .join_gaps()
            .await
            .context("computing join gaps")?;
        summary.finished_at = Utc::now();

        let path = self
            .config
            .runs_dir()
            .join(summary.run_id.to_string())
            .join("run_summary.json");
        write_atomic(&path, &serde_json::to_vec_pretty(summary)?).await?;

        let load = summary.load.clone().unwrap_or_default();
        info!(
            run_id = %summary.run_id,
            files_loaded = load.files_loaded,
            files_skipped = load.files_skipped,
            rows_inserted = load.rows_inserted,
            join_gaps = summary.join_gaps.len(),
            failures = summary.failures.len() + load.failures.len(),
            summary = %path.display(),
            "run finished"
        );
        Ok(())
    }
}

fn record_failure(summary: &mut RunSummary, step: &str, err: &anyhow::Error) {
    warn!(step, error = %format!("{err:#}"), "step failed, continuing");
    summary.failures.push(format!("{step}: {err:#}"));
}

pub async fn run_once_from_env(force: bool) -> Result<RunSummary> {
    EtlPipeline::new(SyncConfig::from_env())?
        .run_once(force)
        .await
}
