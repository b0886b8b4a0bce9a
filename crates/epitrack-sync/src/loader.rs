use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use epitrack_canon::{parse_report_file, AliasTable};
use epitrack_core::{file_date_from_path, ParsedReport};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::store::{LoadError, Store};

/// A report file that could not be loaded; the rest of the run continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub files_seen: usize,
    pub files_skipped: usize,
    pub files_loaded: usize,
    /// Files that parsed to zero rows; nothing is committed so they are seen again next run.
    pub files_empty: usize,
    pub rows_inserted: usize,
    pub duplicates_dropped: usize,
    pub rows_rejected: usize,
    pub failures: Vec<FileFailure>,
    pub loaded_dates: Vec<NaiveDate>,
}

impl LoadReport {
    /// True when the pass changed nothing in the report table.
    pub fn is_noop(&self) -> bool {
        self.rows_inserted == 0 && self.files_loaded == 0
    }
}

/// Appends report files whose date is not yet in the store.
pub struct IncrementalLoader<'a> {
    store: &'a Store,
    aliases: &'a AliasTable,
}

impl<'a> IncrementalLoader<'a> {
    pub fn new(store: &'a Store, aliases: &'a AliasTable) -> Self {
        Self { store, aliases }
    }

    /// Load every `*.csv` in `dir`, oldest report date first.
    pub async fn load_directory(&self, dir: &Path) -> Result<LoadReport, LoadError> {
        let files = report_files(dir).await?;
        self.load_files(&files).await
    }

    pub async fn load_files(&self, files: &[PathBuf]) -> Result<LoadReport, LoadError> {
        self.store.ensure_schema().await?;
        let mut watermark = self.store.watermark().await?;
        let mut report = LoadReport::default();

        let mut dated = Vec::with_capacity(files.len());
        for path in files {
            report.files_seen += 1;
            match file_date_from_path(path) {
                Ok(file_date) => dated.push((file_date, path)),
                Err(err) => {
                    warn!(file = %path.display(), error = %err, "skipping report file with unusable name");
                    report.failures.push(FileFailure {
                        file: path.display().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        dated.sort();

        for (file_date, path) in dated {
            if watermark.contains(&file_date) {
                debug!(%file_date, "already loaded, skipping");
                report.files_skipped += 1;
                continue;
            }

            let span = info_span!("load_file", %file_date);
            let parsed = match parse_report_file(path, self.aliases) {
                Ok(parsed) => parsed,
                Err(err) => {
                    span.in_scope(|| warn!(file = %path.display(), error = %err, "report file failed to parse"));
                    report.failures.push(FileFailure {
                        file: path.display().to_string(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            self.insert(&parsed, &mut report).instrument(span).await?;
            watermark.insert(file_date);
        }

        if report.files_loaded > 0 {
            info!(
                files_loaded = report.files_loaded,
                rows_inserted = report.rows_inserted,
                files_skipped = report.files_skipped,
                "report load complete"
            );
        } else {
            info!(
                files_skipped = report.files_skipped,
                files_empty = report.files_empty,
                "no new report files"
            );
        }
        Ok(report)
    }

    /// Load already-canonicalized reports, applying the same watermark rule.
    pub async fn load_parsed(&self, reports: &[ParsedReport]) -> Result<LoadReport, LoadError> {
        self.store.ensure_schema().await?;
        let mut watermark = self.store.watermark().await?;
        let mut report = LoadReport::default();

        for parsed in reports {
            report.files_seen += 1;
            if !watermark.insert(parsed.file_date) {
                debug!(file_date = %parsed.file_date, "already loaded, skipping");
                report.files_skipped += 1;
                continue;
            }
            let span = info_span!("load_file", file_date = %parsed.file_date);
            self.insert(parsed, &mut report).instrument(span).await?;
        }
        Ok(report)
    }

    async fn insert(&self, parsed: &ParsedReport, report: &mut LoadReport) -> Result<(), LoadError> {
        if parsed.rows.is_empty() {
            debug!(source = %parsed.source, rows_rejected = parsed.rows_rejected, "report file has no rows, nothing to commit");
            report.files_empty += 1;
            return Ok(());
        }
        let inserted = self.store.insert_report(parsed).await?;
        debug!(source = %parsed.source, rows = inserted, "committed report file");
        report.files_loaded += 1;
        report.rows_inserted += inserted;
        report.duplicates_dropped += parsed.duplicates_dropped;
        report.rows_rejected += parsed.rows_rejected;
        report.loaded_dates.push(parsed.file_date);
        Ok(())
    }
}

/// The `*.csv` files directly inside `dir`.
pub async fn report_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let io_err = |source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        let is_csv = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv && entry.file_type().await.map_err(io_err)?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
