//! Core domain model for the epitrack daily-report pipeline.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "epitrack-core";

/// Filename convention of upstream daily report files (`04-15-2021.csv`).
pub const REPORT_FILE_DATE_FORMAT: &str = "%m-%d-%Y";

/// Storage format for report dates.
pub const STORE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Storage format for upstream update timestamps.
pub const STORE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The four cumulative integer metrics every report row carries.
pub const METRIC_COLUMNS: [&str; 4] = ["confirmed", "deaths", "recovered", "active"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportNameError {
    #[error("report file {0} has no file name")]
    MissingName(String),
    #[error("report file {file} is not named MM-DD-YYYY.csv")]
    BadDate { file: String },
}

/// Derive the report's as-of date from its filename stem.
///
/// In-file timestamps are ignored on purpose: their format and meaning
/// changed several times upstream.
pub fn file_date_from_path(path: impl AsRef<Path>) -> Result<NaiveDate, ReportNameError> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ReportNameError::MissingName(path.display().to_string()))?;
    let stem = name
        .strip_suffix(".csv")
        .or_else(|| name.strip_suffix(".CSV"))
        .ok_or_else(|| ReportNameError::BadDate {
            file: name.to_string(),
        })?;
    NaiveDate::parse_from_str(stem, REPORT_FILE_DATE_FORMAT).map_err(|_| ReportNameError::BadDate {
        file: name.to_string(),
    })
}

/// Identity of one observation: one geographic unit on one report date.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub file_date: NaiveDate,
    pub country_region: String,
    pub province_state: Option<String>,
    pub admin2: Option<String>,
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.file_date.format(STORE_DATE_FORMAT),
            self.country_region,
            self.province_state.as_deref().unwrap_or("-"),
            self.admin2.as_deref().unwrap_or("-")
        )
    }
}

/// Cumulative case statistics for a geographic unit on one report date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub file_date: NaiveDate,
    pub country_region: String,
    pub province_state: Option<String>,
    pub admin2: Option<String>,
    pub last_update: Option<NaiveDateTime>,
    pub confirmed: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub active: i64,
    pub fips: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub combined_key: Option<String>,
    pub incidence_rate: Option<f64>,
    pub case_fatality_ratio: Option<f64>,
    /// Columns outside the canonical schema, passed through verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ReportRow {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            file_date: self.file_date,
            country_region: self.country_region.clone(),
            province_state: self.province_state.clone(),
            admin2: self.admin2.clone(),
        }
    }

    /// `extra` as a JSON object, or `None` when there is nothing to carry.
    pub fn extra_json(&self) -> Option<String> {
        if self.extra.is_empty() {
            None
        } else {
            serde_json::to_string(&self.extra).ok()
        }
    }
}

/// Canonical rows of one upstream report file plus its parse diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedReport {
    pub file_date: NaiveDate,
    pub source: String,
    pub rows: Vec<ReportRow>,
    /// Rows dropped because an earlier row had the same natural key.
    pub duplicates_dropped: usize,
    /// Rows dropped because they had no country at all.
    pub rows_rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationRow {
    pub country_region: String,
    pub population: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagRow {
    pub country_region: String,
    pub iso_3166: String,
}

impl FlagRow {
    pub fn flag_url(&self) -> String {
        flag_url(&self.iso_3166)
    }
}

/// Flag image for a two-letter territory code.
pub fn flag_url(iso_3166: &str) -> String {
    format!(
        "https://raw.githubusercontent.com/hjnilsson/country-flags/master/svg/{}.svg",
        iso_3166.to_ascii_lowercase()
    )
}

/// A reference table after canonicalization, keyed uniquely by country.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLoad<T> {
    pub rows: Vec<T>,
    /// Source rows whose canonical country repeated an earlier row.
    pub duplicates_dropped: usize,
}
