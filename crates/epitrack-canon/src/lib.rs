//! Canonicalizers: raw daily reports and reference sources onto one schema and
//! one country vocabulary.

use thiserror::Error;

pub mod aliases;
pub mod reference;
pub mod report;

pub use aliases::{AliasBook, AliasOverrides, AliasTable};
pub use reference::{parse_flags_json, parse_population_csv, parse_population_file};
pub use report::{canonical_column, parse_last_update, parse_report_file, parse_report_reader};

pub const CRATE_NAME: &str = "epitrack-canon";

#[derive(Debug, Error)]
pub enum CanonError {
    #[error(transparent)]
    FileName(#[from] epitrack_core::ReportNameError),
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {origin}: {error}")]
    Csv {
        origin: String,
        #[source]
        error: csv::Error,
    },
    #[error("{origin} has no {column} column")]
    MissingColumn { origin: String, column: &'static str },
    #[error("{0} has no `Country Name` header row")]
    MissingPopulationHeader(String),
    #[error("{origin} has no {year} column")]
    MissingYear { origin: String, year: i32 },
    #[error("flag lookup is not a JSON object of code to name: {0}")]
    Json(#[from] serde_json::Error),
    #[error("alias file {path}: {error}")]
    Aliases {
        path: String,
        #[source]
        error: serde_yaml::Error,
    },
}

/// Trimmed cell content, with empty cells treated as missing.
pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Whole-number reading of a numeric cell: integers as-is, decimals truncated.
pub(crate) fn parse_whole(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        return Some(n);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| f.trunc() as i64)
}
