//! Read-only projections over the loaded store.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use epitrack_core::{flag_url, STORE_DATE_FORMAT, STORE_TIMESTAMP_FORMAT};
use serde::Serialize;
use sqlx::Row;
use strsim::jaro_winkler;
use tracing::warn;

use crate::store::{LoadError, ReferenceTable, Store};

/// Minimum Jaro-Winkler score for a join-gap suggestion.
pub const SUGGESTION_THRESHOLD: f64 = 0.85;

const LATEST_BY_COUNTRY: &str = "
WITH
    max_date AS (
        SELECT MAX(file_date) AS file_date FROM reports
    ),
    by_country AS (
        SELECT
            country_region,
            file_date,
            SUM(confirmed) AS confirmed,
            SUM(deaths) AS deaths,
            SUM(recovered) AS recovered,
            SUM(active) AS active
        FROM reports
        JOIN max_date USING (file_date)
        GROUP BY country_region, file_date
    )
SELECT
    by_country.country_region AS country_region,
    by_country.file_date AS file_date,
    by_country.confirmed AS confirmed,
    by_country.deaths AS deaths,
    by_country.recovered AS recovered,
    by_country.active AS active,
    population.population AS population,
    flags.iso_3166 AS iso_3166
FROM by_country
JOIN population USING (country_region)
JOIN flags USING (country_region)
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub confirmed: i64,
    pub deaths: i64,
    pub recovered: i64,
    pub active: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorldwideTotals {
    pub file_date: NaiveDate,
    #[serde(flatten)]
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountryRollup {
    pub country_region: String,
    pub file_date: NaiveDate,
    #[serde(flatten)]
    pub totals: Totals,
    pub population: Option<i64>,
    pub iso_3166: Option<String>,
}

impl CountryRollup {
    pub fn flag_url(&self) -> Option<String> {
        self.iso_3166.as_deref().map(flag_url)
    }

    /// Confirmed cases per 100k inhabitants, when population is known.
    pub fn confirmed_per_100k(&self) -> Option<f64> {
        self.population
            .filter(|p| *p > 0)
            .map(|p| self.totals.confirmed as f64 * 100_000.0 / p as f64)
    }
}

/// A reported country that an inner join against a reference table loses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinGap {
    pub country_region: String,
    pub missing_from: &'static str,
    pub suggestion: Option<String>,
    pub score: Option<f64>,
}

pub struct QueryFacade<'a> {
    store: &'a Store,
}

impl<'a> QueryFacade<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn latest_file_date(&self) -> Result<Option<NaiveDate>, LoadError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT MAX(file_date) FROM reports")
            .fetch_one(self.store.pool())
            .await?;
        raw.map(|raw| parse_date(&raw)).transpose()
    }

    /// Sum of every row at the newest report date.
    pub async fn worldwide_totals(&self) -> Result<Option<WorldwideTotals>, LoadError> {
        let Some(file_date) = self.latest_file_date().await? else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(confirmed), 0) AS confirmed,
                COALESCE(SUM(deaths), 0) AS deaths,
                COALESCE(SUM(recovered), 0) AS recovered,
                COALESCE(SUM(active), 0) AS active
             FROM reports WHERE file_date = ?",
        )
        .bind(file_date.format(STORE_DATE_FORMAT).to_string())
        .fetch_one(self.store.pool())
        .await?;
        Ok(Some(WorldwideTotals {
            file_date,
            totals: totals_from(&row)?,
        }))
    }

    /// Newest-date totals per country joined with population and flag code.
    /// Countries missing from either reference table are excluded.
    pub async fn latest_by_country(&self) -> Result<Vec<CountryRollup>, LoadError> {
        let rows = sqlx::query(&format!("{LATEST_BY_COUNTRY} ORDER BY by_country.country_region"))
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(rollup_from).collect()
    }

    pub async fn country(&self, name: &str) -> Result<Option<CountryRollup>, LoadError> {
        let row = sqlx::query(&format!(
            "{LATEST_BY_COUNTRY} WHERE by_country.country_region = ?"
        ))
        .bind(name)
        .fetch_optional(self.store.pool())
        .await?;
        row.as_ref().map(rollup_from).transpose()
    }

    /// Most recent upstream `last_update` across all rows, as UTC.
    pub async fn last_update(&self) -> Result<Option<DateTime<Utc>>, LoadError> {
        let raw: Option<String> = sqlx::query_scalar("SELECT MAX(last_update) FROM reports")
            .fetch_one(self.store.pool())
            .await?;
        Ok(raw
            .and_then(|raw| NaiveDateTime::parse_from_str(&raw, STORE_TIMESTAMP_FORMAT).ok())
            .map(|ts| ts.and_utc()))
    }

    /// Countries in the newest snapshot absent from a reference table, each
    /// with the closest name that table does have.
    pub async fn join_gaps(&self) -> Result<Vec<JoinGap>, LoadError> {
        let reported: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT country_region FROM reports
             WHERE file_date = (SELECT MAX(file_date) FROM reports)
             ORDER BY country_region",
        )
        .fetch_all(self.store.pool())
        .await?;

        let mut gaps = Vec::new();
        for table in [ReferenceTable::Population, ReferenceTable::Flags] {
            let (label, sql) = match table {
                ReferenceTable::Population => ("population", "SELECT country_region FROM population"),
                ReferenceTable::Flags => ("flags", "SELECT country_region FROM flags"),
            };
            let known: Vec<String> = sqlx::query_scalar(sql)
                .fetch_all(self.store.pool())
                .await?;
            for country in &reported {
                if known.iter().any(|k| k == country) {
                    continue;
                }
                let best = closest(country, &known);
                warn!(
                    country = %country,
                    missing_from = label,
                    suggestion = best.as_ref().map(|(s, _)| s.as_str()).unwrap_or("-"),
                    "reported country has no reference match"
                );
                gaps.push(JoinGap {
                    country_region: country.clone(),
                    missing_from: label,
                    score: best.as_ref().map(|(_, score)| *score),
                    suggestion: best.map(|(s, _)| s),
                });
            }
        }
        Ok(gaps)
    }
}

fn closest(name: &str, candidates: &[String]) -> Option<(String, f64)> {
    candidates
        .iter()
        .map(|c| (c, jaro_winkler(&name.to_lowercase(), &c.to_lowercase())))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, score)| (c.clone(), score))
}

fn parse_date(raw: &str) -> Result<NaiveDate, LoadError> {
    NaiveDate::parse_from_str(raw, STORE_DATE_FORMAT)
        .map_err(|_| LoadError::BadStoredDate(raw.to_string()))
}

fn totals_from(row: &sqlx::sqlite::SqliteRow) -> Result<Totals, LoadError> {
    Ok(Totals {
        confirmed: row.try_get("confirmed")?,
        deaths: row.try_get("deaths")?,
        recovered: row.try_get("recovered")?,
        active: row.try_get("active")?,
    })
}

fn rollup_from(row: &sqlx::sqlite::SqliteRow) -> Result<CountryRollup, LoadError> {
    let file_date: String = row.try_get("file_date")?;
    Ok(CountryRollup {
        country_region: row.try_get("country_region")?,
        file_date: parse_date(&file_date)?,
        totals: totals_from(row)?,
        population: row.try_get("population")?,
        iso_3166: row.try_get("iso_3166")?,
    })
}
