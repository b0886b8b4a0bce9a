//! SQLite persistence for reports and reference tables.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use epitrack_core::{
    FlagRow, NaturalKey, ParsedReport, PopulationRow, ReportRow, STORE_DATE_FORMAT,
    STORE_TIMESTAMP_FORMAT,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, info};

const CREATE_REPORTS: &str = "CREATE TABLE IF NOT EXISTS reports (
    file_date TEXT NOT NULL,
    country_region TEXT NOT NULL,
    province_state TEXT,
    admin2 TEXT,
    last_update TEXT,
    confirmed INTEGER NOT NULL,
    deaths INTEGER NOT NULL,
    recovered INTEGER NOT NULL,
    active INTEGER NOT NULL,
    fips INTEGER,
    latitude REAL,
    longitude REAL,
    combined_key TEXT,
    incidence_rate REAL,
    case_fatality_ratio REAL,
    extra TEXT
)";

// NULLs are distinct under a plain UNIQUE constraint; fold them for the key.
const CREATE_REPORTS_KEY: &str = "CREATE UNIQUE INDEX IF NOT EXISTS reports_natural_key
    ON reports (file_date, country_region, IFNULL(province_state, ''), IFNULL(admin2, ''))";

const CREATE_POPULATION: &str = "CREATE TABLE IF NOT EXISTS population (
    country_region TEXT PRIMARY KEY NOT NULL,
    population INTEGER
)";

const CREATE_FLAGS: &str = "CREATE TABLE IF NOT EXISTS flags (
    country_region TEXT PRIMARY KEY NOT NULL,
    iso_3166 TEXT
)";

const INSERT_REPORT: &str = "INSERT INTO reports (
    file_date, country_region, province_state, admin2, last_update,
    confirmed, deaths, recovered, active,
    fips, latitude, longitude, combined_key, incidence_rate, case_fatality_ratio, extra
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("report {file_date} violates the natural key at {key}; file load rolled back")]
    Integrity { file_date: NaiveDate, key: String },
    #[error("stored file_date {0:?} is not YYYY-MM-DD")]
    BadStoredDate(String),
    #[error("creating {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Canon(#[from] epitrack_canon::CanonError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreState {
    /// No report table yet.
    Uninitialized,
    /// Schema exists but no report has been loaded.
    Initialized,
    Steady { loaded_dates: BTreeSet<NaiveDate> },
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, LoadError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LoadError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        debug!(path = %path.display(), "opened store");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn state(&self) -> Result<StoreState, LoadError> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'reports'",
        )
        .fetch_one(&self.pool)
        .await?;
        if exists == 0 {
            return Ok(StoreState::Uninitialized);
        }
        let loaded_dates = self.watermark().await?;
        if loaded_dates.is_empty() {
            Ok(StoreState::Initialized)
        } else {
            Ok(StoreState::Steady { loaded_dates })
        }
    }

    /// Create every table and the natural-key index if missing.
    pub async fn ensure_schema(&self) -> Result<(), LoadError> {
        for statement in [CREATE_REPORTS, CREATE_REPORTS_KEY, CREATE_POPULATION, CREATE_FLAGS] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Distinct report dates actually committed.
    pub async fn watermark(&self) -> Result<BTreeSet<NaiveDate>, LoadError> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT DISTINCT file_date FROM reports")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|raw| {
                NaiveDate::parse_from_str(&raw, STORE_DATE_FORMAT)
                    .map_err(|_| LoadError::BadStoredDate(raw))
            })
            .collect()
    }

    /// Append one file's rows as a single transaction.
    ///
    /// A natural-key collision aborts and rolls back the whole file.
    pub async fn insert_report(&self, report: &ParsedReport) -> Result<usize, LoadError> {
        let mut tx = self.pool.begin().await?;
        for row in &report.rows {
            if let Err(err) = insert_row(&mut tx, row).await {
                let is_unique =
                    matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation());
                tx.rollback().await?;
                if is_unique {
                    return Err(LoadError::Integrity {
                        file_date: report.file_date,
                        key: row.natural_key().to_string(),
                    });
                }
                return Err(err.into());
            }
        }
        tx.commit().await?;
        Ok(report.rows.len())
    }

    /// Drop and recreate the population table from `rows`.
    pub async fn replace_population(&self, rows: &[PopulationRow]) -> Result<usize, LoadError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS population")
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_POPULATION).execute(&mut *tx).await?;
        for row in rows {
            sqlx::query("INSERT INTO population (country_region, population) VALUES (?, ?)")
                .bind(&row.country_region)
                .bind(row.population)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(rows = rows.len(), "replaced population table");
        Ok(rows.len())
    }

    /// Drop and recreate the flags table from `rows`.
    pub async fn replace_flags(&self, rows: &[FlagRow]) -> Result<usize, LoadError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS flags")
            .execute(&mut *tx)
            .await?;
        sqlx::query(CREATE_FLAGS).execute(&mut *tx).await?;
        for row in rows {
            sqlx::query("INSERT INTO flags (country_region, iso_3166) VALUES (?, ?)")
                .bind(&row.country_region)
                .bind(&row.iso_3166)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        info!(rows = rows.len(), "replaced flags table");
        Ok(rows.len())
    }

    pub async fn report_row_count(&self) -> Result<i64, LoadError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM reports")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn table_row_count(&self, table: ReferenceTable) -> Result<i64, LoadError> {
        let sql = match table {
            ReferenceTable::Population => "SELECT COUNT(*) FROM population",
            ReferenceTable::Flags => "SELECT COUNT(*) FROM flags",
        };
        Ok(sqlx::query_scalar(sql).fetch_one(&self.pool).await?)
    }

    /// Natural keys stored for one date, in key order.
    pub async fn keys_for_date(&self, file_date: NaiveDate) -> Result<Vec<NaturalKey>, LoadError> {
        let rows = sqlx::query(
            "SELECT country_region, province_state, admin2 FROM reports
             WHERE file_date = ? ORDER BY country_region, province_state, admin2",
        )
        .bind(file_date.format(STORE_DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut keys = rows
            .iter()
            .map(|row| NaturalKey {
                file_date,
                country_region: row.get("country_region"),
                province_state: row.get("province_state"),
                admin2: row.get("admin2"),
            })
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceTable {
    Population,
    Flags,
}

async fn insert_row(tx: &mut Transaction<'_, Sqlite>, row: &ReportRow) -> Result<(), sqlx::Error> {
    sqlx::query(INSERT_REPORT)
        .bind(row.file_date.format(STORE_DATE_FORMAT).to_string())
        .bind(&row.country_region)
        .bind(&row.province_state)
        .bind(&row.admin2)
        .bind(
            row.last_update
                .map(|ts| ts.format(STORE_TIMESTAMP_FORMAT).to_string()),
        )
        .bind(row.confirmed)
        .bind(row.deaths)
        .bind(row.recovered)
        .bind(row.active)
        .bind(row.fips)
        .bind(row.latitude)
        .bind(row.longitude)
        .bind(&row.combined_key)
        .bind(row.incidence_rate)
        .bind(row.case_fatality_ratio)
        .bind(row.extra_json())
        .execute(&mut **tx)
        .await?;
    Ok(())
}
