//! Daily report file -> canonical report rows.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use epitrack_core::{file_date_from_path, ParsedReport, ReportRow};
use tracing::{debug, warn};

use crate::aliases::AliasTable;
use crate::{non_empty, parse_whole, CanonError};

/// Upstream header variants seen across format eras, onto the canonical names.
const COLUMN_RENAMES: &[(&str, &str)] = &[
    ("Province/State", "Province_State"),
    ("Country/Region", "Country_Region"),
    ("Last Update", "Last_Update"),
    ("Lat", "Latitude"),
    ("Long_", "Longitude"),
    ("Incident_Rate", "Incidence_Rate"),
    ("Case-Fatality_Ratio", "Case_Fatality_Ratio"),
];

/// Lower-cased canonical columns that map onto typed `ReportRow` fields.
const TYPED_COLUMNS: &[&str] = &[
    "country_region",
    "province_state",
    "admin2",
    "last_update",
    "confirmed",
    "deaths",
    "recovered",
    "active",
    "fips",
    "latitude",
    "longitude",
    "combined_key",
    "incidence_rate",
    "case_fatality_ratio",
];

// Two-digit-year forms come first: `%Y` would happily read "20" as year 20.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%y %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%y", "%m/%d/%Y"];

/// Rename a raw header onto the canonical schema and lower-case it.
/// Headers outside the rename table are only lower-cased.
pub fn canonical_column(header: &str) -> String {
    let trimmed = header.trim_start_matches('\u{feff}').trim();
    let renamed = COLUMN_RENAMES
        .iter()
        .find(|(from, _)| *from == trimmed)
        .map(|(_, to)| *to)
        .unwrap_or(trimmed);
    renamed.to_lowercase()
}

/// Best-effort parse of upstream's own update timestamp; `None` when unusable.
pub fn parse_last_update(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let raw = raw.trim_end_matches('Z');
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Cumulative counts are whole and never negative; anything unusable is zero.
fn parse_count(raw: Option<&str>) -> i64 {
    non_empty(raw).and_then(parse_whole).unwrap_or(0).max(0)
}

fn parse_real(raw: Option<&str>) -> Option<f64> {
    non_empty(raw)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|f| f.is_finite())
}

struct ColumnIndex {
    names: Vec<String>,
    positions: BTreeMap<String, usize>,
}

impl ColumnIndex {
    fn new(names: Vec<String>) -> Self {
        let mut positions = BTreeMap::new();
        for (i, name) in names.iter().enumerate() {
            positions.entry(name.clone()).or_insert(i);
        }
        Self { names, positions }
    }

    fn get(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    fn cell<'r>(&self, record: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        self.get(name).and_then(|i| record.get(i))
    }

    fn extra_columns(&self) -> Vec<(usize, &str)> {
        self.positions
            .iter()
            .filter(|(name, _)| !name.is_empty() && !TYPED_COLUMNS.contains(&name.as_str()))
            .map(|(name, i)| (*i, name.as_str()))
            .collect()
    }
}

/// Parse one daily report file. The report date comes from the filename.
pub fn parse_report_file(path: &Path, aliases: &AliasTable) -> Result<ParsedReport, CanonError> {
    let file_date = file_date_from_path(path)?;
    let file = File::open(path).map_err(|source| CanonError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_report_reader(file_date, &path.display().to_string(), file, aliases)
}

/// Parse report CSV content already known to belong to `file_date`.
pub fn parse_report_reader<R: Read>(
    file_date: NaiveDate,
    origin: &str,
    reader: R,
    aliases: &AliasTable,
) -> Result<ParsedReport, CanonError> {
    let csv_error = |error: csv::Error| CanonError::Csv {
        origin: origin.to_string(),
        error,
    };

    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = csv
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(canonical_column)
        .collect::<Vec<_>>();
    let columns = ColumnIndex::new(headers);
    if columns.get("country_region").is_none() {
        return Err(CanonError::MissingColumn {
            origin: origin.to_string(),
            column: "country_region",
        });
    }
    let extras = columns.extra_columns();

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    let mut duplicates_dropped = 0usize;
    let mut rows_rejected = 0usize;

    for (line, record) in csv.records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(origin, line = line + 2, error = %err, "skipping unreadable report row");
                rows_rejected += 1;
                continue;
            }
        };

        let Some(raw_country) = non_empty(columns.cell(&record, "country_region")) else {
            rows_rejected += 1;
            continue;
        };
        let country_region = aliases.canonicalize(raw_country).to_string();

        let row = ReportRow {
            file_date,
            country_region,
            province_state: non_empty(columns.cell(&record, "province_state")).map(str::to_string),
            admin2: non_empty(columns.cell(&record, "admin2")).map(str::to_string),
            last_update: columns
                .cell(&record, "last_update")
                .and_then(parse_last_update),
            confirmed: parse_count(columns.cell(&record, "confirmed")),
            deaths: parse_count(columns.cell(&record, "deaths")),
            recovered: parse_count(columns.cell(&record, "recovered")),
            active: parse_count(columns.cell(&record, "active")),
            fips: non_empty(columns.cell(&record, "fips")).and_then(parse_whole),
            latitude: parse_real(columns.cell(&record, "latitude")),
            longitude: parse_real(columns.cell(&record, "longitude")),
            combined_key: non_empty(columns.cell(&record, "combined_key")).map(str::to_string),
            incidence_rate: parse_real(columns.cell(&record, "incidence_rate")),
            case_fatality_ratio: parse_real(columns.cell(&record, "case_fatality_ratio")),
            extra: extras
                .iter()
                .filter_map(|(i, name)| {
                    record
                        .get(*i)
                        .filter(|v| !v.trim().is_empty())
                        .map(|v| (name.to_string(), v.to_string()))
                })
                .collect(),
        };

        // Keyed on the canonical country so two spellings of one country
        // cannot both survive into the store.
        if !seen.insert(row.natural_key()) {
            duplicates_dropped += 1;
            continue;
        }
        rows.push(row);
    }

    if duplicates_dropped > 0 {
        warn!(origin, duplicates_dropped, "dropped duplicate natural keys");
    }
    if rows_rejected > 0 {
        warn!(origin, rows_rejected, "dropped rows without a country");
    }
    debug!(origin, rows = rows.len(), columns = columns.names.len(), "parsed report");

    Ok(ParsedReport {
        file_date,
        source: origin.to_string(),
        rows,
        duplicates_dropped,
        rows_rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AliasBook;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn parse(file_date: NaiveDate, csv: &str) -> ParsedReport {
        parse_report_reader(file_date, "test.csv", csv.as_bytes(), &AliasBook::builtin().reports)
            .expect("parse")
    }

    #[test]
    fn early_format_headers_are_renamed_and_lowercased() {
        assert_eq!(canonical_column("Province/State"), "province_state");
        assert_eq!(canonical_column("\u{feff}Province/State"), "province_state");
        assert_eq!(canonical_column("Last Update"), "last_update");
        assert_eq!(canonical_column("Long_"), "longitude");
        assert_eq!(canonical_column("Case-Fatality_Ratio"), "case_fatality_ratio");
        assert_eq!(canonical_column("Combined_Key"), "combined_key");
        assert_eq!(canonical_column("Something New"), "something new");
    }

    #[test]
    fn timestamps_from_every_era_parse() {
        let expect = |s: &str, y, mo, d, h, mi| {
            assert_eq!(
                parse_last_update(s),
                date(y, mo, d).and_hms_opt(h, mi, 0),
                "{s}"
            );
        };
        expect("1/22/2020 17:00", 2020, 1, 22, 17, 0);
        expect("3/22/20 23:45", 2020, 3, 22, 23, 45);
        expect("2020-02-01T19:43:03", 2020, 2, 1, 19, 43);
        expect("2020-03-22 23:45:00", 2020, 3, 22, 23, 45);
        expect("2021-04-16", 2021, 4, 16, 0, 0);
        assert_eq!(parse_last_update("yesterday-ish"), None);
        assert_eq!(parse_last_update(""), None);
    }

    #[test]
    fn file_date_comes_from_filename_not_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("04-15-2021.csv");
        std::fs::write(
            &path,
            "Country_Region,Last_Update,Confirmed\nChad,2021-04-16 04:20:50,4734\n",
        )
        .unwrap();

        let parsed = parse_report_file(&path, &AliasBook::builtin().reports).unwrap();
        assert_eq!(parsed.file_date, date(2021, 4, 15));
        assert_eq!(parsed.rows[0].file_date, date(2021, 4, 15));
        assert_eq!(
            parsed.rows[0].last_update,
            date(2021, 4, 16).and_hms_opt(4, 20, 50)
        );
    }

    #[test]
    fn badly_named_file_is_rejected_before_reading() {
        let err = parse_report_file(Path::new("/nonexistent/latest.csv"), &AliasBook::builtin().reports)
            .unwrap_err();
        assert!(matches!(err, CanonError::FileName(_)));
    }

    #[test]
    fn duplicate_natural_keys_keep_first_and_are_counted() {
        let parsed = parse(
            date(2020, 3, 1),
            "Province/State,Country/Region,Last Update,Confirmed,Deaths,Recovered\n\
             ,US,2020-03-01T10:00:00,30,1,7\n\
             , US ,2020-03-01T11:00:00,31,1,7\n\
             Hubei,Mainland China,2020-03-01T10:00:00,66907,2761,31536\n",
        );

        assert_eq!(parsed.duplicates_dropped, 1);
        assert_eq!(parsed.rows.len(), 2);
        let us = &parsed.rows[0];
        assert_eq!(us.country_region, "United States");
        assert_eq!(us.province_state, None);
        assert_eq!(us.admin2, None);
        assert_eq!(us.confirmed, 30);
        assert_eq!(parsed.rows[1].country_region, "China");
    }

    #[test]
    fn two_spellings_of_one_country_collapse_to_one_row() {
        let parsed = parse(
            date(2020, 3, 10),
            "Country/Region,Confirmed\nUS,1\nUnited States,2\n",
        );
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].confirmed, 1);
        assert_eq!(parsed.duplicates_dropped, 1);
    }

    #[test]
    fn metrics_are_zero_filled_whole_and_non_negative() {
        let parsed = parse(
            date(2020, 6, 1),
            "Country_Region,Confirmed,Deaths,Active\n\
             Chad,12.0,,-3\n\
             Niger,7.9,abc,4\n",
        );

        let chad = &parsed.rows[0];
        assert_eq!((chad.confirmed, chad.deaths, chad.recovered, chad.active), (12, 0, 0, 0));
        let niger = &parsed.rows[1];
        assert_eq!((niger.confirmed, niger.deaths, niger.recovered, niger.active), (7, 0, 0, 4));
    }

    #[test]
    fn rows_without_country_are_rejected_not_fatal() {
        let parsed = parse(date(2020, 6, 1), "Country_Region,Confirmed\n,5\nChad,1\n");
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows_rejected, 1);
    }

    #[test]
    fn missing_country_column_fails_the_file() {
        let err = parse_report_reader(
            date(2020, 6, 1),
            "odd.csv",
            "Nation,Confirmed\nChad,1\n".as_bytes(),
            &AliasBook::builtin().reports,
        )
        .unwrap_err();
        assert!(matches!(err, CanonError::MissingColumn { column: "country_region", .. }));
    }

    #[test]
    fn passthrough_and_unknown_columns_survive() {
        let parsed = parse(
            date(2021, 1, 1),
            "FIPS,Admin2,Province_State,Country_Region,Last_Update,Lat,Long_,Confirmed,Deaths,Recovered,Active,Combined_Key,Incident_Rate,Case_Fatality_Ratio,People_Tested\n\
             45001.0,Abbeville,South Carolina,US,2021-01-02 05:22:33,34.22,-82.46,1573,30,0,1543,\"Abbeville, South Carolina, US\",6413.2,1.9,1200\n",
        );

        let row = &parsed.rows[0];
        assert_eq!(row.fips, Some(45001));
        assert_eq!(row.admin2.as_deref(), Some("Abbeville"));
        assert_eq!(row.latitude, Some(34.22));
        assert_eq!(row.longitude, Some(-82.46));
        assert_eq!(row.combined_key.as_deref(), Some("Abbeville, South Carolina, US"));
        assert_eq!(row.incidence_rate, Some(6413.2));
        assert_eq!(row.case_fatality_ratio, Some(1.9));
        assert_eq!(row.extra.get("people_tested").map(String::as_str), Some("1200"));
        assert_eq!(row.extra_json().as_deref(), Some(r#"{"people_tested":"1200"}"#));
    }

    #[test]
    fn unparseable_timestamp_becomes_null() {
        let parsed = parse(date(2020, 1, 22), "Country/Region,Last Update\nJapan,soon\n");
        assert_eq!(parsed.rows[0].last_update, None);
    }
}
