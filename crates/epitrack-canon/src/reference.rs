//! Reference sources (population archive CSV, flag lookup JSON) onto the
//! canonical country vocabulary.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use epitrack_core::{FlagRow, PopulationRow, ReferenceLoad};
use tracing::{debug, warn};

use crate::aliases::AliasTable;
use crate::{non_empty, parse_whole, CanonError};

const COUNTRY_NAME_HEADER: &str = "Country Name";

/// Keep the first row per canonical country.
fn first_per_country<T>(
    origin: &str,
    rows: impl IntoIterator<Item = T>,
    country: impl Fn(&T) -> &str,
) -> ReferenceLoad<T> {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut duplicates_dropped = 0usize;
    for row in rows {
        if seen.insert(country(&row).to_string()) {
            kept.push(row);
        } else {
            duplicates_dropped += 1;
        }
    }
    if duplicates_dropped > 0 {
        warn!(origin, duplicates_dropped, "reference rows collapsed onto an existing country");
    }
    ReferenceLoad {
        rows: kept,
        duplicates_dropped,
    }
}

/// Year columns of the header row, newest first; `None` for preamble rows.
fn header_years(
    origin: &str,
    record: &csv::StringRecord,
    pinned: Option<i32>,
) -> Result<Option<Vec<(i32, usize)>>, CanonError> {
    let first = record.get(0).unwrap_or_default();
    if first.trim_start_matches('\u{feff}').trim() != COUNTRY_NAME_HEADER {
        return Ok(None);
    }
    let mut years = record
        .iter()
        .enumerate()
        .filter_map(|(i, h)| h.trim().parse::<i32>().ok().map(|y| (y, i)))
        .collect::<Vec<_>>();
    years.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    if let Some(pinned) = pinned {
        years.retain(|(y, _)| *y == pinned);
        if years.is_empty() {
            return Err(CanonError::MissingYear {
                origin: origin.to_string(),
                year: pinned,
            });
        }
    }
    Ok(Some(years))
}

pub fn parse_population_file(
    path: &Path,
    aliases: &AliasTable,
    year: Option<i32>,
) -> Result<ReferenceLoad<PopulationRow>, CanonError> {
    let file = File::open(path).map_err(|source| CanonError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_population_csv(&path.display().to_string(), file, aliases, year)
}

/// Parse the World Bank population CSV.
///
/// The file opens with a metadata preamble; the real header is the row whose
/// first cell is `Country Name`. Year columns are the numeric headers, and the
/// trailing unlabeled column is ignored. With `year` unset each country takes
/// its most recent non-empty year.
pub fn parse_population_csv<R: Read>(
    origin: &str,
    reader: R,
    aliases: &AliasTable,
    year: Option<i32>,
) -> Result<ReferenceLoad<PopulationRow>, CanonError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut year_columns: Option<Vec<(i32, usize)>> = None;
    let mut rows = Vec::new();

    for record in csv.records() {
        let record = record.map_err(|error| CanonError::Csv {
            origin: origin.to_string(),
            error,
        })?;

        if year_columns.is_none() {
            year_columns = header_years(origin, &record, year)?;
            continue;
        }
        let Some(columns) = &year_columns else {
            continue;
        };

        let Some(name) = non_empty(record.get(0)) else {
            continue;
        };
        let population = columns
            .iter()
            .find_map(|(_, i)| non_empty(record.get(*i)).and_then(parse_whole));
        rows.push(PopulationRow {
            country_region: aliases.canonicalize(name).to_string(),
            population,
        });
    }

    if year_columns.is_none() {
        return Err(CanonError::MissingPopulationHeader(origin.to_string()));
    }

    debug!(origin, rows = rows.len(), "parsed population table");
    Ok(first_per_country(origin, rows, |r| r.country_region.as_str()))
}

/// Parse the flag lookup: a JSON object of territory code -> display name.
pub fn parse_flags_json(
    bytes: &[u8],
    aliases: &AliasTable,
) -> Result<ReferenceLoad<FlagRow>, CanonError> {
    let by_code: BTreeMap<String, String> = serde_json::from_slice(bytes)?;
    let rows = by_code
        .into_iter()
        .filter(|(code, name)| !code.trim().is_empty() && !name.trim().is_empty())
        .map(|(code, name)| FlagRow {
            country_region: aliases.canonicalize(name.trim()).to_string(),
            iso_3166: code.trim().to_string(),
        })
        .collect::<Vec<_>>();
    debug!(rows = rows.len(), "parsed flag lookup");
    Ok(first_per_country("flags", rows, |r| r.country_region.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AliasBook;

    const WORLD_BANK_SAMPLE: &str = "\u{feff}\"Data Source\",\"World Development Indicators\",\n\
\n\
\"Last Updated Date\",\"2020-10-15\",\n\
\n\
\"Country Name\",\"Country Code\",\"Indicator Name\",\"Indicator Code\",\"2017\",\"2018\",\"2019\",\n\
\"Chad\",\"TCD\",\"Population, total\",\"SP.POP.TOTL\",\"15016753\",\"15477751\",\"15946882\",\n\
\"Korea, Rep.\",\"KOR\",\"Population, total\",\"SP.POP.TOTL\",\"51361911\",\"51606633\",\"51709098\",\n\
\"Eritrea\",\"ERI\",\"Population, total\",\"SP.POP.TOTL\",\"3213972\",\"\",\"\",\n\
\"Not classified\",\"INX\",\"Population, total\",\"SP.POP.TOTL\",\"\",\"\",\"\",\n\
\"World\",\"WLD\",\"Population, total\",\"SP.POP.TOTL\",\"7510990456\",\"7594270356\",\"7673533974\",\n";

    fn population(year: Option<i32>) -> ReferenceLoad<PopulationRow> {
        parse_population_csv(
            "API_SP.POP.TOTL_DS2_en_csv_v2.csv",
            WORLD_BANK_SAMPLE.as_bytes(),
            &AliasBook::builtin().population,
            year,
        )
        .expect("parse population")
    }

    fn lookup<'a>(load: &'a ReferenceLoad<PopulationRow>, country: &str) -> Option<&'a PopulationRow> {
        load.rows.iter().find(|r| r.country_region == country)
    }

    #[test]
    fn preamble_is_skipped_and_latest_year_wins() {
        let load = population(None);
        assert_eq!(load.rows.len(), 5);
        assert_eq!(lookup(&load, "Chad").unwrap().population, Some(15946882));
        assert_eq!(lookup(&load, "South Korea").unwrap().population, Some(51709098));
        // Latest non-empty year per country.
        assert_eq!(lookup(&load, "Eritrea").unwrap().population, Some(3213972));
        assert_eq!(lookup(&load, "Not classified").unwrap().population, None);
    }

    #[test]
    fn aggregate_pseudo_countries_are_kept() {
        let load = population(None);
        assert_eq!(lookup(&load, "World").unwrap().population, Some(7673533974));
    }

    #[test]
    fn pinned_year_reads_only_that_column() {
        let load = population(Some(2017));
        assert_eq!(lookup(&load, "Chad").unwrap().population, Some(15016753));
        let load = population(Some(2019));
        assert_eq!(lookup(&load, "Eritrea").unwrap().population, None);
    }

    #[test]
    fn pinned_year_missing_from_file_is_an_error() {
        let err = parse_population_csv(
            "pop.csv",
            WORLD_BANK_SAMPLE.as_bytes(),
            &AliasBook::builtin().population,
            Some(1999),
        )
        .unwrap_err();
        assert!(matches!(err, CanonError::MissingYear { year: 1999, .. }));
    }

    #[test]
    fn csv_without_header_row_is_an_error() {
        let err = parse_population_csv(
            "pop.csv",
            "a,b,c\n1,2,3\n".as_bytes(),
            &AliasBook::builtin().population,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CanonError::MissingPopulationHeader(_)));
    }

    #[test]
    fn flags_are_inverted_and_canonicalized() {
        let json = br#"{"TD":"Chad","KR":"Korea, Republic of","VN":"Viet Nam","US":"United States","EU":"Europe"}"#;
        let load = parse_flags_json(json, &AliasBook::builtin().flags).unwrap();

        let code = |country: &str| {
            load.rows
                .iter()
                .find(|r| r.country_region == country)
                .map(|r| r.iso_3166.as_str())
        };
        assert_eq!(load.rows.len(), 5);
        assert_eq!(code("Chad"), Some("TD"));
        assert_eq!(code("South Korea"), Some("KR"));
        assert_eq!(code("Vietnam"), Some("VN"));
        assert_eq!(code("Europe"), Some("EU"));
    }

    #[test]
    fn flags_collapsing_onto_one_country_keep_first_code() {
        let json = br#"{"CG":"Congo","ZZ":"Congo (Brazzaville)"}"#;
        let load = parse_flags_json(json, &AliasBook::builtin().flags).unwrap();
        assert_eq!(load.rows.len(), 1);
        assert_eq!(load.rows[0].iso_3166, "CG");
        assert_eq!(load.duplicates_dropped, 1);
    }

    #[test]
    fn flags_payload_must_be_an_object() {
        let err = parse_flags_json(b"[1,2,3]", &AliasBook::builtin().flags).unwrap_err();
        assert!(matches!(err, CanonError::Json(_)));
    }
}
