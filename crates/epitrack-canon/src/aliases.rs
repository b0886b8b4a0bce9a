//! Source-specific country alias tables onto the shared canonical vocabulary.
//!
//! Each upstream source spells countries its own way. Every table maps that
//! source's spellings onto the same canonical names so equality joins on
//! `country_region` line up across reports, population and flags.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::CanonError;

const REPORT_ALIASES: &[(&str, &str)] = &[
    ("Bahamas, The", "Bahamas"),
    ("Burma", "Myanmar"),
    ("Czech Republic", "Czechia"),
    ("Gambia, The", "Gambia"),
    ("Hong Kong SAR", "Hong Kong"),
    ("Iran (Islamic Republic of)", "Iran"),
    ("Ivory Coast", "Cote d'Ivoire"),
    ("Korea, South", "South Korea"),
    ("Macao SAR", "Macau"),
    ("Mainland China", "China"),
    ("North Ireland", "Ireland"),
    ("Republic of Ireland", "Ireland"),
    ("Republic of Korea", "South Korea"),
    ("Republic of Moldova", "Moldova"),
    ("Republic of the Congo", "Congo (Brazzaville)"),
    ("Russian Federation", "Russia"),
    ("St. Martin", "Saint Martin"),
    ("Taiwan*", "Taiwan"),
    ("The Bahamas", "Bahamas"),
    ("The Gambia", "Gambia"),
    ("UK", "United Kingdom"),
    ("US", "United States"),
    ("Viet Nam", "Vietnam"),
];

const POPULATION_ALIASES: &[(&str, &str)] = &[
    ("Bahamas, The", "Bahamas"),
    ("Brunei Darussalam", "Brunei"),
    ("Congo, Rep.", "Congo (Brazzaville)"),
    ("Congo, Dem. Rep.", "Congo (Kinshasa)"),
    ("Czech Republic", "Czechia"),
    ("Egypt, Arab Rep.", "Egypt"),
    ("Gambia, The", "Gambia"),
    ("Hong Kong SAR, China", "Hong Kong"),
    ("Iran, Islamic Rep.", "Iran"),
    ("Korea, Rep.", "South Korea"),
    ("Kyrgyz Republic", "Kyrgyzstan"),
    ("Lao PDR", "Laos"),
    ("Macao SAR, China", "Macau"),
    ("Russian Federation", "Russia"),
    ("St. Kitts and Nevis", "Saint Kitts and Nevis"),
    ("St. Lucia", "Saint Lucia"),
    ("St. Martin (French part)", "Saint Martin"),
    ("St. Vincent and the Grenadines", "Saint Vincent and the Grenadines"),
    ("Slovak Republic", "Slovakia"),
    ("Syrian Arab Republic", "Syria"),
    ("Venezuela, RB", "Venezuela"),
    ("Viet Nam", "Vietnam"),
    ("Yemen, Rep.", "Yemen"),
];

const FLAG_ALIASES: &[(&str, &str)] = &[
    ("Bolivia, Plurinational State of", "Bolivia"),
    ("Brunei Darussalam", "Brunei"),
    ("Cape Verde", "Cabo Verde"),
    ("Congo", "Congo (Brazzaville)"),
    ("Congo, the Democratic Republic of the", "Congo (Kinshasa)"),
    ("Côte d'Ivoire", "Cote d'Ivoire"),
    ("Curaçao", "Curacao"),
    ("Czech Republic", "Czechia"),
    ("Holy See (Vatican City State)", "Holy See"),
    ("Iran, Islamic Republic of", "Iran"),
    ("Korea, Republic of", "South Korea"),
    ("Lao People's Democratic Republic", "Laos"),
    ("Macao", "Macau"),
    ("Macedonia, the former Yugoslav Republic of", "North Macedonia"),
    ("Moldova, Republic of", "Moldova"),
    ("Russian Federation", "Russia"),
    ("Saint Barthélemy", "Saint Barthelemy"),
    ("Syrian Arab Republic", "Syria"),
    ("Swaziland", "Eswatini"),
    ("Taiwan, Province of China", "Taiwan"),
    ("Tanzania, United Republic of", "Tanzania"),
    ("Venezuela, Bolivarian Republic of", "Venezuela"),
    ("Viet Nam", "Vietnam"),
];

/// Immutable source-spelling -> canonical-name map. Lookups are exact and
/// case-sensitive; a miss returns the input unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTable {
    source: &'static str,
    entries: BTreeMap<String, String>,
}

impl AliasTable {
    pub fn from_pairs(source: &'static str, pairs: &[(&str, &str)]) -> Self {
        Self {
            source,
            entries: pairs
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn canonicalize<'a>(&'a self, name: &'a str) -> &'a str {
        self.entries.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical names this table can produce.
    pub fn targets(&self) -> BTreeSet<&str> {
        self.entries.values().map(String::as_str).collect()
    }

    fn with_additions(mut self, additions: BTreeMap<String, String>) -> Self {
        self.entries.extend(additions);
        self
    }
}

/// Operator-supplied additions, read from YAML.
///
/// ```yaml
/// version: 1
/// reports:
///   "Cabo Verde*": Cabo Verde
/// population: {}
/// flags: {}
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AliasOverrides {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pub reports: BTreeMap<String, String>,
    #[serde(default)]
    pub population: BTreeMap<String, String>,
    #[serde(default)]
    pub flags: BTreeMap<String, String>,
}

impl AliasOverrides {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty() && self.population.is_empty() && self.flags.is_empty()
    }
}

/// The three alias tables the pipeline runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasBook {
    pub reports: AliasTable,
    pub population: AliasTable,
    pub flags: AliasTable,
}

impl Default for AliasBook {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AliasBook {
    pub fn builtin() -> Self {
        Self {
            reports: AliasTable::from_pairs("reports", REPORT_ALIASES),
            population: AliasTable::from_pairs("population", POPULATION_ALIASES),
            flags: AliasTable::from_pairs("flags", FLAG_ALIASES),
        }
    }

    /// Built-in tables extended by `overrides`; an override wins over a built-in entry.
    pub fn with_overrides(self, overrides: AliasOverrides) -> Self {
        Self {
            reports: self.reports.with_additions(overrides.reports),
            population: self.population.with_additions(overrides.population),
            flags: self.flags.with_additions(overrides.flags),
        }
    }

    /// Built-in tables, plus the YAML file at `path` when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, CanonError> {
        let book = Self::builtin();
        let Some(path) = path else {
            return Ok(book);
        };
        let text = std::fs::read_to_string(path).map_err(|source| CanonError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let overrides =
            AliasOverrides::from_yaml_str(&text).map_err(|error| CanonError::Aliases {
                path: path.display().to_string(),
                error,
            })?;
        let additions = overrides.reports.len() + overrides.population.len() + overrides.flags.len();
        let book = book.with_overrides(overrides);
        tracing::info!(
            path = %path.display(),
            additions,
            reports = book.reports.len(),
            population = book.population.len(),
            flags = book.flags.len(),
            "loaded alias additions"
        );
        Ok(book)
    }
}
