use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REPORTS_REPO: &str = "https://github.com/CSSEGISandData/COVID-19.git";
pub const DEFAULT_REPORTS_SUBDIR: &str = "csse_covid_19_data/csse_covid_19_daily_reports";
pub const DEFAULT_POPULATION_URL: &str =
    "http://api.worldbank.org/v2/en/indicator/SP.POP.TOTL?downloadformat=csv";
pub const DEFAULT_FLAGS_URL: &str =
    "https://raw.githubusercontent.com/hjnilsson/country-flags/master/countries.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub database_path: PathBuf,
    pub reports_repo: String,
    pub reports_branch: String,
    pub reports_subdir: PathBuf,
    pub population_url: String,
    pub flags_url: String,
    pub sync_cooldown: Duration,
    pub population_year: Option<i32>,
    pub aliases_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::with_data_dir("./data")
    }
}

impl SyncConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            database_path: data_dir.join("covid.sqlite"),
            data_dir,
            reports_repo: DEFAULT_REPORTS_REPO.to_string(),
            reports_branch: "master".to_string(),
            reports_subdir: PathBuf::from(DEFAULT_REPORTS_SUBDIR),
            population_url: DEFAULT_POPULATION_URL.to_string(),
            flags_url: DEFAULT_FLAGS_URL.to_string(),
            sync_cooldown: Duration::from_secs(5400),
            population_year: None,
            aliases_file: None,
            user_agent: "epitrack/0.1".to_string(),
            http_timeout_secs: 60,
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("EPITRACK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let defaults = Self::with_data_dir(&data_dir);
        let aliases_file = std::env::var("EPITRACK_ALIASES_FILE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| Some(data_dir.join("aliases.yaml")).filter(|p| p.exists()));

        Self {
            database_path: std::env::var("EPITRACK_DATABASE")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            reports_repo: std::env::var("EPITRACK_REPORTS_REPO").unwrap_or(defaults.reports_repo),
            reports_branch: std::env::var("EPITRACK_REPORTS_BRANCH")
                .unwrap_or(defaults.reports_branch),
            reports_subdir: std::env::var("EPITRACK_REPORTS_SUBDIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_subdir),
            population_url: std::env::var("EPITRACK_POPULATION_URL")
                .unwrap_or(defaults.population_url),
            flags_url: std::env::var("EPITRACK_FLAGS_URL").unwrap_or(defaults.flags_url),
            sync_cooldown: std::env::var("EPITRACK_SYNC_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sync_cooldown),
            population_year: std::env::var("EPITRACK_POPULATION_YEAR")
                .ok()
                .and_then(|v| v.parse().ok()),
            aliases_file,
            user_agent: std::env::var("EPITRACK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("EPITRACK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            data_dir,
        }
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.data_dir.join("covid")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.mirror_dir().join(&self.reports_subdir)
    }

    pub fn sync_marker_path(&self) -> PathBuf {
        self.data_dir.join("covid.state.json")
    }

    pub fn population_dir(&self) -> PathBuf {
        self.data_dir.join("population")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_hang_off_data_dir() {
        let config = SyncConfig::with_data_dir("/srv/epi");
        assert_eq!(config.database_path, PathBuf::from("/srv/epi/covid.sqlite"));
        assert_eq!(
            config.reports_dir(),
            PathBuf::from("/srv/epi/covid/csse_covid_19_data/csse_covid_19_daily_reports")
        );
        assert_eq!(config.sync_marker_path(), PathBuf::from("/srv/epi/covid.state.json"));
        assert_eq!(config.sync_cooldown, Duration::from_secs(5400));
    }
}
