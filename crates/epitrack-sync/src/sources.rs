//! Keeps the on-disk copies of the upstream sources present and fresh.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use epitrack_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, SyncMarker};
use serde::Serialize;
use tokio::fs;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;
use zip::ZipArchive;

use crate::config::SyncConfig;

const POPULATION_CSV_PREFIX: &str = "API_SP.POP.TOTL";

/// Version-control operations on the report mirror.
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;
    async fn pull(&self, dest: &Path, branch: &str) -> Result<()>;
}

/// Plain HTTP GET of a whole payload.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, run_id: Uuid, source_id: &str, url: &str) -> Result<Vec<u8>>;
}

#[async_trait]
impl Downloader for HttpFetcher {
    async fn download(&self, run_id: Uuid, source_id: &str, url: &str) -> Result<Vec<u8>> {
        Ok(self.fetch_bytes(run_id, source_id, url).await?.body)
    }
}

/// Drives the `git` executable.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCli {
    async fn run(&self, args: &[&str], cwd: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("spawning {} {}", self.program, args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.program,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl MirrorBackend for GitCli {
    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let dest = dest.to_string_lossy();
        self.run(&["clone", url, dest.as_ref()], None).await
    }

    async fn pull(&self, dest: &Path, branch: &str) -> Result<()> {
        self.run(&["pull", "--rebase", "origin", branch], Some(dest))
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Cloned,
    Updated,
    /// Skipped: the last successful sync is inside the cooldown window.
    Cooldown { last_synced: DateTime<Utc> },
    /// Refresh failed; the existing local mirror is used as-is.
    Stale { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PopulationOutcome {
    Present { csv: PathBuf },
    Downloaded { csv: PathBuf, content_hash: String },
}

impl PopulationOutcome {
    pub fn csv(&self) -> &Path {
        match self {
            Self::Present { csv } | Self::Downloaded { csv, .. } => csv,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlagsPayload {
    pub bytes: Vec<u8>,
    /// Served from a previously stored artifact because the fetch failed.
    pub stale: bool,
}

pub struct SourceSynchronizer {
    mirror_dir: PathBuf,
    marker_path: PathBuf,
    population_dir: PathBuf,
    reports_repo: String,
    reports_branch: String,
    population_url: String,
    flags_url: String,
    cooldown: Duration,
    artifacts: ArtifactStore,
    backend: Box<dyn MirrorBackend>,
    downloader: Box<dyn Downloader>,
}

impl SourceSynchronizer {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self::with_backends(
            config,
            Box::<GitCli>::default(),
            Box::new(http),
        ))
    }

    pub fn with_backends(
        config: &SyncConfig,
        backend: Box<dyn MirrorBackend>,
        downloader: Box<dyn Downloader>,
    ) -> Self {
        Self {
            mirror_dir: config.mirror_dir(),
            marker_path: config.sync_marker_path(),
            population_dir: config.population_dir(),
            reports_repo: config.reports_repo.clone(),
            reports_branch: config.reports_branch.clone(),
            population_url: config.population_url.clone(),
            flags_url: config.flags_url.clone(),
            cooldown: config.sync_cooldown,
            artifacts: ArtifactStore::new(config.artifacts_dir()),
            backend,
            downloader,
        }
    }

    pub fn mirror_dir(&self) -> &Path {
        &self.mirror_dir
    }

    pub async fn last_synced(&self) -> Option<SyncMarker> {
        SyncMarker::read(&self.marker_path).await
    }

    /// Bring the report mirror up to date, at most once per cooldown unless `force`.
    ///
    /// A failed refresh of an existing mirror degrades to [`SyncOutcome::Stale`];
    /// only a failed initial clone is an error.
    pub async fn sync_reports(&self, run_id: Uuid, force: bool) -> Result<SyncOutcome> {
        let now = Utc::now();
        let git_dir = self.mirror_dir.join(".git");
        let mirror_exists = fs::try_exists(&git_dir)
            .await
            .with_context(|| format!("checking {}", git_dir.display()))?;

        if !mirror_exists {
            if fs::try_exists(&self.mirror_dir).await.unwrap_or(false) {
                warn!(dest = %self.mirror_dir.display(), "mirror directory has no repository, cloning again");
                fs::remove_dir_all(&self.mirror_dir)
                    .await
                    .with_context(|| format!("removing {}", self.mirror_dir.display()))?;
            }
            info!(repo = %self.reports_repo, dest = %self.mirror_dir.display(), "cloning report mirror");
            if let Err(err) = self
                .backend
                .clone_repo(&self.reports_repo, &self.mirror_dir)
                .await
            {
                // Leave nothing behind that a later run would mistake for a mirror.
                let _ = fs::remove_dir_all(&self.mirror_dir).await;
                return Err(err).context("no local report mirror and the initial clone failed");
            }
            SyncMarker::new(now, run_id).write(&self.marker_path).await?;
            return Ok(SyncOutcome::Cloned);
        }

        if !force {
            if let Some(marker) = self.last_synced().await {
                if marker.is_fresh(now, self.cooldown) {
                    info!(last_synced = %marker.synced_at, "report mirror inside cooldown, not refreshing");
                    return Ok(SyncOutcome::Cooldown {
                        last_synced: marker.synced_at,
                    });
                }
            }
        }

        match self.backend.pull(&self.mirror_dir, &self.reports_branch).await {
            Ok(()) => {
                SyncMarker::new(now, run_id).write(&self.marker_path).await?;
                info!(dest = %self.mirror_dir.display(), "report mirror updated");
                Ok(SyncOutcome::Updated)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "report mirror refresh failed, continuing with local copy");
                Ok(SyncOutcome::Stale {
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    /// Make sure an unpacked population CSV exists, downloading only when none does.
    pub async fn sync_population(&self, run_id: Uuid) -> Result<PopulationOutcome> {
        if let Some(csv) = find_population_csv(&self.population_dir).await? {
            return Ok(PopulationOutcome::Present { csv });
        }

        info!(url = %self.population_url, "downloading population archive");
        let bytes = self
            .downloader
            .download(run_id, "population", &self.population_url)
            .await
            .context("no local population table and the download failed")?;
        let stored = self
            .artifacts
            .store_bytes(Utc::now(), "population", "zip", &bytes)
            .await?;

        let dest = self.population_dir.clone();
        let extracted = tokio::task::spawn_blocking(move || extract_population_csvs(&bytes, &dest))
            .await
            .context("joining population extraction task")??;
        info!(files = extracted.len(), "unpacked population archive");

        let csv = find_population_csv(&self.population_dir)
            .await?
            .context("population archive unpacked but no CSV found")?;
        Ok(PopulationOutcome::Downloaded {
            csv,
            content_hash: stored.content_hash,
        })
    }

    /// Fetch the flag lookup, falling back to the last stored copy on failure.
    pub async fn fetch_flags(&self, run_id: Uuid) -> Result<FlagsPayload> {
        match self
            .downloader
            .download(run_id, "flags", &self.flags_url)
            .await
        {
            Ok(bytes) => {
                self.artifacts
                    .store_bytes(Utc::now(), "flags", "json", &bytes)
                    .await?;
                Ok(FlagsPayload {
                    bytes,
                    stale: false,
                })
            }
            Err(err) => {
                let Some(path) = self.artifacts.latest("flags").await? else {
                    return Err(err).context("no stored flag lookup and the download failed");
                };
                warn!(error = %format!("{err:#}"), fallback = %path.display(), "flag lookup fetch failed, using stored copy");
                let bytes = fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                Ok(FlagsPayload { bytes, stale: true })
            }
        }
    }
}

pub async fn find_population_csv(dir: &Path) -> Result<Option<PathBuf>> {
    if !fs::try_exists(dir)
        .await
        .with_context(|| format!("checking {}", dir.display()))?
    {
        return Ok(None);
    }
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_population_csv(&name) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

fn is_population_csv(name: &str) -> bool {
    name.starts_with(POPULATION_CSV_PREFIX) && name.to_ascii_lowercase().ends_with(".csv")
}

/// Write the population CSVs from the archive into `dest`; metadata CSVs are skipped.
fn extract_population_csvs(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).context("opening population zip archive")?;
    std::fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("reading zip entry")?;
        let Some(name) = file
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        else {
            continue;
        };
        if !is_population_csv(&name) {
            continue;
        }
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .with_context(|| format!("reading {name} from archive"))?;
        let path = dest.join(&name);
        write_then_rename(&path, &contents)?;
        written.push(path);
    }

    if written.is_empty() {
        bail!("population archive has no {POPULATION_CSV_PREFIX}*.csv entry");
    }
    Ok(written)
}

/// Only a fully written file ever carries the population CSV name.
fn write_then_rename(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    let written = std::fs::File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(contents)?;
            file.sync_all()
        })
        .and_then(|()| std::fs::rename(&temp_path, path));
    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| format!("writing {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// In-process stand-in for `git` that writes report files on clone.
    #[derive(Default, Clone)]
    pub(crate) struct FakeMirror {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub fail: bool,
        pub files: Vec<(String, String)>,
        pub subdir: PathBuf,
    }

    impl FakeMirror {
        pub fn with_files(subdir: impl Into<PathBuf>, files: &[(&str, &str)]) -> Self {
            Self {
                subdir: subdir.into(),
                files: files
                    .iter()
                    .map(|(n, c)| (n.to_string(), c.to_string()))
                    .collect(),
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MirrorBackend for FakeMirror {
        async fn clone_repo(&self, _url: &str, dest: &Path) -> Result<()> {
            self.calls.lock().unwrap().push("clone".into());
            std::fs::create_dir_all(dest)?;
            if self.fail {
                bail!("network unreachable");
            }
            std::fs::create_dir_all(dest.join(".git"))?;
            let dir = dest.join(&self.subdir);
            std::fs::create_dir_all(&dir)?;
            for (name, contents) in &self.files {
                std::fs::write(dir.join(name), contents)?;
            }
            Ok(())
        }

        async fn pull(&self, _dest: &Path, branch: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("pull {branch}"));
            if self.fail {
                bail!("network unreachable");
            }
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    pub(crate) struct FakeDownloader {
        pub payloads: Vec<(String, Vec<u8>)>,
        pub requests: Arc<Mutex<Vec<String>>>,
    }

    impl FakeDownloader {
        pub fn serving(source_id: &str, bytes: Vec<u8>) -> Self {
            Self {
                payloads: vec![(source_id.to_string(), bytes)],
                ..Default::default()
            }
        }

        pub fn and(mut self, source_id: &str, bytes: Vec<u8>) -> Self {
            self.payloads.push((source_id.to_string(), bytes));
            self
        }

        pub fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Downloader for FakeDownloader {
        async fn download(&self, _run_id: Uuid, source_id: &str, _url: &str) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(source_id.to_string());
            self.payloads
                .iter()
                .find(|(id, _)| id == source_id)
                .map(|(_, b)| b.clone())
                .with_context(|| format!("{source_id}: connection refused"))
        }
    }

    pub(crate) fn population_zip(csv: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("Metadata_Country_API_SP.POP.TOTL_DS2_en_csv_v2.csv", options)
                .unwrap();
            zip.write_all(b"Country Code,Region\n").unwrap();
            zip.start_file("API_SP.POP.TOTL_DS2_en_csv_v2.csv", options)
                .unwrap();
            zip.write_all(csv.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    fn synchronizer(
        data_dir: &Path,
        mirror: FakeMirror,
        downloader: FakeDownloader,
    ) -> SourceSynchronizer {
        let config = SyncConfig::with_data_dir(data_dir);
        SourceSynchronizer::with_backends(&config, Box::new(mirror), Box::new(downloader))
    }

    #[tokio::test]
    async fn first_sync_clones_and_records_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FakeMirror::with_files("daily", &[("03-01-2020.csv", "Country/Region\n")]);
        let sync = synchronizer(dir.path(), mirror.clone(), FakeDownloader::default());

        let outcome = sync.sync_reports(Uuid::new_v4(), false).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Cloned);
        assert!(dir.path().join("covid/daily/03-01-2020.csv").exists());
        assert!(sync.last_synced().await.is_some());
        assert_eq!(mirror.calls(), vec!["clone"]);
    }

    #[tokio::test]
    async fn second_sync_inside_cooldown_does_not_touch_network() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FakeMirror::with_files("daily", &[]);
        let sync = synchronizer(dir.path(), mirror.clone(), FakeDownloader::default());

        sync.sync_reports(Uuid::new_v4(), false).await.unwrap();
        let outcome = sync.sync_reports(Uuid::new_v4(), false).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Cooldown { .. }));
        assert_eq!(mirror.calls(), vec!["clone"]);
    }

    #[tokio::test]
    async fn forced_sync_bypasses_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = FakeMirror::with_files("daily", &[]);
        let sync = synchronizer(dir.path(), mirror.clone(), FakeDownloader::default());

        sync.sync_reports(Uuid::new_v4(), false).await.unwrap();
        let outcome = sync.sync_reports(Uuid::new_v4(), true).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Updated);
        assert_eq!(mirror.calls(), vec!["clone", "pull master"]);
    }

    #[tokio::test]
    async fn failed_refresh_of_existing_mirror_is_stale_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("covid/.git")).unwrap();
        let sync = synchronizer(dir.path(), FakeMirror::failing(), FakeDownloader::default());

        let outcome = sync.sync_reports(Uuid::new_v4(), true).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Stale { .. }));
        // Marker is only written after a successful refresh.
        assert!(sync.last_synced().await.is_none());
    }

    #[tokio::test]
    async fn failed_initial_clone_is_fatal_and_leaves_no_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(dir.path(), FakeMirror::failing(), FakeDownloader::default());

        let err = sync.sync_reports(Uuid::new_v4(), false).await.unwrap_err();
        assert!(format!("{err:#}").contains("initial clone failed"));
        assert!(!dir.path().join("covid").exists());
    }

    #[tokio::test]
    async fn interrupted_clone_directory_is_cloned_again() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("covid/daily")).unwrap();
        std::fs::write(dir.path().join("covid/daily/half.csv"), "Country").unwrap();
        let mirror = FakeMirror::with_files("daily", &[("03-01-2020.csv", "Country/Region\n")]);
        let sync = synchronizer(dir.path(), mirror.clone(), FakeDownloader::default());

        let outcome = sync.sync_reports(Uuid::new_v4(), false).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Cloned);
        assert_eq!(mirror.calls(), vec!["clone"]);
        assert!(dir.path().join("covid/daily/03-01-2020.csv").exists());
        assert!(!dir.path().join("covid/daily/half.csv").exists());
    }

    #[tokio::test]
    async fn partially_written_population_csv_is_not_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let population = dir.path().join("population");
        std::fs::create_dir_all(&population).unwrap();
        std::fs::write(
            population.join(".API_SP.POP.TOTL_DS2_en_csv_v2.csv.0b7c.tmp"),
            "Country Name,2019\nCha",
        )
        .unwrap();
        assert_eq!(find_population_csv(&population).await.unwrap(), None);

        let downloader = FakeDownloader::serving("population", population_zip("Country Name,2019\nChad,1\n"));
        let sync = synchronizer(dir.path(), FakeMirror::default(), downloader.clone());
        let outcome = sync.sync_population(Uuid::new_v4()).await.unwrap();
        assert!(matches!(outcome, PopulationOutcome::Downloaded { .. }));
        assert_eq!(
            std::fs::read_to_string(outcome.csv()).unwrap(),
            "Country Name,2019\nChad,1\n"
        );
        let leftovers = std::fs::read_dir(&population)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        // Only the stale temp from the interrupted run remains.
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn population_downloads_once_then_stays_local() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = FakeDownloader::serving("population", population_zip("Country Name,2019\nChad,1\n"));
        let sync = synchronizer(dir.path(), FakeMirror::default(), downloader.clone());

        let first = sync.sync_population(Uuid::new_v4()).await.unwrap();
        assert!(matches!(first, PopulationOutcome::Downloaded { .. }));
        assert!(first.csv().ends_with("API_SP.POP.TOTL_DS2_en_csv_v2.csv"));
        assert!(!dir.path().join("population/Metadata_Country_API_SP.POP.TOTL_DS2_en_csv_v2.csv").exists());

        let second = sync.sync_population(Uuid::new_v4()).await.unwrap();
        assert!(matches!(second, PopulationOutcome::Present { .. }));
        assert_eq!(downloader.requests(), vec!["population"]);
    }

    #[tokio::test]
    async fn population_without_local_copy_or_network_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(dir.path(), FakeMirror::default(), FakeDownloader::default());
        assert!(sync.sync_population(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn flags_fall_back_to_last_stored_copy() {
        let dir = tempfile::tempdir().unwrap();
        let online = synchronizer(
            dir.path(),
            FakeMirror::default(),
            FakeDownloader::serving("flags", br#"{"TD":"Chad"}"#.to_vec()),
        );
        let fresh = online.fetch_flags(Uuid::new_v4()).await.unwrap();
        assert!(!fresh.stale);

        let offline = synchronizer(dir.path(), FakeMirror::default(), FakeDownloader::default());
        let fallback = offline.fetch_flags(Uuid::new_v4()).await.unwrap();
        assert!(fallback.stale);
        assert_eq!(fallback.bytes, br#"{"TD":"Chad"}"#.to_vec());
    }

    #[tokio::test]
    async fn flags_without_any_copy_fail() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(dir.path(), FakeMirror::default(), FakeDownloader::default());
        assert!(sync.fetch_flags(Uuid::new_v4()).await.is_err());
    }
}
