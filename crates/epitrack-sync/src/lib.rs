//! Source synchronization, the SQLite store, incremental loading and run orchestration.

pub mod config;
pub mod loader;
pub mod pipeline;
pub mod query;
pub mod sources;
pub mod store;

pub use config::SyncConfig;
pub use loader::{report_files, FileFailure, IncrementalLoader, LoadReport};
pub use pipeline::{run_once_from_env, EtlPipeline, ReferenceSummary, RunSummary, StoreStatus};
pub use query::{CountryRollup, JoinGap, QueryFacade, Totals, WorldwideTotals};
pub use sources::{
    Downloader, FlagsPayload, GitCli, MirrorBackend, PopulationOutcome, SourceSynchronizer,
    SyncOutcome,
};
pub use store::{LoadError, ReferenceTable, Store, StoreState};

pub const CRATE_NAME: &str = "epitrack-sync";
