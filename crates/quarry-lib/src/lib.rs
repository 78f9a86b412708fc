//! The quarry pipeline: discover packages, derive the local dependency
//! graph, and run one operation per package in dependency order, skipping
//! packages whose cached fingerprint still matches.

#![deny(clippy::all)]

pub mod config;
pub mod filter;
pub mod pipeline;
pub mod record;

pub use config::RepoConfig;
pub use filter::PackageFilter;
pub use pipeline::{Pipeline, PipelineRun};
pub use record::IndirectDepRecord;

// The pieces callers need to drive a run.
pub use quarry_cache::CacheStatus;
pub use quarry_scheduler::{OperationError, PackageError, RunOpts, RunResult};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Graph(#[from] quarry_repository::package_graph::Error),
    #[error(transparent)]
    Scheduler(#[from] quarry_scheduler::Error),
    #[error(transparent)]
    Cache(#[from] quarry_cache::CacheError),
    #[error("invalid filter pattern: {0}")]
    Filter(#[from] globset::Error),
    #[error(transparent)]
    Path(#[from] quarry_paths::PathError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("resolve() must run before the pipeline can start")]
    GraphNotResolved,
}
