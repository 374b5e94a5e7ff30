use std::path::PathBuf;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

use crate::parallel::TaskPanic;

#[derive(Debug, Error, Diagnostic)]
pub enum SourcedError {
    #[error("invalid workload type: {0:?} (expected io, cpu or both)")]
    InvalidWorkload(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid dataset name: {0}")]
    InvalidDatasetName(String),

    #[error("invalid options: {0}")]
    #[diagnostic(help("run `sourced datasets create --help` for the supported combinations"))]
    InvalidOptions(String),

    #[error("dataset not found in store: {0}")]
    DatasetNotFound(String),

    #[error("dataset metadata file ({0}) was not found")]
    DatasetCacheMissing(Utf8PathBuf),

    #[error("malformed metadata file {path}: {message}")]
    CacheParse { path: Utf8PathBuf, message: String },

    #[error("source path {path} is not inside dataset root {root}")]
    PathOutsideDataset { path: Utf8PathBuf, root: Utf8PathBuf },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("package index request failed: {0}")]
    IndexHttp(String),

    #[error("package index returned status {status}: {message}")]
    IndexStatus { status: u16, message: String },

    #[error("archive extraction failed: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to start worker pool: {0}")]
    PoolSpawn(String),

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error(transparent)]
    TaskPanicked(#[from] TaskPanic),

    #[error("interrupted; progress so far has been saved")]
    Interrupted,
}
