//! Brings every pending source of a dataset to a terminal state.
//!
//! Downloads run on a [`WorkerPool`] through [`buffered_execution`]; workers
//! only return outcomes and the dataset is mutated and persisted here, on the
//! calling thread, after every completed batch.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveFormat};
use crate::config::Tuning;
use crate::domain::is_safe_component;
use crate::error::SourcedError;
use crate::index::{IndexFile, PackageIndex, select_artifact};
use crate::parallel::{TaskPanic, WorkerPool, buffered_execution, panic_message};
use crate::progress::{ProgressSink, ProgressTask};
use crate::store::Dataset;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Skipping {project}: {}", .description.as_deref().unwrap_or("unknown cause"))]
pub struct SkipError {
    pub project: String,
    pub description: Option<String>,
}

impl SkipError {
    pub fn new(project: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            description: Some(description.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error(transparent)]
    Skip(#[from] SkipError),

    #[error("failed to acquire {project}: {source}")]
    Failed {
        project: String,
        #[source]
        source: SourcedError,
    },
}

impl AcquireError {
    fn failed(project: &str, source: SourcedError) -> Self {
        AcquireError::Failed {
            project: project.to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub project: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcquireReport {
    pub attempted: usize,
    pub downloaded: usize,
    pub skipped: Vec<SkipError>,
    pub failed: Vec<FailedSource>,
    pub interrupted: bool,
}

pub fn prepare_download_url(
    index: &dyn PackageIndex,
    name: &str,
) -> Result<(IndexFile, ArchiveFormat), SkipError> {
    let files = index
        .list_files(name)
        .map_err(|err| SkipError::new(name, format!("index lookup failed: {err}")))?;
    select_artifact(&files)
        .map(|(file, format)| (file.clone(), format))
        .ok_or_else(|| SkipError::new(name, "no suitable archive found"))
}

/// Removes a source directory unless the download completed.
struct ClearOnFailure<'a> {
    path: &'a Path,
    armed: bool,
}

impl<'a> ClearOnFailure<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ClearOnFailure<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.path.exists() {
            return;
        }
        if let Err(err) = fs::remove_dir_all(self.path) {
            warn!("failed to remove partial download {}: {err}", self.path.display());
        }
    }
}

/// Downloads and extracts one source into `<base_path>/<name>`.
///
/// On error the destination directory is gone by the time this returns.
pub fn download_source(
    index: &dyn PackageIndex,
    sink: &Arc<dyn ProgressSink>,
    base_path: &Utf8Path,
    name: &str,
) -> Result<Utf8PathBuf, AcquireError> {
    if !is_safe_component(name) {
        return Err(SkipError::new(name, "unsafe project name").into());
    }

    let source_path = base_path.join(name);
    if source_path.as_std_path().exists() {
        // Leftover of an attempt that never got recorded.
        fs::remove_dir_all(source_path.as_std_path()).map_err(|err| {
            AcquireError::failed(name, SourcedError::Filesystem(format!("clear {source_path}: {err}")))
        })?;
    }

    let task = ProgressTask::start(sink, format!("Preparing {name}"), Some(3));
    let (file, format) = prepare_download_url(index, name)?;

    fs::create_dir_all(source_path.as_std_path()).map_err(|err| {
        AcquireError::failed(name, SourcedError::Filesystem(format!("create {source_path}: {err}")))
    })?;
    let guard = ClearOnFailure::new(source_path.as_std_path());
    fetch_into(index, &task, name, &file, format, source_path.as_std_path())?;
    drop(task);
    guard.disarm();
    Ok(source_path)
}

fn fetch_into(
    index: &dyn PackageIndex,
    task: &ProgressTask,
    name: &str,
    file: &IndexFile,
    format: ArchiveFormat,
    source_path: &Path,
) -> Result<(), AcquireError> {
    task.step(format!("Downloading {name}"));

    let archive = tempfile::Builder::new()
        .prefix("sourced-download")
        .tempfile()
        .map_err(|err| AcquireError::failed(name, SourcedError::Filesystem(err.to_string())))?;
    let mut on_bytes = |seen: u64, total: Option<u64>| match total {
        Some(total) => task.describe(format!("Downloading {name} ({seen} / {total} bytes)")),
        None => task.describe(format!("Downloading {name} ({seen} bytes)")),
    };
    index
        .download(&file.url, archive.path(), &mut on_bytes)
        .map_err(|err| AcquireError::failed(name, err))?;

    task.step(format!("Extracting {name}"));
    archive::extract(archive.path(), source_path, format)
        .map_err(|err| AcquireError::failed(name, err))?;
    archive::normalize_single_root(source_path).map_err(|err| AcquireError::failed(name, err))?;
    task.advance(1);
    Ok(())
}

pub fn acquire_dataset<C>(
    index: Arc<C>,
    dataset: &mut Dataset,
    tuning: &Tuning,
    sink: Arc<dyn ProgressSink>,
    cancel: &AtomicBool,
) -> Result<AcquireReport, SourcedError>
where
    C: PackageIndex + 'static,
{
    let pending: Vec<(usize, String)> = dataset
        .sources
        .iter()
        .enumerate()
        .filter(|(_, source)| source.is_pending())
        .map(|(position, source)| (position, source.name.clone()))
        .collect();

    if pending.is_empty() {
        info!("dataset '{}' has nothing left to download", dataset.name);
        return Ok(AcquireReport::default());
    }

    let total = dataset.sources.len() as u64;
    let overall = ProgressTask::start_at(
        &sink,
        "Fetching PyPI targets",
        Some(total),
        total - pending.len() as u64,
    );

    let pool = WorkerPool::new(tuning.io_workers())?;
    let base_path = dataset.path.clone();
    let worker_sink = Arc::clone(&sink);
    // Set once the run is interrupted; queued jobs that have not started yet
    // return without touching the network or the disk.
    let stopping = Arc::new(AtomicBool::new(false));
    let worker_stopping = Arc::clone(&stopping);
    let mut batches = buffered_execution(
        &pool,
        pending,
        move |(position, name): (usize, String)| {
            if worker_stopping.load(Ordering::Relaxed) {
                return (position, None);
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                download_source(index.as_ref(), &worker_sink, &base_path, &name)
            }))
            .unwrap_or_else(|payload| {
                let crashed = TaskPanic {
                    message: panic_message(payload),
                };
                Err(AcquireError::failed(&name, crashed.into()))
            });
            (position, Some(outcome))
        },
        tuning.download_max_in_flight(),
    )?
    .with_poll_interval(tuning.poll_interval());

    let mut report = AcquireReport::default();
    while let Some(batch) = batches.next() {
        let batch = batch?;
        for completed in &batch {
            let (position, outcome) = match completed {
                Ok((_, None)) => continue,
                Ok((position, Some(outcome))) => (*position, outcome),
                Err(crashed) => {
                    // Download panics are caught inside the task; this is the
                    // wrapper itself failing.
                    error!("download task crashed: {crashed}");
                    continue;
                }
            };
            report.attempted += 1;
            overall.advance(1);
            match outcome {
                Ok(path) => {
                    dataset.sources[position].mark_downloaded(path.clone());
                    report.downloaded += 1;
                }
                Err(AcquireError::Skip(skip)) => {
                    info!("{skip}");
                    dataset.sources[position].mark_skipped();
                    report.skipped.push(skip.clone());
                }
                Err(AcquireError::Failed { project, source }) => {
                    error!("failed to acquire {project}: {source}");
                    report.failed.push(FailedSource {
                        project: project.clone(),
                        message: source.to_string(),
                    });
                }
            }
        }

        if !batch.is_empty() {
            dataset.cache()?;
        }
        if !batches.is_closed() && cancel.load(Ordering::Relaxed) {
            warn!(
                "interrupted; waiting for {} running downloads of '{}'",
                batches.outstanding(),
                dataset.name
            );
            stopping.store(true, Ordering::Relaxed);
            batches.close();
            report.interrupted = true;
        }
    }
    if report.interrupted {
        dataset.cache()?;
        warn!("progress for dataset '{}' saved", dataset.name);
    }

    info!(
        downloaded = report.downloaded,
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "acquisition of '{}' finished",
        dataset.name
    );
    Ok(report)
}
