use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::{error, info};
use walkdir::WalkDir;

use crate::config::Tuning;
use crate::error::SourcedError;
use crate::parallel::{TaskResult, WorkerPool, buffered_execution, panic_message};
use crate::progress::{ProgressSink, ProgressTask};
use crate::store::Dataset;

pub const DEFAULT_EXTENSION: &str = "py";

/// Capability run over every collected file.
pub trait Analyzer: Send + Sync + 'static {
    type Output: Send + 'static;

    fn analyze(&self, file: &Path) -> Self::Output;
}

impl<F, T> Analyzer for F
where
    F: Fn(&Path) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn analyze(&self, file: &Path) -> T {
        self(file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome<T> {
    Analyzed { path: PathBuf, output: T },
    Failed { path: PathBuf, reason: String },
}

impl<T> FileOutcome<T> {
    pub fn path(&self) -> &Path {
        match self {
            FileOutcome::Analyzed { path, .. } | FileOutcome::Failed { path, .. } => path,
        }
    }
}

pub type FileFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ScanOptions {
    pub extension: String,
    pub filter: Option<FileFilter>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extension: DEFAULT_EXTENSION.to_string(),
            filter: None,
        }
    }
}

impl ScanOptions {
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn matches(&self, path: &Path) -> bool {
        let extension_matches = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case(self.extension.as_str()))
            .unwrap_or(false);
        extension_matches && self.filter.as_ref().is_none_or(|filter| filter(path))
    }
}

/// Regular files under `projects` that `options` accepts. Symlinks are not
/// followed and symlinked files are left out: an unpacked archive may carry
/// links pointing outside the dataset.
pub fn scan_projects(projects: &[Utf8PathBuf], options: &ScanOptions) -> Vec<PathBuf> {
    projects
        .iter()
        .flat_map(|project| {
            WalkDir::new(project.as_std_path())
                .follow_links(false)
                .into_iter()
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| options.matches(path))
        .collect()
}

pub struct Scanner {
    pool: WorkerPool,
    tuning: Tuning,
    sink: Arc<dyn ProgressSink>,
}

impl Scanner {
    pub fn new(tuning: &Tuning, sink: Arc<dyn ProgressSink>) -> Result<Self, SourcedError> {
        Ok(Self {
            pool: WorkerPool::new(tuning.analysis_workers())?,
            tuning: tuning.clone(),
            sink,
        })
    }

    /// Walks every materialized source of `dataset` and waits for the full
    /// file list.
    pub fn collect_files(
        &self,
        dataset: &Dataset,
        options: &ScanOptions,
    ) -> Result<Vec<PathBuf>, SourcedError> {
        let sources: Vec<Utf8PathBuf> = dataset
            .sources
            .iter()
            .filter_map(|source| source.path.clone())
            .collect();
        info!("found {} sources", sources.len());

        let batches: Vec<Vec<Utf8PathBuf>> = sources
            .chunks(self.tuning.scan_batch_size())
            .map(<[Utf8PathBuf]>::to_vec)
            .collect();
        let task = ProgressTask::start(
            &self.sink,
            "Scanning source files",
            Some(batches.len() as u64),
        );

        let scan_options = options.clone();
        let listing = buffered_execution(
            &self.pool,
            batches,
            move |batch: Vec<Utf8PathBuf>| scan_projects(&batch, &scan_options),
            self.pool.size() * 2,
        )?
        .with_poll_interval(self.tuning.poll_interval());

        let mut files = Vec::new();
        for completed in listing {
            let completed = completed?;
            task.advance(completed.len() as u64);
            for result in completed {
                match result {
                    Ok(batch_files) => files.extend(batch_files),
                    Err(panic) => error!("listing task crashed: {panic}"),
                }
            }
        }
        info!(
            "collected {} files from {} unique projects",
            files.len(),
            sources.len()
        );
        Ok(files)
    }

    pub fn run_on<A>(
        &self,
        dataset: &Dataset,
        analyzer: A,
        options: &ScanOptions,
    ) -> Result<Analysis<A::Output>, SourcedError>
    where
        A: Analyzer,
    {
        let files = self.collect_files(dataset, options)?;
        self.run_files(files, analyzer)
    }

    pub fn run_files<A>(
        &self,
        files: Vec<PathBuf>,
        analyzer: A,
    ) -> Result<Analysis<A::Output>, SourcedError>
    where
        A: Analyzer,
    {
        let total_files = files.len();
        let progress = ProgressTask::start(&self.sink, "Files", Some(total_files as u64));
        let batches = buffered_execution(
            &self.pool,
            files,
            move |path: PathBuf| {
                match panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(&path))) {
                    Ok(output) => FileOutcome::Analyzed { path, output },
                    Err(payload) => FileOutcome::Failed {
                        path,
                        reason: panic_message(payload),
                    },
                }
            },
            self.tuning.analysis_max_in_flight(),
        )?
        .with_poll_interval(self.tuning.poll_interval());

        Ok(Analysis {
            total_files,
            batches: Box::new(batches),
            ready: VecDeque::new(),
            progress,
        })
    }
}

type Batches<T> = Box<dyn Iterator<Item = Result<Vec<TaskResult<FileOutcome<T>>>, SourcedError>>>;

/// Streaming analysis results, yielded as soon as their batch completes.
pub struct Analysis<T> {
    total_files: usize,
    batches: Batches<T>,
    ready: VecDeque<FileOutcome<T>>,
    progress: ProgressTask,
}

impl<T> Analysis<T> {
    pub fn total_files(&self) -> usize {
        self.total_files
    }
}

impl<T> Iterator for Analysis<T> {
    type Item = Result<FileOutcome<T>, SourcedError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(outcome) = self.ready.pop_front() {
                return Some(Ok(outcome));
            }
            let completed = match self.batches.next()? {
                Ok(completed) => completed,
                Err(err) => return Some(Err(err)),
            };
            self.progress.advance(completed.len() as u64);
            for result in completed {
                match result {
                    Ok(outcome) => self.ready.push_back(outcome),
                    Err(panic) => error!("analysis task crashed: {panic}"),
                }
            }
        }
    }
}
