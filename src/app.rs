use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::info;

use crate::acquire::{AcquireReport, acquire_dataset};
use crate::config::Settings;
use crate::domain::{DatasetName, IndexSource};
use crate::error::SourcedError;
use crate::index::PackageIndex;
use crate::progress::{ProgressSink, ProgressTask};
use crate::scan::{Analysis, Analyzer, FileOutcome, ScanOptions, Scanner};
use crate::store::{Dataset, DatasetSummary, GlobalStore, Source};

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: DatasetName,
    pub source: IndexSource,
    pub sample_size: Option<usize>,
    pub base_data_dir: Option<Utf8PathBuf>,
    pub fresh_index: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions {
    pub retry_skipped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub datasets: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub path: String,
    pub summary: DatasetSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub name: String,
    pub path: String,
    pub cache_file: String,
    pub summary: DatasetSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResult {
    pub name: String,
    pub path: String,
    pub source: IndexSource,
    /// "cache" when an existing dataset cache was reused, "index" otherwise.
    pub action: String,
    pub summary: DatasetSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResult {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalyzeResult {
    pub dataset: String,
    pub files: usize,
    pub failed: usize,
    pub outcomes: BTreeMap<String, usize>,
    pub elapsed_ms: u128,
    pub files_per_second: f64,
}

pub struct App<C: PackageIndex + 'static> {
    settings: Settings,
    store: GlobalStore,
    index: Arc<C>,
}

impl<C: PackageIndex + 'static> App<C> {
    pub fn new(settings: Settings, store: GlobalStore, index: Arc<C>) -> Self {
        Self {
            settings,
            store,
            index,
        }
    }

    /// Loads the global store recorded under the settings' config directory.
    pub fn open(settings: Settings, index: Arc<C>) -> Result<Self, SourcedError> {
        let store = GlobalStore::from_file(&settings.store_path())?;
        Ok(Self::new(settings, store, index))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &GlobalStore {
        &self.store
    }

    pub fn list(&self) -> ListResult {
        ListResult {
            datasets: self
                .store
                .datasets()
                .map(|dataset| ListEntry {
                    name: dataset.name.clone(),
                    path: dataset.path.to_string(),
                    summary: dataset.summary(),
                })
                .collect(),
        }
    }

    pub fn info(&self, name: &str) -> Result<InfoResult, SourcedError> {
        let dataset = self.dataset(name)?;
        Ok(InfoResult {
            name: dataset.name.clone(),
            path: dataset.path.to_string(),
            cache_file: dataset.cache_file().to_string(),
            summary: dataset.summary(),
        })
    }

    /// Creates `<base>/<name>` from the package index, or picks up the dataset
    /// cache already sitting there, and registers it in the global store.
    pub fn create_dataset(
        &mut self,
        request: CreateRequest,
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<CreateResult, SourcedError> {
        let name = request.name.as_str();
        let download_dir = match &request.base_data_dir {
            Some(base) => base.join(name),
            None => self.settings.dataset_dir(name),
        };
        std::fs::create_dir_all(download_dir.as_std_path())
            .map_err(|err| SourcedError::Filesystem(format!("create {download_dir}: {err}")))?;

        let cached = if request.fresh_index {
            None
        } else {
            match Dataset::from_cache(&download_dir) {
                Ok(dataset) => Some(dataset),
                Err(SourcedError::DatasetCacheMissing(_)) => None,
                Err(err) => return Err(err),
            }
        };

        let (dataset, action) = match cached {
            Some(_) if request.source == IndexSource::PypiAll => {
                return Err(SourcedError::InvalidOptions(format!(
                    "a dataset cache already exists in {download_dir}; \
                     pass --fresh-index to rebuild it from the full index"
                )));
            }
            Some(mut dataset) => {
                info!("reusing dataset cache in {download_dir}");
                // A cache copied from elsewhere is rewritten under the requested
                // name and its new location.
                dataset.name = name.to_string();
                dataset.cache()?;
                (dataset, "cache")
            }
            None => {
                let names = self.collect_names(request.source, sink)?;
                let sources = names
                    .into_iter()
                    .take(request.sample_size.unwrap_or(usize::MAX))
                    .map(Source::new)
                    .collect();
                let dataset = Dataset::new(name, download_dir.clone(), sources);
                dataset.cache()?;
                (dataset, "index")
            }
        };

        let result = CreateResult {
            name: dataset.name.clone(),
            path: dataset.path.to_string(),
            source: request.source,
            action: action.to_string(),
            summary: dataset.summary(),
        };
        self.store.insert(dataset);
        self.store.cache()?;
        Ok(result)
    }

    /// Unregisters a dataset. Its directory and cache file stay on disk, so
    /// `create` with the same location picks it up again.
    pub fn remove_dataset(&mut self, name: &str) -> Result<RemoveResult, SourcedError> {
        let dataset = self
            .store
            .remove(name)
            .ok_or_else(|| SourcedError::DatasetNotFound(name.to_string()))?;
        self.store.cache()?;
        info!("dataset '{name}' unregistered; files kept in {}", dataset.path);
        Ok(RemoveResult {
            name: dataset.name,
            path: dataset.path.to_string(),
        })
    }

    fn collect_names(
        &self,
        source: IndexSource,
        sink: &Arc<dyn ProgressSink>,
    ) -> Result<Vec<String>, SourcedError> {
        let _task = ProgressTask::start(sink, format!("Collecting {source} packages"), None);
        let names = match source {
            IndexSource::PypiPopular => self.index.list_popular_names()?,
            IndexSource::PypiAll => self.index.list_all_names()?,
        };
        info!("collected {} package names from {source}", names.len());
        Ok(names)
    }

    pub fn download(
        &mut self,
        name: &str,
        options: DownloadOptions,
        sink: Arc<dyn ProgressSink>,
        cancel: &AtomicBool,
    ) -> Result<AcquireReport, SourcedError> {
        let index = Arc::clone(&self.index);
        let tuning = self.settings.tuning().clone();
        let dataset = self
            .store
            .get_mut(name)
            .ok_or_else(|| SourcedError::DatasetNotFound(name.to_string()))?;

        if options.retry_skipped {
            let reset = dataset.reset_skipped();
            if reset > 0 {
                info!("retrying {reset} skipped sources");
                dataset.cache()?;
            }
        }
        acquire_dataset(index, dataset, &tuning, sink, cancel)
    }

    pub fn analyze<A: Analyzer>(
        &self,
        name: &str,
        analyzer: A,
        options: &ScanOptions,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Analysis<A::Output>, SourcedError> {
        let dataset = self.dataset(name)?;
        let scanner = Scanner::new(self.settings.tuning(), sink)?;
        scanner.run_on(dataset, analyzer, options)
    }

    fn dataset(&self, name: &str) -> Result<&Dataset, SourcedError> {
        self.store
            .get(name)
            .ok_or_else(|| SourcedError::DatasetNotFound(name.to_string()))
    }
}

/// Drains `analysis`, counting outputs by the label `key` gives them.
/// `on_outcome` sees every outcome as it arrives.
pub fn tally_analysis<T, K, F>(
    dataset: &str,
    analysis: Analysis<T>,
    key: F,
    mut on_outcome: impl FnMut(&FileOutcome<T>),
) -> Result<AnalyzeResult, SourcedError>
where
    K: Display,
    F: Fn(&T) -> K,
{
    let started = Instant::now();
    let mut result = AnalyzeResult {
        dataset: dataset.to_string(),
        ..AnalyzeResult::default()
    };
    for outcome in analysis {
        let outcome = outcome?;
        on_outcome(&outcome);
        result.files += 1;
        match &outcome {
            FileOutcome::Analyzed { output, .. } => {
                *result.outcomes.entry(key(output).to_string()).or_default() += 1;
            }
            FileOutcome::Failed { .. } => result.failed += 1,
        }
    }
    let elapsed = started.elapsed();
    result.elapsed_ms = elapsed.as_millis();
    if elapsed.as_secs_f64() > 0.0 {
        result.files_per_second = result.files as f64 / elapsed.as_secs_f64();
    }
    Ok(result)
}
