use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, warn};

use crate::error::SourcedError;

pub const DATASET_CACHE_FILE_NAME: &str = "dataset.json";
pub const STORE_FILE_NAME: &str = "store.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStatus {
    AwaitingDownload,
    Downloaded,
    Skipped,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::AwaitingDownload => write!(f, "AWAITING_DOWNLOAD"),
            SourceStatus::Downloaded => write!(f, "DOWNLOADED"),
            SourceStatus::Skipped => write!(f, "SKIPPED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub path: Option<Utf8PathBuf>,
    pub status: SourceStatus,
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            status: SourceStatus::AwaitingDownload,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == SourceStatus::AwaitingDownload
    }

    pub fn mark_downloaded(&mut self, path: Utf8PathBuf) {
        self.path = Some(path);
        self.status = SourceStatus::Downloaded;
    }

    pub fn mark_skipped(&mut self) {
        self.path = None;
        self.status = SourceStatus::Skipped;
    }

    /// Puts the source back in the queue for the next acquisition run.
    pub fn reset(&mut self) {
        self.path = None;
        self.status = SourceStatus::AwaitingDownload;
    }

    fn to_json(&self, relative_to: &Utf8Path) -> Result<SourceRecord, SourcedError> {
        let path = match &self.path {
            Some(path) => Some(
                path.strip_prefix(relative_to)
                    .map_err(|_| SourcedError::PathOutsideDataset {
                        path: path.clone(),
                        root: relative_to.to_path_buf(),
                    })?
                    .to_string(),
            ),
            None => None,
        };
        Ok(SourceRecord {
            name: self.name.clone(),
            path,
            status: self.status,
        })
    }

    fn from_json(record: SourceRecord, relative_to: &Utf8Path) -> Self {
        Self {
            name: record.name,
            path: record.path.map(|path| relative_to.join(path)),
            status: record.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub name: String,
    pub path: Option<String>,
    pub status: SourceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub name: String,
    pub path: String,
    pub sources: Vec<SourceRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetSummary {
    pub total: usize,
    pub awaiting_download: usize,
    pub downloaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub name: String,
    pub path: Utf8PathBuf,
    pub sources: Vec<Source>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, path: Utf8PathBuf, sources: Vec<Source>) -> Self {
        Self {
            name: name.into(),
            path,
            sources,
        }
    }

    pub fn cache_file(&self) -> Utf8PathBuf {
        self.path.join(DATASET_CACHE_FILE_NAME)
    }

    pub fn from_cache(cache_dir: &Utf8Path) -> Result<Self, SourcedError> {
        let meta_path = cache_dir.join(DATASET_CACHE_FILE_NAME);
        let content = match fs::read_to_string(meta_path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SourcedError::DatasetCacheMissing(meta_path));
            }
            Err(err) => {
                return Err(SourcedError::Filesystem(format!("read {meta_path}: {err}")));
            }
        };
        let record: DatasetRecord =
            serde_json::from_str(&content).map_err(|err| SourcedError::CacheParse {
                path: meta_path.clone(),
                message: err.to_string(),
            })?;
        Ok(Self::from_json_at(record, cache_dir))
    }

    pub fn cache(&self) -> Result<(), SourcedError> {
        let record = self.to_json()?;
        write_json_atomic(&self.cache_file(), &record)?;
        debug!(dataset = %self.name, sources = self.sources.len(), "dataset cached");
        Ok(())
    }

    /// Source paths are written relative to the dataset root.
    pub fn to_json(&self) -> Result<DatasetRecord, SourcedError> {
        let sources = self
            .sources
            .iter()
            .map(|source| source.to_json(&self.path))
            .collect::<Result<Vec<_>, SourcedError>>()?;
        Ok(DatasetRecord {
            name: self.name.clone(),
            path: self.path.to_string(),
            sources,
        })
    }

    pub fn from_json(record: DatasetRecord) -> Self {
        let path = Utf8PathBuf::from(&record.path);
        Self::from_json_at(record, &path)
    }

    /// Rebuilds the dataset under `root`, ignoring the recorded `path`, so a
    /// dataset directory keeps working after it has been moved.
    pub fn from_json_at(record: DatasetRecord, root: &Utf8Path) -> Self {
        let sources = record
            .sources
            .into_iter()
            .map(|source| Source::from_json(source, root))
            .collect();
        Self {
            name: record.name,
            path: root.to_path_buf(),
            sources,
        }
    }

    pub fn source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|source| source.name == name)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|source| source.is_pending())
    }

    pub fn summary(&self) -> DatasetSummary {
        let mut summary = DatasetSummary {
            total: self.sources.len(),
            ..DatasetSummary::default()
        };
        for source in &self.sources {
            match source.status {
                SourceStatus::AwaitingDownload => summary.awaiting_download += 1,
                SourceStatus::Downloaded => summary.downloaded += 1,
                SourceStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn reset_skipped(&mut self) -> usize {
        let mut reset = 0;
        for source in &mut self.sources {
            if source.status == SourceStatus::Skipped {
                source.reset();
                reset += 1;
            }
        }
        reset
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub datasets: Vec<DatasetRef>,
}

/// Registry of datasets by name. Only `(name, path)` pointers are persisted;
/// every dataset keeps its sources in its own cache file.
#[derive(Debug, Clone)]
pub struct GlobalStore {
    path: Utf8PathBuf,
    datasets: BTreeMap<String, Dataset>,
}

impl GlobalStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            datasets: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn from_file(path: &Utf8Path) -> Result<Self, SourcedError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::new(path.to_path_buf()));
            }
            Err(err) => {
                return Err(SourcedError::Filesystem(format!("read {path}: {err}")));
            }
        };
        let record: StoreRecord =
            serde_json::from_str(&content).map_err(|err| SourcedError::CacheParse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Self::from_json(path.to_path_buf(), record)
    }

    pub fn from_json(path: Utf8PathBuf, record: StoreRecord) -> Result<Self, SourcedError> {
        let mut datasets = BTreeMap::new();
        for reference in record.datasets {
            let dataset_dir = Utf8PathBuf::from(&reference.path);
            match Dataset::from_cache(&dataset_dir) {
                Ok(dataset) => {
                    datasets.insert(reference.name, dataset);
                }
                Err(SourcedError::DatasetCacheMissing(meta_path)) => {
                    warn!(
                        "dataset '{}' does not appear to exist on the disk (no {}); skipping",
                        reference.name, meta_path
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Self { path, datasets })
    }

    pub fn to_json(&self) -> StoreRecord {
        StoreRecord {
            datasets: self
                .datasets
                .iter()
                .map(|(name, dataset)| DatasetRef {
                    name: name.clone(),
                    path: dataset.path.to_string(),
                })
                .collect(),
        }
    }

    pub fn cache(&self) -> Result<(), SourcedError> {
        write_json_atomic(&self.path, &self.to_json())
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Dataset> {
        self.datasets.get_mut(name)
    }

    pub fn insert(&mut self, dataset: Dataset) -> Option<Dataset> {
        self.datasets.insert(dataset.name.clone(), dataset)
    }

    pub fn remove(&mut self, name: &str) -> Option<Dataset> {
        self.datasets.remove(name)
    }
}

/// A serialized document sitting in a temporary file next to its destination.
/// Nothing is visible at the destination until [`StagedWrite::commit`];
/// dropping it discards the temporary file.
#[derive(Debug)]
pub struct StagedWrite {
    temp: NamedTempFile,
    destination: Utf8PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &std::path::Path {
        self.temp.path()
    }

    pub fn commit(self) -> Result<(), SourcedError> {
        self.temp
            .persist(self.destination.as_std_path())
            .map_err(|err| {
                SourcedError::Filesystem(format!("replace {}: {}", self.destination, err.error))
            })?;
        Ok(())
    }
}

pub fn stage_json<T: Serialize>(
    destination: &Utf8Path,
    value: &T,
) -> Result<StagedWrite, SourcedError> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| SourcedError::Filesystem(format!("create {parent}: {err}")))?;

    let temp = Builder::new()
        .prefix(".sourced-")
        .suffix(".json.tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
    }
    temp.as_file()
        .sync_all()
        .map_err(|err| SourcedError::Filesystem(err.to_string()))?;

    Ok(StagedWrite {
        temp,
        destination: destination.to_path_buf(),
    })
}

pub fn write_json_atomic<T: Serialize>(
    destination: &Utf8Path,
    value: &T,
) -> Result<(), SourcedError> {
    stage_json(destination, value)?.commit()
}
