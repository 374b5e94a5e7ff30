use std::fs;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::SourcedError;
use crate::parallel::{Workload, workers};
use crate::store::STORE_FILE_NAME;

pub const CONFIG_VERSION: &str = "0.0.1";
pub const DATA_VERSION: &str = "0.0.1";
pub const SETTINGS_FILE_NAME: &str = "config.json";
pub const CONFIG_DIR_ENV: &str = "SOURCED_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "SOURCED_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tuning {
    #[serde(default)]
    pub io_workers: Option<usize>,
    #[serde(default)]
    pub analysis_workers: Option<usize>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: usize,
    #[serde(default = "default_download_buffer_factor")]
    pub download_buffer_factor: usize,
    #[serde(default = "default_analysis_buffer_factor")]
    pub analysis_buffer_factor: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            io_workers: None,
            analysis_workers: None,
            poll_interval_ms: default_poll_interval_ms(),
            scan_batch_size: default_scan_batch_size(),
            download_buffer_factor: default_download_buffer_factor(),
            analysis_buffer_factor: default_analysis_buffer_factor(),
        }
    }
}

impl Tuning {
    pub fn io_workers(&self) -> usize {
        self.io_workers
            .unwrap_or_else(|| workers(Workload::Io))
            .max(1)
    }

    pub fn analysis_workers(&self) -> usize {
        self.analysis_workers
            .unwrap_or_else(|| workers(Workload::Both))
            .max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn download_max_in_flight(&self) -> usize {
        self.io_workers() * self.download_buffer_factor.max(1)
    }

    pub fn analysis_max_in_flight(&self) -> usize {
        self.analysis_workers() * self.analysis_buffer_factor.max(1)
    }

    pub fn scan_batch_size(&self) -> usize {
        self.scan_batch_size.max(1)
    }
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_scan_batch_size() -> usize {
    64
}

fn default_download_buffer_factor() -> usize {
    2
}

fn default_analysis_buffer_factor() -> usize {
    64
}

#[derive(Debug, Clone)]
pub struct Settings {
    config_dir: Utf8PathBuf,
    data_dir: Utf8PathBuf,
    tuning: Tuning,
}

impl Settings {
    /// Resolves the per-user directories (overridable through
    /// `SOURCED_CONFIG_DIR` / `SOURCED_DATA_DIR`) and loads the optional
    /// tuning file from the config directory.
    pub fn resolve() -> Result<Self, SourcedError> {
        let dirs = ProjectDirs::from("", "sourced", "sourced");

        let config_dir = match std::env::var(CONFIG_DIR_ENV) {
            Ok(value) if !value.trim().is_empty() => Utf8PathBuf::from(value.trim()),
            _ => dirs
                .as_ref()
                .and_then(|dirs| {
                    Utf8PathBuf::from_path_buf(dirs.config_dir().join(CONFIG_VERSION)).ok()
                })
                .ok_or_else(|| {
                    SourcedError::Filesystem("unable to resolve config directory".to_string())
                })?,
        };
        let data_dir = match std::env::var(DATA_DIR_ENV) {
            Ok(value) if !value.trim().is_empty() => Utf8PathBuf::from(value.trim()),
            _ => dirs
                .as_ref()
                .and_then(|dirs| {
                    Utf8PathBuf::from_path_buf(dirs.cache_dir().join(DATA_VERSION)).ok()
                })
                .ok_or_else(|| {
                    SourcedError::Filesystem("unable to resolve data directory".to_string())
                })?,
        };

        let tuning = Self::load_tuning(&config_dir.join(SETTINGS_FILE_NAME))?;
        Ok(Self {
            config_dir,
            data_dir,
            tuning,
        })
    }

    pub fn with_paths(config_dir: Utf8PathBuf, data_dir: Utf8PathBuf) -> Self {
        Self {
            config_dir,
            data_dir,
            tuning: Tuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn load_tuning(path: &Utf8Path) -> Result<Tuning, SourcedError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Tuning::default()),
            Err(_) => return Err(SourcedError::ConfigRead(path.as_std_path().to_path_buf())),
        };
        serde_json::from_str(&content).map_err(|err| SourcedError::ConfigParse(err.to_string()))
    }

    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn store_path(&self) -> Utf8PathBuf {
        self.config_dir.join(STORE_FILE_NAME)
    }

    pub fn dataset_dir(&self, name: &str) -> Utf8PathBuf {
        self.data_dir.join(name)
    }

    pub fn ensure_dirs(&self) -> Result<(), SourcedError> {
        for dir in [&self.config_dir, &self.data_dir] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| SourcedError::Filesystem(format!("create {dir}: {err}")))?;
        }
        Ok(())
    }
}
