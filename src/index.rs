use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::archive::{ArchiveFormat, detect_format};
use crate::error::SourcedError;

pub const BASE_PYPI_URL: &str = "https://pypi.org";
pub const POPULAR_PYPI_PACKAGES_INDEX: &str =
    "https://hugovk.github.io/top-pypi-packages/top-pypi-packages-30-days.min.json";
const SIMPLE_JSON: &str = "application/vnd.pypi.simple.v1+json";
const DOWNLOAD_CHUNK: usize = 64 * 1024;
/// Whole-request deadline for index listings. Archive downloads have none,
/// only the connect timeout.
pub const LISTING_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexFile {
    pub url: String,
    pub filename: String,
}

pub trait PackageIndex: Send + Sync {
    fn list_all_names(&self) -> Result<Vec<String>, SourcedError>;
    fn list_popular_names(&self) -> Result<Vec<String>, SourcedError>;
    fn list_files(&self, name: &str) -> Result<Vec<IndexFile>, SourcedError>;
    /// Streams `url` into `destination`, reporting `(bytes_seen, total)`.
    fn download(
        &self,
        url: &str,
        destination: &Path,
        on_bytes: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<(), SourcedError>;
}

/// Newest file (listings are oldest first) whose archive format we can unpack.
pub fn select_artifact(files: &[IndexFile]) -> Option<(&IndexFile, ArchiveFormat)> {
    files
        .iter()
        .rev()
        .find_map(|file| detect_format(&file.filename).map(|format| (file, format)))
}

#[derive(Debug, Deserialize)]
struct SimpleIndex {
    projects: Vec<SimpleProject>,
}

#[derive(Debug, Deserialize)]
struct SimpleProject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProjectPage {
    files: Vec<IndexFile>,
}

#[derive(Debug, Deserialize)]
struct PopularIndex {
    rows: Vec<PopularRow>,
}

#[derive(Debug, Deserialize)]
struct PopularRow {
    project: String,
}

#[derive(Clone)]
pub struct PypiClient {
    client: Client,
    base_url: String,
    popular_url: String,
    listing_timeout: Duration,
}

impl PypiClient {
    pub fn new() -> Result<Self, SourcedError> {
        Self::with_urls(BASE_PYPI_URL, POPULAR_PYPI_PACKAGES_INDEX)
    }

    pub fn with_urls(base_url: &str, popular_url: &str) -> Result<Self, SourcedError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("sourced/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SourcedError::IndexHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(None::<Duration>)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| SourcedError::IndexHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            popular_url: popular_url.to_string(),
            listing_timeout: LISTING_TIMEOUT,
        })
    }

    pub fn with_listing_timeout(mut self, timeout: Duration) -> Self {
        self.listing_timeout = timeout;
        self
    }

    fn simple_url(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{}/simple/{}/", self.base_url, name),
            None => format!("{}/simple/", self.base_url),
        }
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SourcedError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "package index request failed".to_string());
        Err(SourcedError::IndexStatus { status, message })
    }

    fn get_simple_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SourcedError> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, SIMPLE_JSON)
            .timeout(self.listing_timeout)
            .send()
            .map_err(|err| SourcedError::IndexHttp(err.to_string()))?;
        Self::handle_status(response)?
            .json()
            .map_err(|err| SourcedError::IndexHttp(err.to_string()))
    }
}

impl PackageIndex for PypiClient {
    fn list_all_names(&self) -> Result<Vec<String>, SourcedError> {
        let index: SimpleIndex = self.get_simple_json(&self.simple_url(None))?;
        Ok(index
            .projects
            .into_iter()
            .map(|project| project.name)
            .collect())
    }

    fn list_popular_names(&self) -> Result<Vec<String>, SourcedError> {
        let response = self
            .client
            .get(&self.popular_url)
            .timeout(self.listing_timeout)
            .send()
            .map_err(|err| SourcedError::IndexHttp(err.to_string()))?;
        let index: PopularIndex = Self::handle_status(response)?
            .json()
            .map_err(|err| SourcedError::IndexHttp(err.to_string()))?;
        Ok(index.rows.into_iter().map(|row| row.project).collect())
    }

    fn list_files(&self, name: &str) -> Result<Vec<IndexFile>, SourcedError> {
        let page: ProjectPage = self.get_simple_json(&self.simple_url(Some(name)))?;
        Ok(page.files)
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        on_bytes: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<(), SourcedError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| SourcedError::IndexHttp(err.to_string()))?;
        let mut response = Self::handle_status(response)?;
        let total = response.content_length();

        let mut file =
            File::create(destination).map_err(|err| SourcedError::Filesystem(err.to_string()))?;
        let mut buffer = vec![0u8; DOWNLOAD_CHUNK];
        let mut seen = 0u64;
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| SourcedError::IndexHttp(err.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
            seen += read as u64;
            on_bytes(seen, total);
        }
        file.flush()
            .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
