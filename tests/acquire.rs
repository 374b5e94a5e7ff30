use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use zip::write::SimpleFileOptions;

use sourced::acquire::{AcquireError, acquire_dataset, download_source, prepare_download_url};
use sourced::config::Tuning;
use sourced::error::SourcedError;
use sourced::index::{IndexFile, PackageIndex};
use sourced::progress::{NullSink, ProgressSink};
use sourced::store::{Dataset, Source, SourceStatus};

/// Serves archives from local files keyed by download URL.
#[derive(Default)]
struct LocalIndex {
    files: HashMap<String, Vec<IndexFile>>,
    blobs: HashMap<String, PathBuf>,
    lookups: Mutex<Vec<String>>,
    panics_on: Option<String>,
}

impl LocalIndex {
    fn panicking_on(mut self, project: &str) -> Self {
        self.panics_on = Some(project.to_string());
        self
    }

    fn with_archive(mut self, project: &str, filename: &str, blob: PathBuf) -> Self {
        let url = format!("file://{project}/{filename}");
        self.files.entry(project.to_string()).or_default().push(IndexFile {
            url: url.clone(),
            filename: filename.to_string(),
        });
        self.blobs.insert(url, blob);
        self
    }

    fn lookups(&self) -> Vec<String> {
        let mut lookups = self.lookups.lock().unwrap().clone();
        lookups.sort();
        lookups
    }
}

impl PackageIndex for LocalIndex {
    fn list_all_names(&self) -> Result<Vec<String>, SourcedError> {
        Ok(self.files.keys().cloned().collect())
    }

    fn list_popular_names(&self) -> Result<Vec<String>, SourcedError> {
        self.list_all_names()
    }

    fn list_files(&self, name: &str) -> Result<Vec<IndexFile>, SourcedError> {
        if self.panics_on.as_deref() == Some(name) {
            panic!("index blew up on {name}");
        }
        self.lookups.lock().unwrap().push(name.to_string());
        Ok(self.files.get(name).cloned().unwrap_or_default())
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        on_bytes: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<(), SourcedError> {
        let blob = self
            .blobs
            .get(url)
            .ok_or_else(|| SourcedError::IndexStatus {
                status: 404,
                message: url.to_string(),
            })?;
        let copied = fs::copy(blob, destination)
            .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
        on_bytes(copied, Some(copied));
        Ok(())
    }
}

fn utf8_dir(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

fn sdist_zip(dir: &Path, project: &str) -> PathBuf {
    let path = dir.join(format!("{project}-1.0.zip"));
    let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
    let options = SimpleFileOptions::default();
    writer
        .start_file(format!("{project}-1.0/{project}/__init__.py"), options)
        .unwrap();
    writer.write_all(b"VERSION = '1.0'\n").unwrap();
    writer
        .start_file(format!("{project}-1.0/setup.py"), options)
        .unwrap();
    writer.write_all(b"from setuptools import setup\nsetup()\n").unwrap();
    writer.finish().unwrap();
    path
}

fn corrupt_zip(dir: &Path, project: &str) -> PathBuf {
    let path = dir.join(format!("{project}-broken.zip"));
    fs::write(&path, b"PK\x03\x04 this is not really a zip file").unwrap();
    path
}

fn small_tuning() -> Tuning {
    Tuning {
        io_workers: Some(2),
        poll_interval_ms: 10,
        ..Tuning::default()
    }
}

fn sink() -> Arc<dyn ProgressSink> {
    Arc::new(NullSink)
}

fn dataset_at(root: &Utf8Path, names: &[&str]) -> Dataset {
    Dataset::new(
        "sample",
        root.to_path_buf(),
        names.iter().map(|name| Source::new(*name)).collect(),
    )
}

#[test]
fn project_without_archives_is_skipped() {
    let index = LocalIndex::default();
    let skip = prepare_download_url(&index, "wheels-only").unwrap_err();
    assert_eq!(skip.project, "wheels-only");
    assert_eq!(
        skip.to_string(),
        "Skipping wheels-only: no suitable archive found"
    );
}

#[test]
fn download_source_normalizes_single_root() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let index = LocalIndex::default().with_archive(
        "b",
        "b-1.0.zip",
        sdist_zip(fixtures.path(), "b"),
    );

    let path = download_source(&index, &sink(), &utf8_dir(data.path()), "b").unwrap();
    assert_eq!(path, utf8_dir(data.path()).join("b"));
    assert!(path.join("src").join("b").join("__init__.py").as_std_path().exists());
    assert!(path.join("src").join("setup.py").as_std_path().exists());
}

#[test]
fn failed_extraction_removes_directory() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let index = LocalIndex::default().with_archive(
        "broken",
        "broken-1.0.zip",
        corrupt_zip(fixtures.path(), "broken"),
    );

    let err = download_source(&index, &sink(), &utf8_dir(data.path()), "broken").unwrap_err();
    assert_matches!(err, AcquireError::Failed { ref project, .. } if project == "broken");
    assert!(!data.path().join("broken").exists());
}

#[test]
fn unsafe_project_name_is_skipped() {
    let data = tempfile::tempdir().unwrap();
    let index = LocalIndex::default();
    let err = download_source(&index, &sink(), &utf8_dir(data.path()), "../up").unwrap_err();
    assert_matches!(err, AcquireError::Skip(_));
    assert!(index.lookups().is_empty());
}

#[test]
fn acquisition_records_outcomes_and_persists() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let root = utf8_dir(data.path());
    let index = Arc::new(LocalIndex::default().with_archive(
        "b",
        "b-1.0.zip",
        sdist_zip(fixtures.path(), "b"),
    ));

    let mut dataset = dataset_at(&root, &["a", "b"]);
    let cancel = AtomicBool::new(false);
    let report = acquire_dataset(index, &mut dataset, &small_tuning(), sink(), &cancel).unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].project, "a");
    assert!(report.failed.is_empty());
    assert!(!report.interrupted);

    let a = dataset.source("a").unwrap();
    assert_eq!(a.status, SourceStatus::Skipped);
    assert_eq!(a.path, None);
    let b = dataset.source("b").unwrap();
    assert_eq!(b.status, SourceStatus::Downloaded);
    assert!(b.path.as_ref().unwrap().join("src").as_std_path().is_dir());

    let reloaded = Dataset::from_cache(&root).unwrap();
    assert_eq!(reloaded, dataset);
}

#[test]
fn resume_only_attempts_pending_sources() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let root = utf8_dir(data.path());
    let index = Arc::new(
        LocalIndex::default()
            .with_archive("b", "b-1.0.zip", sdist_zip(fixtures.path(), "b"))
            .with_archive("c", "c-1.0.zip", sdist_zip(fixtures.path(), "c")),
    );

    let mut a = Source::new("a");
    a.mark_skipped();
    let mut b = Source::new("b");
    fs::create_dir_all(root.join("b").join("src")).unwrap();
    b.mark_downloaded(root.join("b"));
    let mut dataset = Dataset::new("sample", root.clone(), vec![a, b, Source::new("c")]);

    let cancel = AtomicBool::new(false);
    let report = acquire_dataset(
        Arc::clone(&index),
        &mut dataset,
        &small_tuning(),
        sink(),
        &cancel,
    )
    .unwrap();

    assert_eq!(index.lookups(), ["c"]);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.downloaded, 1);
    assert_eq!(dataset.summary().downloaded, 2);
    assert_eq!(dataset.source("a").unwrap().status, SourceStatus::Skipped);
}

#[test]
fn failed_source_stays_pending() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let root = utf8_dir(data.path());
    let index = Arc::new(LocalIndex::default().with_archive(
        "broken",
        "broken-1.0.zip",
        corrupt_zip(fixtures.path(), "broken"),
    ));

    let mut dataset = dataset_at(&root, &["broken"]);
    let cancel = AtomicBool::new(false);
    let report = acquire_dataset(index, &mut dataset, &small_tuning(), sink(), &cancel).unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].project, "broken");
    let source = dataset.source("broken").unwrap();
    assert!(source.is_pending());
    assert_eq!(source.path, None);
    assert!(!root.join("broken").as_std_path().exists());
}

#[test]
fn leftover_directory_is_replaced() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let root = utf8_dir(data.path());
    fs::create_dir_all(root.join("b").join("half-written")).unwrap();
    let index = Arc::new(LocalIndex::default().with_archive(
        "b",
        "b-1.0.zip",
        sdist_zip(fixtures.path(), "b"),
    ));

    let mut dataset = dataset_at(&root, &["b"]);
    let cancel = AtomicBool::new(false);
    acquire_dataset(index, &mut dataset, &small_tuning(), sink(), &cancel).unwrap();

    assert!(!root.join("b").join("half-written").as_std_path().exists());
    assert!(root.join("b").join("src").as_std_path().is_dir());
}

#[test]
fn panicking_download_is_reported_as_failed() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let root = utf8_dir(data.path());
    let index = Arc::new(
        LocalIndex::default()
            .with_archive("b", "b-1.0.zip", sdist_zip(fixtures.path(), "b"))
            .panicking_on("boom"),
    );

    let mut dataset = dataset_at(&root, &["a", "boom", "b"]);
    let cancel = AtomicBool::new(false);
    let report = acquire_dataset(index, &mut dataset, &small_tuning(), sink(), &cancel).unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(
        report.downloaded + report.skipped.len() + report.failed.len(),
        report.attempted
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].project, "boom");
    assert!(report.failed[0].message.contains("index blew up on boom"));
    assert!(dataset.source("boom").unwrap().is_pending());
    assert!(!root.join("boom").as_std_path().exists());
    assert_eq!(dataset.source("b").unwrap().status, SourceStatus::Downloaded);
}

#[test]
fn cancelled_run_saves_and_stops() {
    let fixtures = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let root = utf8_dir(data.path());
    let names: Vec<String> = (0..20).map(|n| format!("pkg{n}")).collect();
    let index = Arc::new(names.iter().fold(LocalIndex::default(), |index, name| {
        let filename = format!("{name}-1.0.zip");
        index.with_archive(name, &filename, sdist_zip(fixtures.path(), name))
    }));
    let mut dataset = Dataset::new(
        "sample",
        root.clone(),
        names.iter().map(Source::new).collect(),
    );

    let cancel = AtomicBool::new(true);
    let tuning = Tuning {
        io_workers: Some(1),
        download_buffer_factor: 6,
        poll_interval_ms: 10,
        ..Tuning::default()
    };
    let report = acquire_dataset(
        Arc::clone(&index),
        &mut dataset,
        &tuning,
        sink(),
        &cancel,
    )
    .unwrap();

    assert!(report.interrupted);
    assert!(report.attempted <= tuning.download_max_in_flight());
    assert_eq!(index.lookups().len(), report.attempted);
    assert_eq!(report.downloaded, report.attempted);

    let saved = Dataset::from_cache(&root).unwrap();
    assert_eq!(saved, dataset);
    assert_eq!(saved.summary().downloaded, report.downloaded);
    assert_eq!(saved.summary().awaiting_download, 20 - report.downloaded);

    let mut on_disk: Vec<String> = fs::read_dir(data.path())
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| entry.file_type().unwrap().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    on_disk.sort();
    let mut recorded: Vec<String> = saved
        .sources
        .iter()
        .filter(|source| source.status == SourceStatus::Downloaded)
        .map(|source| source.name.clone())
        .collect();
    recorded.sort();
    assert_eq!(on_disk, recorded);
}
