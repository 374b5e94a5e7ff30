use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use zip::write::SimpleFileOptions;

use sourced::analyzers::{ReadStatus, Utf8Check};
use sourced::app::{App, CreateRequest, DownloadOptions, tally_analysis};
use sourced::config::{Settings, Tuning};
use sourced::domain::IndexSource;
use sourced::error::SourcedError;
use sourced::index::{IndexFile, PackageIndex};
use sourced::output::JsonOutput;
use sourced::progress::{NullSink, ProgressSink};
use sourced::scan::ScanOptions;
use sourced::store::{GlobalStore, SourceStatus};

/// Popular list is `requests, idna, six`; only `requests` has an sdist.
struct MockIndex {
    sdist: PathBuf,
    index_calls: AtomicUsize,
}

impl MockIndex {
    fn new(fixtures: &Path) -> Self {
        let sdist = fixtures.join("requests-2.0.zip");
        let mut writer = zip::ZipWriter::new(File::create(&sdist).unwrap());
        writer
            .start_file("requests-2.0/requests/api.py", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"def get(url):\n    pass\n").unwrap();
        writer.finish().unwrap();
        Self {
            sdist,
            index_calls: AtomicUsize::new(0),
        }
    }
}

impl PackageIndex for MockIndex {
    fn list_all_names(&self) -> Result<Vec<String>, SourcedError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["aaa".into(), "requests".into()])
    }

    fn list_popular_names(&self) -> Result<Vec<String>, SourcedError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["requests".into(), "idna".into(), "six".into()])
    }

    fn list_files(&self, name: &str) -> Result<Vec<IndexFile>, SourcedError> {
        if name != "requests" {
            return Ok(Vec::new());
        }
        Ok(vec![IndexFile {
            url: "mock://requests-2.0.zip".to_string(),
            filename: "requests-2.0.zip".to_string(),
        }])
    }

    fn download(
        &self,
        _url: &str,
        destination: &Path,
        _on_bytes: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<(), SourcedError> {
        fs::copy(&self.sdist, destination)
            .map(|_| ())
            .map_err(|err| SourcedError::Filesystem(err.to_string()))
    }
}

struct Fixture {
    _temp: tempfile::TempDir,
    settings: Settings,
    index: Arc<MockIndex>,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    fs::create_dir_all(root.join("fixtures")).unwrap();
    let settings = Settings::with_paths(root.join("config"), root.join("data")).with_tuning(
        Tuning {
            io_workers: Some(2),
            analysis_workers: Some(2),
            poll_interval_ms: 10,
            ..Tuning::default()
        },
    );
    let index = Arc::new(MockIndex::new(root.join("fixtures").as_std_path()));
    Fixture {
        _temp: temp,
        settings,
        index,
    }
}

fn request(source: IndexSource, fresh_index: bool) -> CreateRequest {
    CreateRequest {
        name: "popular".parse().unwrap(),
        source,
        sample_size: Some(20),
        base_data_dir: None,
        fresh_index,
    }
}

fn sink() -> Arc<dyn ProgressSink> {
    Arc::new(NullSink)
}

#[test]
fn create_download_and_analyze() {
    let fixture = fixture();
    let mut app = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();

    let created = app
        .create_dataset(request(IndexSource::PypiPopular, false), &sink())
        .unwrap();
    assert_eq!(created.action, "index");
    assert_eq!(created.summary.total, 3);
    assert_eq!(created.summary.awaiting_download, 3);

    let cancel = AtomicBool::new(false);
    let report = app
        .download("popular", DownloadOptions::default(), sink(), &cancel)
        .unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.skipped.len(), 2);

    let info = app.info("popular").unwrap();
    assert_eq!(info.summary.downloaded, 1);
    assert_eq!(info.summary.skipped, 2);

    let analysis = app
        .analyze("popular", Utf8Check, &ScanOptions::default(), sink())
        .unwrap();
    let result = tally_analysis("popular", analysis, |status| *status, |_| {}).unwrap();
    assert_eq!(result.files, 1);
    assert_eq!(result.outcomes.get(&ReadStatus::Readable.to_string()), Some(&1));

    // The store on disk sees the same state.
    let store = GlobalStore::from_file(&fixture.settings.store_path()).unwrap();
    let dataset = store.get("popular").unwrap();
    assert_eq!(
        dataset.source("requests").unwrap().status,
        SourceStatus::Downloaded
    );
    JsonOutput::print_list(&app.list()).unwrap();
}

#[test]
fn existing_cache_is_reused() {
    let fixture = fixture();
    let mut app = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    app.create_dataset(request(IndexSource::PypiPopular, false), &sink())
        .unwrap();

    let mut reopened = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    let created = reopened
        .create_dataset(request(IndexSource::PypiPopular, false), &sink())
        .unwrap();
    assert_eq!(created.action, "cache");
    assert_eq!(fixture.index.index_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn full_index_over_existing_cache_needs_fresh_index() {
    let fixture = fixture();
    let mut app = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    app.create_dataset(request(IndexSource::PypiPopular, false), &sink())
        .unwrap();

    let err = app
        .create_dataset(request(IndexSource::PypiAll, false), &sink())
        .unwrap_err();
    assert_matches!(err, SourcedError::InvalidOptions(_));

    let created = app
        .create_dataset(request(IndexSource::PypiAll, true), &sink())
        .unwrap();
    assert_eq!(created.action, "index");
    assert_eq!(created.summary.total, 2);
}

#[test]
fn retry_skipped_requeues_sources() {
    let fixture = fixture();
    let mut app = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    app.create_dataset(request(IndexSource::PypiPopular, false), &sink())
        .unwrap();
    let cancel = AtomicBool::new(false);
    app.download("popular", DownloadOptions::default(), sink(), &cancel)
        .unwrap();

    let again = app
        .download("popular", DownloadOptions::default(), sink(), &cancel)
        .unwrap();
    assert_eq!(again.attempted, 0);

    let retried = app
        .download(
            "popular",
            DownloadOptions {
                retry_skipped: true,
            },
            sink(),
            &cancel,
        )
        .unwrap();
    assert_eq!(retried.attempted, 2);
    assert_eq!(retried.skipped.len(), 2);
}

#[test]
fn unknown_dataset_is_not_found() {
    let fixture = fixture();
    let mut app = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    assert_matches!(app.info("missing"), Err(SourcedError::DatasetNotFound(_)));
    let cancel = AtomicBool::new(false);
    let err = app
        .download("missing", DownloadOptions::default(), sink(), &cancel)
        .unwrap_err();
    assert_matches!(err, SourcedError::DatasetNotFound(_));
}

#[test]
fn copied_cache_downloads_into_new_location() {
    let fixture = fixture();
    let mut app = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    app.create_dataset(request(IndexSource::PypiPopular, false), &sink())
        .unwrap();

    let old = fixture.settings.dataset_dir("popular");
    let moved_base = fixture.settings.data_dir().join("elsewhere");
    fs::create_dir_all(&moved_base).unwrap();
    fs::rename(&old, moved_base.join("popular")).unwrap();

    let mut reopened = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    let created = reopened
        .create_dataset(
            CreateRequest {
                base_data_dir: Some(moved_base.clone()),
                ..request(IndexSource::PypiPopular, false)
            },
            &sink(),
        )
        .unwrap();
    assert_eq!(created.action, "cache");
    assert_eq!(created.path, moved_base.join("popular").as_str());

    let cancel = AtomicBool::new(false);
    let report = reopened
        .download("popular", DownloadOptions::default(), sink(), &cancel)
        .unwrap();
    assert_eq!(report.downloaded, 1);
    assert!(moved_base.join("popular").join("requests").as_std_path().is_dir());
    assert!(!old.as_std_path().exists());
}

#[test]
fn remove_unregisters_but_keeps_files() {
    let fixture = fixture();
    let mut app = App::open(fixture.settings.clone(), Arc::clone(&fixture.index)).unwrap();
    let created = app
        .create_dataset(request(IndexSource::PypiPopular, false), &sink())
        .unwrap();

    let removed = app.remove_dataset("popular").unwrap();
    assert_eq!(removed.path, created.path);
    assert!(app.store().is_empty());
    assert!(
        GlobalStore::from_file(&fixture.settings.store_path())
            .unwrap()
            .is_empty()
    );
    assert!(Utf8PathBuf::from(created.path).join("dataset.json").as_std_path().exists());
    assert_matches!(
        app.remove_dataset("popular"),
        Err(SourcedError::DatasetNotFound(_))
    );
}
