use assert_matches::assert_matches;

use sourced::domain::{DatasetName, IndexSource, is_safe_component};
use sourced::error::SourcedError;
use sourced::parallel::{Workload, workers_for};

#[test]
fn parse_dataset_name_valid() {
    let name: DatasetName = " pypi-popular_2024 ".parse().unwrap();
    assert_eq!(name.as_str(), "pypi-popular_2024");
}

#[test]
fn parse_dataset_name_invalid() {
    for value in ["", "../escape", "a/b", ".hidden"] {
        let err = value.parse::<DatasetName>().unwrap_err();
        assert_matches!(err, SourcedError::InvalidDatasetName(_));
    }
}

#[test]
fn package_names_as_directories() {
    assert!(is_safe_component("zope.interface"));
    assert!(is_safe_component("typing_extensions"));
    assert!(!is_safe_component(".."));
    assert!(!is_safe_component(".hidden"));
    assert!(!is_safe_component("evil/../../x"));
    assert!(!is_safe_component(""));
}

#[test]
fn index_source_display() {
    assert_eq!(IndexSource::PypiPopular.to_string(), "pypi-popular");
    assert_eq!(IndexSource::PypiAll.to_string(), "pypi-all");
}

#[test]
fn workload_sizing() {
    assert_eq!(workers_for(Workload::Io, 2), 8);
    assert_eq!(workers_for(Workload::Cpu, 4), 5);
    assert_eq!(workers_for(Workload::Cpu, 6), 8);
    assert_eq!(workers_for(Workload::Both, 3), 6);
    assert_matches!("disk".parse::<Workload>(), Err(SourcedError::InvalidWorkload(_)));
}
