use std::fmt;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use zip::ZipArchive;

use crate::error::SourcedError;

/// Subdirectory a lone top-level archive directory is renamed to.
pub const NORMALIZED_ROOT: &str = "src";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "gztar",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn detect_format(filename: &str) -> Option<ArchiveFormat> {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        Some(ArchiveFormat::Zip)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(ArchiveFormat::TarGz)
    } else if lower.ends_with(".tar") {
        Some(ArchiveFormat::Tar)
    } else {
        None
    }
}

pub fn extract(
    archive_path: &Path,
    destination: &Path,
    format: ArchiveFormat,
) -> Result<(), SourcedError> {
    match format {
        ArchiveFormat::Zip => extract_zip(archive_path, destination),
        ArchiveFormat::Tar => extract_tar(open(archive_path)?, destination),
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(open(archive_path)?), destination),
    }
}

fn open(path: &Path) -> Result<BufReader<fs::File>, SourcedError> {
    let file = fs::File::open(path).map_err(|err| {
        SourcedError::Filesystem(format!("open archive {}: {err}", path.display()))
    })?;
    Ok(BufReader::new(file))
}

fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), SourcedError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        SourcedError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive = ZipArchive::new(file).map_err(|err| SourcedError::Archive(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| SourcedError::Archive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(SourcedError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| SourcedError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| SourcedError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

// `tar::Archive::unpack` refuses entries that would land outside `target_dir`.
fn extract_tar<R: Read>(reader: R, target_dir: &Path) -> Result<(), SourcedError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive
        .unpack(target_dir)
        .map_err(|err| SourcedError::Archive(err.to_string()))
}

/// Renames a lone top-level directory to [`NORMALIZED_ROOT`] so every
/// extracted package has the same layout. Returns whether it did so.
pub fn normalize_single_root(destination: &Path) -> Result<bool, SourcedError> {
    let entries = fs::read_dir(destination)
        .map_err(|err| SourcedError::Filesystem(err.to_string()))?
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(|err| SourcedError::Filesystem(err.to_string()))?;

    let [entry] = entries.as_slice() else {
        return Ok(false);
    };
    let is_dir = entry
        .file_type()
        .map_err(|err| SourcedError::Filesystem(err.to_string()))?
        .is_dir();
    if !is_dir {
        return Ok(false);
    }

    let target = destination.join(NORMALIZED_ROOT);
    if entry.path() == target {
        return Ok(true);
    }
    fs::rename(entry.path(), &target).map_err(|err| SourcedError::Filesystem(err.to_string()))?;
    Ok(true)
}
