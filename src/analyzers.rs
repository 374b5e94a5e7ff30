use std::fmt;
use std::fs;
use std::path::Path;

use clap::ValueEnum;
use serde::Serialize;

use crate::scan::Analyzer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AnalyzerKind {
    Utf8,
    Lines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadStatus {
    Readable,
    Unreadable,
}

impl fmt::Display for ReadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadStatus::Readable => write!(f, "READABLE"),
            ReadStatus::Unreadable => write!(f, "UNREADABLE"),
        }
    }
}

/// Whether a file decodes as UTF-8 text.
pub struct Utf8Check;

impl Analyzer for Utf8Check {
    type Output = ReadStatus;

    fn analyze(&self, file: &Path) -> ReadStatus {
        match fs::read_to_string(file) {
            Ok(_) => ReadStatus::Readable,
            Err(_) => ReadStatus::Unreadable,
        }
    }
}

/// Line count of a text file, `None` when it cannot be read as text.
pub struct LineCount;

impl Analyzer for LineCount {
    type Output = Option<usize>;

    fn analyze(&self, file: &Path) -> Option<usize> {
        fs::read_to_string(file)
            .ok()
            .map(|content| content.lines().count())
    }
}
