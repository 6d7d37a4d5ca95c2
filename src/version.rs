//! Version label resolution.
//!
//! Catalog records do not always carry a version label, so one is recovered
//! from the download URL instead. Resolution never fails: the worst case is the
//! [`UNKNOWN_VERSION`] sentinel.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;

use crate::record::DeviceRecord;

/// Returned when nothing usable can be recovered from the URL.
pub const UNKNOWN_VERSION: &str = "unknown_version";

static VERSION_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._]+$").expect("segment pattern is valid"));

static VERSION_IN_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"V\d+\.\d+\.\d+\.\d+\.[A-Z]+|[A-Z]+\d+\.\d+").expect("filename pattern is valid")
});

const ARCHIVE_EXTENSIONS: [&str; 7] = [".zip", ".tgz", ".tar", ".gz", ".xz", ".7z", ".bin"];

/// Where the version label of a job comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum VersionSource {
    /// Use the record's label; derive from the URL only when it is empty.
    #[default]
    Label,
    /// Always derive the version from the URL.
    Url,
}

impl VersionSource {
    pub fn resolve(self, record: &DeviceRecord) -> String {
        match self {
            VersionSource::Label if !record.version_label.is_empty() => {
                record.version_label.clone()
            }
            _ => version_from_url(&record.source_url),
        }
    }
}

fn has_archive_extension(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn url_path(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        // Not an absolute URL: drop any scheme/authority by hand and keep the rest.
        Err(_) => {
            let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
            let rest = rest.split(['?', '#']).next().unwrap_or_default();
            match rest.find('/') {
                Some(idx) if url.contains("://") => rest[idx..].to_string(),
                Some(_) => rest.to_string(),
                None if url.contains("://") => String::new(),
                None => rest.to_string(),
            }
        }
    }
}

/// Best-effort version label recovered from a download URL.
///
/// In order: the first path segment that looks like a version token, a version
/// number embedded in the filename, the last non-empty path segment, and
/// finally [`UNKNOWN_VERSION`]. The result is never empty.
pub fn version_from_url(url: &str) -> String {
    let path = url_path(url);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if let Some(segment) = segments
        .iter()
        .find(|s| VERSION_SEGMENT.is_match(s) && !has_archive_extension(s))
    {
        return (*segment).to_string();
    }

    if let Some(filename) = segments.last() {
        let stem = filename
            .strip_suffix(".zip")
            .unwrap_or(filename);
        if let Some(m) = VERSION_IN_FILENAME.find(stem) {
            return m.as_str().to_string();
        }
        return (*filename).to_string();
    }

    UNKNOWN_VERSION.to_string()
}
