//! Device-list records and the line format produced by the catalog collector.
//!
//! Each line looks like `设备: <name>, 版本: <version>, 链接: <url>`. The version
//! may be empty; the name and URL may not.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

static RECORD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^设备:\s*(?P<name>.*?)\s*,\s*版本:\s*(?P<version>.*?)\s*,\s*链接:\s*(?P<url>\S*)\s*$")
        .expect("record line pattern is valid")
});

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Characters that are not allowed in a folder name on common filesystems.
const FORBIDDEN_PATH_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// One firmware release as listed by the device catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_name: String,
    /// Explicit version label; empty when the catalog did not provide one.
    pub version_label: String,
    pub source_url: String,
}

impl DeviceRecord {
    /// Parse a single device-list line.
    ///
    /// `line_no` is 1-based and only used for diagnostics.
    pub fn parse_line(line: &str, line_no: usize) -> Result<Self> {
        let parse_err = |reason: &str| Error::InputParse {
            line: line_no,
            reason: reason.to_string(),
        };

        let caps = RECORD_LINE
            .captures(line.trim())
            .ok_or_else(|| parse_err("expected `设备: <name>, 版本: <version>, 链接: <url>`"))?;

        let device_name = caps["name"].trim().to_string();
        if device_name.is_empty() {
            return Err(parse_err("device name is empty"));
        }

        let source_url = caps["url"].to_string();
        if source_url.is_empty() {
            return Err(parse_err("link is empty"));
        }
        if !is_http_url(&source_url) {
            return Err(parse_err(&format!(
                "link is not an http(s) URL: {source_url}"
            )));
        }

        Ok(DeviceRecord {
            device_name,
            version_label: caps["version"].trim().to_string(),
            source_url,
        })
    }

    /// The device name with forbidden path characters replaced, suitable as a folder.
    pub fn folder_name(&self) -> String {
        sanitize_path_name(&self.device_name)
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Replace characters that cannot appear in a folder name with `_` and trim
/// surrounding whitespace. The relative components `.` and `..` become `_`.
pub fn sanitize_path_name(name: &str) -> String {
    let clean = name
        .chars()
        .map(|c| {
            if FORBIDDEN_PATH_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect::<String>();
    match clean.trim() {
        "." | ".." => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

/// Parse every line of `text`, skipping (and logging) lines that do not form a
/// valid record. Blank lines are ignored silently.
pub fn parse_device_list(text: &str) -> Vec<DeviceRecord> {
    parse_device_bytes(text.as_bytes())
}

/// Like [`parse_device_list`], but lines that are not valid UTF-8 are skipped
/// the same way as malformed ones instead of failing the whole list.
pub fn parse_device_bytes(bytes: &[u8]) -> Vec<DeviceRecord> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut records = Vec::new();
    for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let line_no = idx + 1;
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let parsed = match std::str::from_utf8(raw) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => DeviceRecord::parse_line(line, line_no),
            Err(e) => Err(Error::InputParse {
                line: line_no,
                reason: format!("not valid UTF-8: {e}"),
            }),
        };
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => warn!("skipping invalid line: {e}"),
        }
    }
    records
}

/// Load the device list at `path`.
///
/// Fails with [`Error::NoRecords`] when the file holds no valid record, which is
/// the one condition that ends a run before any job starts.
pub fn load_device_list(path: &Path) -> Result<Vec<DeviceRecord>> {
    let bytes = fs::read(path).map_err(|source| Error::fs(path, source))?;
    let records = parse_device_bytes(&bytes);
    if records.is_empty() {
        return Err(Error::NoRecords {
            path: path.to_path_buf(),
        });
    }
    debug!(count = records.len(), path = %path.display(), "loaded device list");
    Ok(records)
}
