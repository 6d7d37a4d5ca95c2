//! Error types shared by every stage of the extraction pipeline.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading input or processing one job.
///
/// Only [`Error::NoRecords`] ends the process. Every other variant is scoped to
/// a single line or a single job and is reported by the driver before it moves
/// on to the next record.
#[derive(Debug, Error)]
pub enum Error {
    /// A device-list line could not be parsed into a record.
    #[error("line {line}: {reason}")]
    InputParse { line: usize, reason: String },

    /// The device list produced no usable record at all.
    #[error("no valid device records found in {}", path.display())]
    NoRecords { path: PathBuf },

    /// Network or range-request failure while opening or reading a package.
    #[error("source unavailable: {url}: {reason}")]
    SourceUnavailable { url: String, reason: String },

    /// The package is not a readable zip container.
    #[error("malformed package: {url}: {reason}")]
    MalformedPackage { url: String, reason: String },

    /// The partition dumping tool could not be started or exited unsuccessfully.
    #[error("external tool `{program}` failed: {reason}")]
    ExternalTool { program: String, reason: String },

    /// Creating, writing or moving an output file failed.
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading or appending to the job log failed.
    #[error("job log {}: {source}", path.display())]
    JobLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The HTTP client could not be built.
    #[error("unable to create HTTP client: {0}")]
    HttpClient(String),

    /// The worker pool could not be started.
    #[error("unable to start worker pool: {0}")]
    WorkerPool(String),
}

impl Error {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn unavailable(url: &str, reason: impl ToString) -> Self {
        Error::SourceUnavailable {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn malformed(url: &str, reason: impl ToString) -> Self {
        Error::MalformedPackage {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly label for the error class, used in summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InputParse { .. } => "input",
            Error::NoRecords { .. } => "no-records",
            Error::SourceUnavailable { .. } => "source",
            Error::MalformedPackage { .. } => "package",
            Error::ExternalTool { .. } => "tool",
            Error::Filesystem { .. } => "filesystem",
            Error::JobLog { .. } => "job-log",
            Error::HttpClient(_) => "http-client",
            Error::WorkerPool(_) => "worker-pool",
        }
    }
}
