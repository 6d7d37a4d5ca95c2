//! Canonical output layout: `<root>/<device>/<partition>/<version>_<file>`.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::job::ExtractionJob;

const COPY_CHUNK_SIZE: usize = 64 * 1024; // 64KB chunk size for streaming copies

/// Which extractor handled a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Zip,
    PayloadDumper,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Zip => f.write_str("zip"),
            StrategyKind::PayloadDumper => f.write_str("payload"),
        }
    }
}

/// Outcome of one extraction. Missing partitions are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub strategy: StrategyKind,
    /// Images written by this job.
    pub written: Vec<PathBuf>,
    /// Targets that were already on disk and left untouched.
    pub existing: Vec<PathBuf>,
    /// Requested partitions with no matching image.
    pub missing: BTreeSet<String>,
}

impl ExtractionReport {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            written: Vec::new(),
            existing: Vec::new(),
            missing: BTreeSet::new(),
        }
    }

    pub(crate) fn record(&mut self, placement: Placement) {
        match placement {
            Placement::Written(path) => self.written.push(path),
            Placement::Existing(path) => self.existing.push(path),
        }
    }
}

/// Where a single image ended up.
#[derive(Debug)]
pub(crate) enum Placement {
    Written(PathBuf),
    Existing(PathBuf),
}

/// Resolves canonical paths below an output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<sanitized device>/<partition>`
    pub fn partition_dir(&self, job: &ExtractionJob, partition: &str) -> PathBuf {
        self.root.join(job.record.folder_name()).join(partition)
    }

    /// `<root>/<sanitized device>/<partition>/<version>_<file_name>`
    pub fn image_path(&self, job: &ExtractionJob, partition: &str, file_name: &str) -> PathBuf {
        self.partition_dir(job, partition)
            .join(format!("{}_{}", job.resolved_version, file_name))
    }
}

fn create_parent(target: &Path) -> Result<&Path> {
    let dir = target
        .parent()
        .ok_or_else(|| Error::fs(target, io::Error::other("target has no parent directory")))?;
    fs::create_dir_all(dir).map_err(|e| Error::fs(dir, e))?;
    Ok(dir)
}

/// Stream `reader` into `target` without ever replacing an existing file.
///
/// Bytes go to a temp file next to the target first, so an interrupted copy
/// never leaves a truncated image at the canonical path. Read errors are blamed
/// on the package at `url`; write errors on the filesystem.
pub(crate) fn write_new(target: &Path, url: &str, reader: &mut dyn Read) -> Result<Placement> {
    if target.exists() {
        warn!(path = %target.display(), "image already exists, leaving it untouched");
        return Ok(Placement::Existing(target.to_path_buf()));
    }
    let dir = create_parent(target)?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::fs(dir, e))?;

    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(Error::malformed(url, e));
            }
            Err(e) => return Err(Error::unavailable(url, e)),
        };
        tmp.write_all(&buf[..n])
            .map_err(|e| Error::fs(tmp.path(), e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::fs(tmp.path(), e))?;

    match tmp.persist_noclobber(target) {
        Ok(_) => Ok(Placement::Written(target.to_path_buf())),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            warn!(path = %target.display(), "image appeared concurrently, keeping the existing one");
            Ok(Placement::Existing(target.to_path_buf()))
        }
        Err(e) => Err(Error::fs(target, e.error)),
    }
}

/// Move a finished image from scratch space to `target`.
///
/// Falls back to copy-and-remove when the scratch directory lives on another
/// filesystem.
pub(crate) fn move_into_place(source: &Path, target: &Path) -> Result<Placement> {
    if target.exists() {
        warn!(path = %target.display(), "image already exists, leaving it untouched");
        return Ok(Placement::Existing(target.to_path_buf()));
    }
    create_parent(target)?;
    if fs::rename(source, target).is_err() {
        fs::copy(source, target).map_err(|e| Error::fs(target, e))?;
        fs::remove_file(source).map_err(|e| Error::fs(source, e))?;
    }
    info!("{} -> {}", source.display(), target.display());
    Ok(Placement::Written(target.to_path_buf()))
}
