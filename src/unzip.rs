//! Direct extraction of partition images stored as plain zip entries.

use std::collections::BTreeSet;
use std::io::{Read, Seek};

use tracing::{info, warn};

use crate::error::Result;
use crate::inspect::{Package, map_zip_err};
use crate::job::ExtractionJob;
use crate::layout::{ExtractionReport, OutputLayout, StrategyKind, write_new};

/// Copy every entry matching a requested partition to
/// `<device>/<partition>/<version>_<entry file name>`.
///
/// Only the matched entries are read from the source. Requested partitions
/// without any matching entry end up in [`ExtractionReport::missing`].
pub fn extract_zip_partitions<R: Read + Seek>(
    package: &mut Package<R>,
    job: &ExtractionJob,
    layout: &OutputLayout,
) -> Result<ExtractionReport> {
    let mut report = ExtractionReport::new(StrategyKind::Zip);
    let entries = package.partition_entries(&job.partitions);
    let url = package.url().to_string();

    let mut found = BTreeSet::new();
    for entry in &entries {
        let target = layout.image_path(job, &entry.partition, &entry.file_name);
        let mut file = package
            .archive_mut()
            .by_index(entry.index)
            .map_err(|e| map_zip_err(&url, e))?;
        let placement = write_new(&target, &url, &mut file)?;
        info!(device = job.device(), "{} -> {}", entry.name, target.display());
        report.record(placement);
        found.insert(entry.partition.as_str());
    }

    report.missing = job
        .partitions
        .names()
        .filter(|p| !found.contains(p))
        .map(str::to_string)
        .collect();
    if !report.missing.is_empty() {
        warn!(
            device = job.device(),
            version = %job.resolved_version,
            "partitions not found in zip: {}",
            report.missing.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    Ok(report)
}
