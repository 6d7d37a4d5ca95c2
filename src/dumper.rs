//! Extraction through an external payload dumping tool.
//!
//! The tool is run as `<program> [extra args] --partitions <list> <url>` and
//! performs its own range reads against the URL. It writes `<partition>.img`
//! files into a fixed `output/` directory below its working directory. Each job
//! gets a fresh scratch directory as that working directory, and the scratch
//! directory is removed when the job ends, however it ends.

use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::ExtractionJob;
use crate::layout::{ExtractionReport, OutputLayout, StrategyKind, move_into_place};

/// Default program name of the dumping tool.
pub const DEFAULT_DUMPER: &str = "payload_dumper";

/// Directory, relative to the tool's working directory, that receives images.
pub const SCRATCH_OUTPUT_DIR: &str = "output";

/// How to invoke the dumping tool.
#[derive(Debug, Clone)]
pub struct DumperConfig {
    pub program: OsString,
    /// Arguments placed before `--partitions`.
    pub extra_args: Vec<OsString>,
}

impl Default for DumperConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_DUMPER.into(),
            extra_args: Vec::new(),
        }
    }
}

/// Runs the dumping tool for payload packages.
#[derive(Debug, Clone, Default)]
pub struct PayloadDumper {
    config: DumperConfig,
}

/// Last few lines of tool output, for error messages.
fn tail(bytes: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join(" | ")
}

impl PayloadDumper {
    pub fn new(config: DumperConfig) -> Self {
        Self { config }
    }

    fn program_name(&self) -> String {
        self.config.program.to_string_lossy().into_owned()
    }

    fn scratch_dir(&self, layout: &OutputLayout) -> Result<TempDir> {
        let root = layout.root();
        fs::create_dir_all(root).map_err(|e| Error::fs(root, e))?;
        // Inside the output root so finished images can be renamed into place.
        tempfile::Builder::new()
            .prefix(".dumper-")
            .tempdir_in(root)
            .map_err(|e| Error::fs(root, e))
    }

    /// Run the tool for `job` and move its images into the canonical layout.
    pub fn extract(&self, job: &ExtractionJob, layout: &OutputLayout) -> Result<ExtractionReport> {
        let scratch = self.scratch_dir(layout)?;
        let result = self.run_in(&scratch, job, layout);
        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(path = %scratch_path.display(), "unable to remove scratch directory: {e}");
        }
        result
    }

    fn run_in(
        &self,
        scratch: &TempDir,
        job: &ExtractionJob,
        layout: &OutputLayout,
    ) -> Result<ExtractionReport> {
        let program = self.program_name();
        debug!(
            program = %program,
            partitions = %job.partitions,
            cwd = %scratch.path().display(),
            "running payload dumper"
        );

        let output = Command::new(&self.config.program)
            .args(&self.config.extra_args)
            .arg("--partitions")
            .arg(job.partitions.to_arg())
            .arg(job.url())
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::ExternalTool {
                program: program.clone(),
                reason: format!("unable to start: {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::ExternalTool {
                program,
                reason: format!("{} ({})", output.status, tail(&output.stderr, 3)),
            });
        }
        debug!(program = %program, "{}", tail(&output.stdout, 5));

        let produced: PathBuf = scratch.path().join(SCRATCH_OUTPUT_DIR);
        let mut report = ExtractionReport::new(StrategyKind::PayloadDumper);
        for partition in job.partitions.names() {
            let file_name = format!("{partition}.img");
            let source = produced.join(&file_name);
            if !source.is_file() {
                report.missing.insert(partition.to_string());
                continue;
            }
            let target = layout.image_path(job, partition, &file_name);
            report.record(move_into_place(&source, &target)?);
        }

        if !report.missing.is_empty() {
            warn!(
                device = job.device(),
                version = %job.resolved_version,
                "partitions not produced by dumper: {}",
                report.missing.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        Ok(report)
    }
}
