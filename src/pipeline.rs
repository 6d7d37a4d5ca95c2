//! The driver: turns device records into extraction jobs and runs them on a
//! bounded worker pool.
//!
//! Jobs are handed to workers in input order through a channel. Each worker owns
//! its job end to end (source, inspection, extraction) and reports a
//! [`JobOutcome`] back to the driver thread. A failing job never stops the
//! batch; the job log is the only state workers share.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::unbounded;
use rayon::ThreadPoolBuilder;
use tracing::{debug, error, info};

use crate::dumper::{DumperConfig, PayloadDumper};
use crate::error::{Error, Result};
use crate::inspect::{PartitionEntry, Strategy, inspect};
use crate::job::{ExtractionJob, PartitionRequest};
use crate::joblog::{ClaimStatus, JobLog};
use crate::layout::{ExtractionReport, OutputLayout};
use crate::record::DeviceRecord;
use crate::remote::SourceProvider;
use crate::unzip::extract_zip_partitions;
use crate::version::VersionSource;

/// Upper bound on concurrent jobs, to stay polite with firmware CDNs.
pub const MAX_WORKERS: usize = 64;
pub const DEFAULT_WORKERS: usize = 4;

/// Settings for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_root: PathBuf,
    pub partitions: PartitionRequest,
    pub version_source: VersionSource,
    pub workers: usize,
    pub dumper: DumperConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("."),
            partitions: PartitionRequest::default(),
            version_source: VersionSource::default(),
            workers: DEFAULT_WORKERS,
            dumper: DumperConfig::default(),
        }
    }
}

/// What happened to one job.
#[derive(Debug)]
pub enum JobStatus {
    Extracted(ExtractionReport),
    /// The URL is already in the job log.
    AlreadyProcessed,
    /// The same URL appears earlier in the input and is being processed right now.
    Duplicate,
    /// Cancellation was requested before the job started.
    Cancelled,
    Failed(Error),
}

#[derive(Debug)]
pub struct JobOutcome {
    /// Position of the record in the input.
    pub index: usize,
    pub job: ExtractionJob,
    pub status: JobStatus,
}

/// A job that failed, with enough context to find it again.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub index: usize,
    pub device: String,
    pub version: String,
    pub url: String,
    pub kind: &'static str,
    pub error: String,
}

/// Totals for a whole run.
#[derive(Debug, Default, Clone)]
pub struct Summary {
    pub extracted: usize,
    pub already_processed: usize,
    pub duplicates: usize,
    pub cancelled: usize,
    pub images_written: usize,
    pub images_existing: usize,
    pub partitions_missing: usize,
    pub failed: Vec<FailedJob>,
}

impl Summary {
    fn add(&mut self, outcome: &JobOutcome) {
        match &outcome.status {
            JobStatus::Extracted(report) => {
                self.extracted += 1;
                self.images_written += report.written.len();
                self.images_existing += report.existing.len();
                self.partitions_missing += report.missing.len();
            }
            JobStatus::AlreadyProcessed => self.already_processed += 1,
            JobStatus::Duplicate => self.duplicates += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Failed(e) => self.failed.push(FailedJob {
                index: outcome.index,
                device: outcome.job.record.device_name.clone(),
                version: outcome.job.resolved_version.clone(),
                url: outcome.job.record.source_url.clone(),
                kind: e.kind(),
                error: e.to_string(),
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.extracted + self.already_processed + self.duplicates + self.cancelled + self.failed.len()
    }
}

/// Result of looking inside a package without extracting anything.
#[derive(Debug, Clone)]
pub struct PackageListing {
    pub strategy: Strategy,
    /// Matching zip entries. Empty for payload packages, whose images live
    /// inside `payload.bin`.
    pub entries: Vec<PartitionEntry>,
    /// Requested partitions with no matching zip entry (zip packages only).
    pub missing: BTreeSet<String>,
}

/// Drives extraction jobs for a list of device records.
pub struct Pipeline {
    config: PipelineConfig,
    sources: Box<dyn SourceProvider>,
    log: JobLog,
    layout: OutputLayout,
    dumper: PayloadDumper,
    cancel: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, sources: Box<dyn SourceProvider>, log: JobLog) -> Self {
        let layout = OutputLayout::new(&config.output_root);
        let dumper = PayloadDumper::new(config.dumper.clone());
        Self {
            config,
            sources,
            log,
            layout,
            dumper,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn job_log(&self) -> &JobLog {
        &self.log
    }

    /// Flag that stops jobs from starting once set. In-flight jobs finish.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Resolve the version of every record and attach the partition request.
    pub fn plan(&self, records: Vec<DeviceRecord>) -> Vec<ExtractionJob> {
        records
            .into_iter()
            .map(|record| {
                let resolved_version = self.config.version_source.resolve(&record);
                debug!(device = %record.device_name, version = %resolved_version, "resolved version");
                ExtractionJob {
                    record,
                    resolved_version,
                    partitions: self.config.partitions.clone(),
                }
            })
            .collect()
    }

    fn workers(&self) -> usize {
        self.config.workers.clamp(1, MAX_WORKERS)
    }

    /// Run every record, calling `on_outcome` on the driver thread as jobs finish.
    pub fn run<F>(&self, records: Vec<DeviceRecord>, mut on_outcome: F) -> Result<Summary>
    where
        F: FnMut(&JobOutcome),
    {
        let jobs = self.plan(records);
        let workers = self.workers().min(jobs.len().max(1));
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("extract-{i}"))
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;

        let (job_sender, job_receiver) = unbounded::<(usize, ExtractionJob)>();
        for entry in jobs.into_iter().enumerate() {
            // The receiver is alive until the end of this function.
            let _ = job_sender.send(entry);
        }
        drop(job_sender);

        let (outcome_sender, outcome_receiver) = unbounded::<JobOutcome>();
        let mut summary = Summary::default();

        std::thread::scope(|threads| {
            let pool = &pool;
            let job_receiver = &job_receiver;
            threads.spawn(move || {
                pool.scope(|scope| {
                    for _ in 0..workers {
                        let outcomes = outcome_sender.clone();
                        scope.spawn(move |_| {
                            for (index, job) in job_receiver.iter() {
                                let status = self.run_job(&job);
                                let _ = outcomes.send(JobOutcome { index, job, status });
                            }
                        });
                    }
                });
                // `outcome_sender` drops here, ending the loop below.
            });

            for outcome in outcome_receiver.iter() {
                summary.add(&outcome);
                on_outcome(&outcome);
            }
        });

        summary.failed.sort_by_key(|f| f.index);
        Ok(summary)
    }

    /// Run a single job end to end. Errors are logged and returned as
    /// [`JobStatus::Failed`], never propagated.
    pub fn run_job(&self, job: &ExtractionJob) -> JobStatus {
        if self.cancel.load(Ordering::Acquire) {
            return JobStatus::Cancelled;
        }

        let claim = match self.log.try_claim(job.url()) {
            ClaimStatus::Processed => {
                info!(device = job.device(), url = job.url(), "skipping already processed link");
                return JobStatus::AlreadyProcessed;
            }
            ClaimStatus::InFlight => {
                info!(device = job.device(), url = job.url(), "skipping duplicate link");
                return JobStatus::Duplicate;
            }
            ClaimStatus::Claimed(claim) => claim,
        };

        info!(
            device = job.device(),
            version = %job.resolved_version,
            url = job.url(),
            "processing package"
        );
        let result = self.extract(job).and_then(|report| {
            claim.commit()?;
            Ok(report)
        });

        match result {
            Ok(report) => {
                debug!(url = job.url(), "recorded link as processed");
                JobStatus::Extracted(report)
            }
            Err(e) => {
                error!(
                    device = job.device(),
                    version = %job.resolved_version,
                    url = job.url(),
                    kind = e.kind(),
                    "job failed: {e}"
                );
                JobStatus::Failed(e)
            }
        }
    }

    fn extract(&self, job: &ExtractionJob) -> Result<ExtractionReport> {
        let source = self.sources.open(job.url())?;
        let mut package = inspect(source, job.url())?;

        match package.strategy() {
            Strategy::Zip => {
                let report = extract_zip_partitions(&mut package, job, &self.layout);
                package.into_inner().close();
                report
            }
            Strategy::Payload { .. } => {
                // The dumper opens its own connection.
                package.into_inner().close();
                self.dumper.extract(job, &self.layout)
            }
        }
    }

    /// Inspect a package without writing images or touching the job log.
    pub fn inspect_job(&self, job: &ExtractionJob) -> Result<PackageListing> {
        let source = self.sources.open(job.url())?;
        let package = inspect(source, job.url())?;
        let strategy = package.strategy();

        let (entries, missing) = match strategy {
            Strategy::Zip => {
                let entries = package.partition_entries(&job.partitions);
                let found: BTreeSet<&str> = entries.iter().map(|e| e.partition.as_str()).collect();
                let missing = job
                    .partitions
                    .names()
                    .filter(|p| !found.contains(p))
                    .map(str::to_string)
                    .collect();
                (entries, missing)
            }
            Strategy::Payload { .. } => (Vec::new(), BTreeSet::new()),
        };
        package.into_inner().close();

        Ok(PackageListing {
            strategy,
            entries,
            missing,
        })
    }
}
