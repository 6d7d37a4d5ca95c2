use crate::dumper::{DEFAULT_DUMPER, DumperConfig};
use crate::inspect::Strategy;
use crate::job::PartitionRequest;
use crate::joblog::JobLog;
use crate::pipeline::{
    DEFAULT_WORKERS, JobStatus, MAX_WORKERS, Pipeline, PipelineConfig, Summary,
};
use crate::record::{DeviceRecord, load_device_list};
use crate::remote::{HttpOptions, HttpProvider};
use crate::version::VersionSource;
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueHint};
use console::Style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PROGRESS_UPDATE_FREQUENCY: u8 = 2; // Hz for progress redraws

#[derive(Debug, Parser)]
#[clap(
    about,
    author,
    disable_help_subcommand = true,
    help_template = FRIENDLY_HELP,
    propagate_version = true,
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cmd {
    /// Device list, one `设备: <name>, 版本: <version>, 链接: <url>` per line.
    #[clap(short = 'i', long = "input", value_hint = ValueHint::FilePath, value_name = "PATH")]
    input: Option<PathBuf>,

    /// Inspect packages and list matching partitions instead of extracting them
    #[clap(long, short, conflicts_with = "threads", conflicts_with = "dumper")]
    list: bool,

    /// Number of packages processed concurrently
    #[clap(long, short, value_name = "NUMBER")]
    threads: Option<usize>,

    /// Root of the `<device>/<partition>/` output tree (defaults to the current directory)
    #[clap(long, short, value_hint = ValueHint::DirPath, value_name = "PATH")]
    output_dir: Option<PathBuf>,

    /// File recording links that were already processed
    #[clap(long, value_hint = ValueHint::FilePath, value_name = "PATH", default_value = "processed_urls.txt")]
    job_log: PathBuf,

    /// Partitions to extract (comma-separated)
    #[clap(long, value_name = "PARTITIONS", default_value = "boot,init_boot")]
    partitions: PartitionRequest,

    /// Where version labels come from
    #[clap(long, value_enum, default_value_t = VersionSource::Label)]
    version_source: VersionSource,

    /// Payload dumping tool used for packages that carry payload.bin
    #[clap(long, value_hint = ValueHint::CommandName, value_name = "PROGRAM", default_value = DEFAULT_DUMPER)]
    dumper: OsString,

    /// Extra argument passed to the dumping tool (repeatable)
    #[clap(long = "dumper-arg", value_name = "ARG", allow_hyphen_values = true)]
    dumper_args: Vec<OsString>,

    /// Seconds to wait for a connection to the package server
    #[clap(long, value_name = "SECONDS", default_value_t = 30)]
    connect_timeout: u64,

    /// Seconds a stalled transfer may go without receiving data before the job fails
    #[clap(long, value_name = "SECONDS", default_value_t = 60)]
    read_timeout: u64,

    /// Show debug diagnostics (RUST_LOG takes precedence)
    #[clap(long, short)]
    verbose: bool,

    /// Positional argument for the device list
    #[clap(value_hint = ValueHint::FilePath)]
    #[clap(index = 1, value_name = "PATH")]
    positional_input: Option<PathBuf>,
}

impl Cmd {
    pub fn run(&self) -> Result<()> {
        self.init_logging();

        if let Some(t) = self.threads {
            match t {
                0 => { /* Use default - valid */ }
                1..=MAX_WORKERS => { /* Valid range */ }
                _ => {
                    bail!(
                        "Thread count must be between 1 and {}, got {}. \
                        Use 0 or omit -t to use the default of {}.",
                        MAX_WORKERS,
                        t,
                        DEFAULT_WORKERS
                    );
                }
            }
        }

        let input = self.input.as_ref().or(self.positional_input.as_ref())
            .ok_or_else(|| anyhow::anyhow!(
                "No device list specified. Please provide one using -i/--input or as a positional argument.\n\nExamples:\n  bootripper devices.txt\n  bootripper -i devices.txt -o images\n  bootripper devices.txt --partitions boot,init_boot,vendor_boot"
            ))?
            .clone();

        let records = load_device_list(&input)
            .with_context(|| format!("unable to load device list: {}", input.display()))?;

        let config = PipelineConfig {
            output_root: self.output_root()?,
            partitions: self.partitions.clone(),
            version_source: self.version_source,
            workers: self.threads.filter(|t| *t > 0).unwrap_or(DEFAULT_WORKERS),
            dumper: DumperConfig {
                program: self.dumper.clone(),
                extra_args: self.dumper_args.clone(),
            },
        };

        let log = JobLog::open(&self.job_log).context("unable to open job log")?;
        let sources = HttpProvider::new(HttpOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
            ..HttpOptions::default()
        })?;
        let pipeline = Pipeline::new(config, Box::new(sources), log);

        if self.list {
            return self.list_packages(&pipeline, records);
        }

        let cancel = pipeline.cancellation_token();
        ctrlc::set_handler(move || {
            if cancel.swap(true, Ordering::AcqRel) {
                eprintln!("\nSecond interrupt received, exiting immediately.");
                std::process::exit(130); // Standard exit code for Ctrl+C (128 + SIGINT)
            }
            eprintln!(
                "\n\n Received interrupt signal (Ctrl+C). Finishing running jobs, no new ones will start..."
            );
        })
        .context("Failed to set up Ctrl+C handler")?;

        let bold_yellow = Style::new().bold().yellow();
        eprintln!(
            "{}: {} record(s), {} already in {}",
            bold_yellow.apply_to("Extraction starting"),
            records.len(),
            pipeline.job_log().len(),
            self.job_log.display()
        );

        let progress_bar = self.create_progress_bar(records.len() as u64)?;
        let summary = pipeline.run(records, |outcome| {
            progress_bar.set_message(outcome.job.record.device_name.clone());
            if let JobStatus::Failed(e) = &outcome.status {
                progress_bar.println(format!(
                    "{} {} ({}): {e}",
                    Style::new().bold().red().apply_to("failed"),
                    outcome.job.record.device_name,
                    outcome.job.resolved_version
                ));
            }
            progress_bar.inc(1);
        })?;
        progress_bar.finish_and_clear();

        self.print_summary(&summary);
        Ok(())
    }

    fn init_logging(&self) {
        let default_level = if self.verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("bootripper={default_level},warn")));
        // A subscriber may already be installed when embedded; keep it.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }

    fn output_root(&self) -> Result<PathBuf> {
        match &self.output_dir {
            Some(dir) => Ok(dir.clone()),
            None => env::current_dir().with_context(|| {
                "Failed to determine current directory. Please specify --output-dir explicitly."
            }),
        }
    }

    fn create_progress_bar(&self, len: u64) -> Result<ProgressBar> {
        let style = ProgressStyle::with_template(
            "{prefix:>12!.green.bold} [{wide_bar:.white.dim}] {pos}/{len} {msg}",
        )
        .context("unable to build progress bar template")?
        .progress_chars("=> ");
        let draw_target = ProgressDrawTarget::stderr_with_hz(PROGRESS_UPDATE_FREQUENCY);
        let bar = ProgressBar::with_draw_target(Some(len), draw_target)
            .with_finish(ProgressFinish::AndClear)
            .with_prefix("packages")
            .with_style(style);
        Ok(bar)
    }

    fn list_packages(&self, pipeline: &Pipeline, records: Vec<DeviceRecord>) -> Result<()> {
        let bold_green = Style::new().bold().green();
        let dim = Style::new().dim();
        let red = Style::new().red();

        for job in pipeline.plan(records) {
            if pipeline.job_log().contains(job.url()) {
                println!("{} {}", dim.apply_to("processed"), job.url());
                continue;
            }
            println!(
                "{} ({}) {}",
                bold_green.apply_to(&job.record.device_name),
                job.resolved_version,
                dim.apply_to(job.url())
            );
            match pipeline.inspect_job(&job) {
                Ok(listing) => {
                    match listing.strategy {
                        Strategy::Payload { header: Some(h) } => {
                            let data = h
                                .data_offset()
                                .map_or_else(|| "invalid".to_string(), |off| off.to_string());
                            println!(
                                "  payload.bin (format v{}, manifest {}, data at {}), dumper will extract: {}",
                                h.file_format_version,
                                indicatif::HumanBytes(h.manifest_size),
                                data,
                                job.partitions
                            )
                        }
                        Strategy::Payload { header: None } => {
                            println!("  payload.bin, dumper will extract: {}", job.partitions)
                        }
                        Strategy::Zip => {
                            for entry in &listing.entries {
                                println!("  {} <- {}", entry.partition, entry.name);
                            }
                        }
                    }
                    for partition in &listing.missing {
                        println!("  {} {partition}", red.apply_to("missing"));
                    }
                }
                Err(e) => println!("  {} {e}", red.apply_to("error")),
            }
        }
        Ok(())
    }

    fn print_summary(&self, summary: &Summary) {
        let bold = Style::new().bold();
        let green = Style::new().bold().green();
        let yellow = Style::new().bold().yellow();
        let red = Style::new().bold().red();

        println!("\n{}", bold.apply_to("Run summary"));
        println!("  {:<18}{}", "extracted", green.apply_to(summary.extracted));
        println!("  {:<18}{}", "already processed", summary.already_processed);
        if summary.duplicates > 0 {
            println!("  {:<18}{}", "duplicates", summary.duplicates);
        }
        if summary.cancelled > 0 {
            println!("  {:<18}{}", "cancelled", yellow.apply_to(summary.cancelled));
        }
        println!("  {:<18}{}", "images written", summary.images_written);
        if summary.images_existing > 0 {
            println!("  {:<18}{}", "images kept", summary.images_existing);
        }
        if summary.partitions_missing > 0 {
            println!("  {:<18}{}", "partitions missing", yellow.apply_to(summary.partitions_missing));
        }
        println!("  {:<18}{}", "failed", red.apply_to(summary.failed.len()));
        for failed in &summary.failed {
            println!(
                "    [{}] {} ({}) {}: {}",
                failed.kind, failed.device, failed.version, failed.url, failed.error
            );
        }
    }
}

// Friendlier, task-oriented help template shown for -h/--help
const FRIENDLY_HELP: &str = color_print::cstr!(
    "\
{before-help}<bold><underline>{name} {version}</underline></bold>
{about}

Quick start:
  - Point it at a device list produced by the catalog collector:
    bootripper devices.txt

Common tasks:
  - See which strategy each package needs, without extracting:
    bootripper -l devices.txt
  - Extract specific partition(s):
    bootripper devices.txt --partitions boot,init_boot,vendor_boot
  - Choose output directory and concurrency:
    bootripper devices.txt -o images -t 8
  - Derive versions from download links instead of the list:
    bootripper devices.txt --version-source url

Resuming:
  - Every finished link is appended to the job log (--job-log).
  - Re-running with the same list skips those links; failed ones are retried.

Payload packages:
  - Packages containing payload.bin are handed to --dumper, which is run as
    <<dumper> [--dumper-arg ...] --partitions <<list> <<url>
    and must write <<partition>.img files into ./output.

{usage-heading}
{usage}

Options:
{all-args}
{after-help}"
);
