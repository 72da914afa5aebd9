//! CLI argument parsing and command handling

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sweep_bench_core::{BenchError, ByteSize, PointSummary, Sweep, SweepConfig, SweepSummary};
use tokio::sync::mpsc;

/// Exit code after SIGINT/SIGTERM
const EXIT_CANCELLED: u8 = 130;

/// Parameter-sweep harness for external benchmark workloads
#[derive(Parser, Debug)]
#[command(name = "sweep-bench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sweep and write one result file per grid point
    Run(SweepArgs),
    /// Print every grid point, its command line and output file without running anything
    Plan(SweepArgs),
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Sweep definition; flags override values from `--config`
#[derive(Args, Debug, Default, Clone)]
pub struct SweepArgs {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Workload executable
    #[arg(short, long, env = "SWEEP_BENCH_WORKLOAD")]
    pub workload: Option<PathBuf>,

    /// Allocation sizes, e.g. 16K,32K,1M
    #[arg(long, value_delimiter = ',')]
    pub sizes: Vec<ByteSize>,

    /// Dirty page fractions, e.g. 1,0.5,0.05
    #[arg(long, value_delimiter = ',')]
    pub dirty: Vec<f64>,

    /// Resident set fractions
    #[arg(long, value_delimiter = ',')]
    pub resident: Vec<f64>,

    /// Workload thread counts
    #[arg(long, value_delimiter = ',')]
    pub threads: Vec<usize>,

    /// Process group sizes passed to the workload
    #[arg(long, value_delimiter = ',')]
    pub processes: Vec<usize>,

    /// Iterations each workload process runs
    #[arg(short, long)]
    pub iterations: Option<u64>,

    /// Maximum number of workload processes running at once
    #[arg(short = 'j', long, visible_aliases = ["parallel", "jobs"])]
    pub max_parallel: Option<usize>,

    /// Processes launched per grid point (defaults to the --processes value)
    #[arg(long)]
    pub fan_out: Option<usize>,

    /// Directory for result files
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Prefix for every output file name
    #[arg(long)]
    pub prefix: Option<String>,

    /// Kill workload processes running longer than this
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Do not write .failed.json markers for failed grid points
    #[arg(long)]
    pub no_failure_markers: bool,

    /// Extra argument passed through to the workload (repeatable)
    #[arg(long = "extra-arg", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,
}

impl SweepArgs {
    /// Build the sweep configuration from the config file and flags
    pub fn into_config(self) -> Result<SweepConfig> {
        let mut config = match &self.config {
            Some(path) => SweepConfig::from_file(path)
                .with_context(|| format!("Failed to load config from: {}", path.display()))?,
            None => {
                let program = self
                    .workload
                    .clone()
                    .context("--workload is required when no --config is given")?;
                SweepConfig::new(program, Vec::new(), Vec::new())
            }
        };

        if let Some(program) = self.workload {
            config.workload.program = program;
        }
        config.workload.extra_args.extend(self.extra_args);

        if !self.sizes.is_empty() {
            config.axes.size = self.sizes;
        }
        if !self.dirty.is_empty() {
            config.axes.dirty_fraction = self.dirty;
        }
        if !self.resident.is_empty() {
            config.axes.resident_fraction = Some(self.resident);
        }
        if !self.threads.is_empty() {
            config.axes.threads = Some(self.threads);
        }
        if !self.processes.is_empty() {
            config.axes.processes = Some(self.processes);
        }

        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(max_parallel) = self.max_parallel {
            config.max_parallel = max_parallel;
        }
        if self.fan_out.is_some() {
            config.fan_out = self.fan_out;
        }
        if self.timeout_secs.is_some() {
            config.timeout_secs = self.timeout_secs;
        }
        if let Some(dir) = self.output_dir {
            config.output.dir = dir;
        }
        if let Some(prefix) = self.prefix {
            config.output.prefix = prefix;
        }
        if self.no_failure_markers {
            config.output.failure_markers = false;
        }

        Ok(config)
    }
}

impl Cli {
    /// Dispatch the selected command
    pub async fn run(self) -> Result<ExitCode> {
        match self.command {
            Commands::Run(args) => run_sweep(args).await,
            Commands::Plan(args) => plan(args),
            Commands::Validate { config } => validate(&config),
        }
    }
}

async fn run_sweep(args: SweepArgs) -> Result<ExitCode> {
    let config = args.into_config()?;
    let (tx, rx) = mpsc::unbounded_channel();
    let sweep = Sweep::new(config)
        .context("Invalid sweep configuration")?
        .with_progress(tx);

    println!("\n{}", "=".repeat(70));
    println!("   sweep-bench");
    println!("{}", "=".repeat(70));
    println!("  Workload:     {}", sweep.config().workload.program.display());
    println!("  Grid points:  {}", sweep.grid().len());
    println!("  Iterations:   {}", sweep.config().iterations);
    println!("  Max parallel: {}", sweep.config().max_parallel);
    println!("  Output:       {}", sweep.store().dir().display());
    println!("{}", "=".repeat(70));
    println!();

    let pb = ProgressBar::new(sweep.grid().len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );
    let progress = tokio::spawn(track_progress(rx, pb.clone()));

    let result = sweep.run_with_signal_handling().await;
    drop(sweep);
    // the sender lives in the sweep, so the tracker ends once it is dropped
    let _ = progress.await;
    pb.finish_and_clear();

    match result {
        Ok(summary) => Ok(report(&summary)),
        Err(BenchError::Cancelled { point }) => {
            eprintln!("Sweep cancelled while running {}; partial results discarded", point);
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(e) => Err(e).context("Sweep aborted"),
    }
}

async fn track_progress(mut rx: mpsc::UnboundedReceiver<PointSummary>, pb: ProgressBar) {
    while let Some(point) = rx.recv().await {
        if !point.is_success() {
            pb.println(format!("FAILED {}", point.label));
        }
        pb.set_message(point.label);
        pb.inc(1);
    }
}

/// Print the summary and pick the exit code
fn report(summary: &SweepSummary) -> ExitCode {
    let failed: Vec<&PointSummary> = summary.failed().collect();

    println!("{}", "=".repeat(70));
    println!(
        "Sweep finished: {} points, {} succeeded, {} failed in {:.1}s",
        summary.points.len(),
        summary.points.len() - failed.len(),
        failed.len(),
        summary.duration().num_milliseconds() as f64 / 1000.0
    );

    if failed.is_empty() {
        println!("{}", "=".repeat(70));
        return ExitCode::SUCCESS;
    }

    println!();
    println!("Failed grid points:");
    for point in &failed {
        println!("  {}", point.label);
        for failure in &point.failures {
            println!("    {}", failure);
        }
        if let Some(err) = &point.persistence_error {
            println!("    could not write output: {}", err);
        }
    }
    println!("{}", "=".repeat(70));

    ExitCode::FAILURE
}

fn plan(args: SweepArgs) -> Result<ExitCode> {
    let config = args.into_config()?;
    let sweep = Sweep::new(config).context("Invalid sweep configuration")?;

    for planned in sweep.plan() {
        println!("{}", planned.point);
        println!("  command: {}", planned.invocation);
        println!("  output:  {}", sweep.store().dir().join(&planned.file_name).display());
    }
    tracing::info!(points = sweep.grid().len(), "Plan complete, nothing launched");

    Ok(ExitCode::SUCCESS)
}

fn validate(path: &std::path::Path) -> Result<ExitCode> {
    let config = SweepConfig::from_file(path)
        .with_context(|| format!("Failed to load config from: {}", path.display()))?;
    let grid = config
        .grid()
        .with_context(|| format!("Invalid configuration in: {}", path.display()))?;

    println!("Configuration OK: {} grid points", grid.len());
    Ok(ExitCode::SUCCESS)
}
