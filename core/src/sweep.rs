//! End-to-end sweep driver
//!
//! Walks the grid one point at a time: build the invocation, fan it out,
//! then persist the result set or a failure marker before moving on.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::SweepConfig;
use crate::error::BenchResult;
use crate::grid::{Grid, GridPoint};
use crate::invocation::Invocation;
use crate::persistence::{point_parameters, ResultStore};
use crate::process::ProcessWorkload;
use crate::scheduler::{
    FanOutScheduler, InvocationFailure, PointOutcome, PointRun, SchedulerBuilder, ShutdownHandle,
};
use crate::traits::Workload;

/// How a grid point ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    /// Every process produced a record and the result file was written
    Succeeded,
    /// At least one process failed; no result file exists
    Failed,
    /// Every process succeeded but the result file could not be written
    Unpersisted,
}

/// Outcome of one grid point as reported in the manifest
#[derive(Debug, Clone, Serialize)]
pub struct PointSummary {
    /// Position in enumeration order
    pub index: usize,
    /// Human-readable point label
    pub label: String,
    /// Axis values and run constants
    pub parameters: serde_json::Value,
    /// Final status
    pub status: PointStatus,
    /// Result file or failure marker written for the point
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// Records collected
    pub records: usize,
    /// Per-process failures
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<InvocationFailure>,
    /// Why the output could not be written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
    /// Fan-out wall time
    pub elapsed_ms: u64,
    /// Highest number of processes observed running at once
    pub peak_running: usize,
}

impl PointSummary {
    /// Whether the point produced a result file
    pub fn is_success(&self) -> bool {
        self.status == PointStatus::Succeeded
    }
}

/// Outcome of a whole sweep
#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    /// When the first point started
    pub started_at: DateTime<Utc>,
    /// When the last point finished
    pub finished_at: DateTime<Utc>,
    /// Per-point outcomes in enumeration order
    pub points: Vec<PointSummary>,
}

impl SweepSummary {
    /// True only if every grid point succeeded
    pub fn is_success(&self) -> bool {
        self.points.iter().all(PointSummary::is_success)
    }

    /// Points that did not succeed
    pub fn failed(&self) -> impl Iterator<Item = &PointSummary> {
        self.points.iter().filter(|p| !p.is_success())
    }

    /// Total wall time
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// A grid point as `plan` shows it
#[derive(Debug, Clone)]
pub struct PlannedPoint {
    /// The point
    pub point: GridPoint,
    /// Command line that would run for it
    pub invocation: Invocation,
    /// Result file it would produce
    pub file_name: String,
}

/// Runs a configured sweep
pub struct Sweep {
    config: SweepConfig,
    grid: Grid,
    scheduler: FanOutScheduler,
    store: ResultStore,
    progress: Option<mpsc::UnboundedSender<PointSummary>>,
}

impl Sweep {
    /// Validate `config` and prepare a sweep that launches real processes
    pub fn new(config: SweepConfig) -> BenchResult<Self> {
        let workload = ProcessWorkload::new().with_timeout(config.timeout());
        Self::with_workload(config, Arc::new(workload))
    }

    /// Validate `config` and prepare a sweep running `workload`
    pub fn with_workload(config: SweepConfig, workload: Arc<dyn Workload>) -> BenchResult<Self> {
        let grid = config.grid()?;
        let scheduler = SchedulerBuilder::new()
            .max_parallel(config.max_parallel)
            .workload(workload)
            .build()?;
        let store = ResultStore::new(&config.output);

        Ok(Self {
            config,
            grid,
            scheduler,
            store,
            progress: None,
        })
    }

    /// Send each finished point's summary to `tx`
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<PointSummary>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Enumerated grid
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Output store
    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    /// Handle for cancelling the sweep from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.scheduler.shutdown_handle()
    }

    /// Every point with its command line and output file, launching nothing
    pub fn plan(&self) -> Vec<PlannedPoint> {
        self.grid
            .points()
            .map(|point| PlannedPoint {
                invocation: Invocation::build(&self.config.workload, &point),
                file_name: self.store.namer().file_name(&point),
                point,
            })
            .collect()
    }

    /// Run every grid point in order
    ///
    /// Failed points and unwritable outputs are reported in the summary.
    /// `Err` means the sweep stopped early: the workload could not be
    /// launched, or the sweep was cancelled.
    pub async fn run(&self) -> BenchResult<SweepSummary> {
        let started_at = Utc::now();
        tracing::info!(
            points = self.grid.len(),
            workload = %self.config.workload.program.display(),
            output_dir = %self.store.dir().display(),
            max_parallel = self.config.max_parallel,
            "Starting sweep"
        );

        let mut points = Vec::with_capacity(self.grid.len());
        for point in self.grid.points() {
            let invocation = Invocation::build(&self.config.workload, &point);
            tracing::debug!(point = %point, command = %invocation, "Built invocation");

            let run = self.scheduler.run_point(&point, &invocation).await?;
            let summary = self.finish_point(&point, run);

            if let Some(tx) = &self.progress {
                let _ = tx.send(summary.clone());
            }
            points.push(summary);
        }

        let summary = SweepSummary {
            started_at,
            finished_at: Utc::now(),
            points,
        };

        if self.config.output.manifest {
            match self.store.write_manifest(&self.manifest(&summary)) {
                Ok(path) => tracing::info!(path = %path.display(), "Wrote manifest"),
                Err(e) => tracing::warn!(error = %e, "Failed to write manifest"),
            }
        }

        tracing::info!(
            points = summary.points.len(),
            failed = summary.failed().count(),
            elapsed_secs = summary.duration().num_milliseconds() as f64 / 1000.0,
            "Sweep finished"
        );
        Ok(summary)
    }

    /// Run with SIGINT/SIGTERM handling
    ///
    /// The handlers are registered before the first process starts. A
    /// signal kills the in-flight processes and the sweep returns
    /// [`BenchError::Cancelled`](crate::BenchError::Cancelled).
    pub async fn run_with_signal_handling(&self) -> BenchResult<SweepSummary> {
        let mut signals = TerminationSignals::install()?;
        let handle = self.shutdown_handle();

        let signal_handle = tokio::spawn(async move {
            let signal = signals.recv().await;
            tracing::warn!(signal, "Received termination signal, stopping sweep");
            handle.shutdown();
        });

        let result = self.run().await;
        signal_handle.abort();

        result
    }

    fn finish_point(&self, point: &GridPoint, run: PointRun) -> PointSummary {
        let PointRun { outcome, stats } = run;
        let mut summary = PointSummary {
            index: point.index(),
            label: point.to_string(),
            parameters: point_parameters(point),
            status: PointStatus::Succeeded,
            file: None,
            records: 0,
            failures: Vec::new(),
            persistence_error: None,
            elapsed_ms: stats.elapsed().unwrap_or_default().as_millis() as u64,
            peak_running: stats.peak_running,
        };

        match outcome {
            PointOutcome::Complete(results) => {
                summary.records = results.len();
                match self.store.write_results(point, &results) {
                    Ok(path) => summary.file = Some(path),
                    Err(e) => {
                        tracing::warn!(point = %point, error = %e, "Failed to persist results");
                        summary.status = PointStatus::Unpersisted;
                        summary.persistence_error = Some(e.to_string());
                    }
                }
            }
            PointOutcome::Failed(failures) => {
                tracing::warn!(
                    point = %point,
                    failed = failures.len(),
                    first = %failures.first().map(ToString::to_string).unwrap_or_default(),
                    "Grid point failed, not writing results"
                );
                summary.status = PointStatus::Failed;
                summary.records = stats.succeeded;
                match self.store.write_failure(point, &failures) {
                    Ok(marker) => summary.file = marker,
                    Err(e) => {
                        tracing::warn!(point = %point, error = %e, "Failed to write failure marker");
                        summary.persistence_error = Some(e.to_string());
                    }
                }
                summary.failures = failures;
            }
        }

        summary
    }

    fn manifest(&self, summary: &SweepSummary) -> serde_json::Value {
        json!({
            "started_at": summary.started_at,
            "finished_at": summary.finished_at,
            "success": summary.is_success(),
            "config": self.config,
            "points": summary.points,
        })
    }
}

impl std::fmt::Debug for Sweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweep")
            .field("points", &self.grid.len())
            .field("scheduler", &self.scheduler)
            .field("output_dir", &self.store.dir())
            .finish()
    }
}

/// SIGINT/SIGTERM listeners, active from the moment they are installed
struct TerminationSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(windows)]
    ctrl_c: tokio::signal::windows::CtrlC,
}

impl TerminationSignals {
    #[cfg(unix)]
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(windows)]
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    /// Wait for the next signal and name it
    async fn recv(&mut self) -> &'static str {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
            }
        }

        #[cfg(windows)]
        {
            let _ = self.ctrl_c.recv().await;
            "Ctrl+C"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteSize;
    use crate::error::BenchError;
    use crate::traits::{LaunchError, ProcessOutput};
    use async_trait::async_trait;
    use std::path::Path;

    /// Succeeds with a small record unless `--size` matches `fail_size`
    struct EchoWorkload {
        fail_size: Option<&'static str>,
    }

    #[async_trait]
    impl Workload for EchoWorkload {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput, LaunchError> {
            let size = invocation.flag_value("--size").unwrap_or_default();
            if self.fail_size == Some(size) {
                return Ok(ProcessOutput::failure(3, "allocation failed\n"));
            }
            Ok(ProcessOutput::success(format!("{{\"size\": \"{}\"}}", size)))
        }
    }

    fn config(dir: &Path) -> SweepConfig {
        let sizes: Vec<ByteSize> = ["16K", "32K"].iter().map(|s| s.parse().unwrap()).collect();
        SweepConfig::new("bench", sizes, vec![1.0, 0.5])
            .with_fan_out(4)
            .with_max_parallel(2)
            .with_output_dir(dir)
    }

    fn sweep(config: SweepConfig, fail_size: Option<&'static str>) -> Sweep {
        Sweep::with_workload(config, Arc::new(EchoWorkload { fail_size })).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config(Path::new("unused"));
        config.axes.size.clear();
        let err = Sweep::with_workload(config, Arc::new(EchoWorkload { fail_size: None })).unwrap_err();
        assert!(matches!(err, BenchError::Config(_)));
    }

    #[test]
    fn test_plan_lists_every_point() {
        let sweep = sweep(config(Path::new("unused")), None);
        let plan = sweep.plan();

        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].invocation.flag_value("--size"), Some("16K"));
        assert_eq!(plan[1].invocation.flag_value("--dirty-fraction"), Some("0.5"));
        assert_eq!(
            plan[3].file_name,
            "size-32K_dirty-0.5_iter-1_par-2_fanout-4.json"
        );
    }

    #[tokio::test]
    async fn test_run_writes_one_file_per_point() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sweep = sweep(config(tmp.path()), None);

        let summary = sweep.run().await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.points.len(), 4);

        for planned in sweep.plan() {
            let bytes = std::fs::read(tmp.path().join(&planned.file_name)).unwrap();
            let records: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(records.as_array().unwrap().len(), 4);
        }

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["success"], true);
        assert_eq!(manifest["points"].as_array().unwrap().len(), 4);
        assert_eq!(manifest["points"][0]["status"], "succeeded");
    }

    #[tokio::test]
    async fn test_failed_point_does_not_stop_sweep() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sweep = sweep(config(tmp.path()), Some("32K"));

        let summary = sweep.run().await.unwrap();
        assert!(!summary.is_success());

        let failed: Vec<usize> = summary.failed().map(|p| p.index).collect();
        assert_eq!(failed, vec![2, 3]);

        for planned in sweep.plan() {
            let success = tmp.path().join(&planned.file_name);
            let marker = tmp
                .path()
                .join(sweep.store().namer().failure_marker_name(&planned.point));
            if planned.point.size().map(|s| s.label()) == Some("32K") {
                assert!(!success.exists());
                assert!(marker.exists());
            } else {
                assert!(success.exists());
                assert!(!marker.exists());
            }
        }

        let point = &summary.points[2];
        assert_eq!(point.status, PointStatus::Failed);
        assert_eq!(point.failures.len(), 4);
        assert!(point.failures[0].stderr_tail.contains("allocation failed"));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported_not_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let sweep = sweep(config(&blocker.join("results")), None);
        let summary = sweep.run().await.unwrap();

        assert_eq!(summary.points.len(), 4);
        assert!(summary
            .points
            .iter()
            .all(|p| p.status == PointStatus::Unpersisted && p.persistence_error.is_some()));
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_progress_reports_each_point() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sweep = sweep(config(tmp.path()), None).with_progress(tx);

        sweep.run().await.unwrap();
        drop(sweep);

        let mut seen = Vec::new();
        while let Some(summary) = rx.recv().await {
            seen.push(summary.index);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    /// Blocks until dropped, announcing each start
    struct StuckWorkload {
        started: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Workload for StuckWorkload {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn execute(&self, _invocation: &Invocation) -> Result<ProcessOutput, LaunchError> {
            self.started.notify_one();
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(ProcessOutput::success("{}"))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_cancels_running_sweep() {
        let tmp = tempfile::TempDir::new().unwrap();
        let started = Arc::new(tokio::sync::Notify::new());
        let workload = Arc::new(StuckWorkload {
            started: Arc::clone(&started),
        });
        let sweep = Arc::new(Sweep::with_workload(config(tmp.path()), workload).unwrap());

        let running = {
            let sweep = Arc::clone(&sweep);
            tokio::spawn(async move { sweep.run_with_signal_handling().await })
        };

        // the listeners exist before any workload starts
        started.notified().await;
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), running)
            .await
            .expect("sweep did not stop after SIGTERM")
            .unwrap();
        assert!(matches!(result, Err(BenchError::Cancelled { .. })));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_writes_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sweep = sweep(config(tmp.path()), None);

        sweep.shutdown_handle().shutdown();
        let err = sweep.run().await.unwrap_err();

        assert!(matches!(err, BenchError::Cancelled { .. }));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
