//! Fan-out execution logic

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::config::{ConfigError, MAX_PROCESSES};
use crate::error::{BenchError, BenchResult};
use crate::grid::GridPoint;
use crate::invocation::Invocation;
use crate::traits::{LaunchError, ProcessOutput, Workload};

use super::aggregator::{FailureReason, InvocationFailure, PointOutcome, ResultAggregator};
use super::stats::PointStats;

/// Result of one scheduling pass over a grid point
#[derive(Debug, Clone)]
pub struct PointRun {
    /// Complete result set or the failures that invalidated it
    pub outcome: PointOutcome,

    /// Launch and timing statistics
    pub stats: PointStats,
}

/// Message sent by a finished launch slot
struct Completion {
    run: usize,
    result: Result<ProcessOutput, LaunchError>,
}

/// Cloneable handle that cancels the scheduler from another task
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Cancel the running grid point and refuse new ones
    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Whether shutdown was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Launches `fan_out` workload processes per grid point under a global ceiling
///
/// The semaphore is the only shared resource: a slot is acquired before each
/// launch and released when that process exits. `run_point` does not return
/// until every launched process has reported, so grid points never overlap.
pub struct FanOutScheduler {
    /// Concurrency ceiling
    pub(crate) max_parallel: usize,

    /// Workload runner (shared across launch slots)
    pub(crate) workload: Arc<dyn Workload>,

    /// Concurrency limiter
    pub(crate) semaphore: Arc<Semaphore>,

    /// Shutdown signal sender
    pub(crate) shutdown_tx: broadcast::Sender<()>,

    /// Sticky cancellation flag, survives between grid points
    pub(crate) cancelled: Arc<AtomicBool>,
}

impl FanOutScheduler {
    /// Create a new scheduler
    ///
    /// Use `SchedulerBuilder` for a more ergonomic construction.
    pub fn new(max_parallel: usize, workload: Arc<dyn Workload>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            max_parallel,
            workload,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            shutdown_tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Concurrency ceiling
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Handle for cancelling from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Cancel the running grid point and refuse new ones
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    /// Whether shutdown was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run every launch for `point` and collect the outcome
    ///
    /// Per-process failures end up in [`PointOutcome::Failed`]. `Err` means
    /// the whole sweep must stop: the workload could not be started, or the
    /// scheduler was cancelled. On cancellation all in-flight processes are
    /// killed and their partial results dropped.
    pub async fn run_point(
        &self,
        point: &GridPoint,
        invocation: &Invocation,
    ) -> BenchResult<PointRun> {
        let fan_out = point.fan_out();
        if fan_out > MAX_PROCESSES {
            return Err(ConfigError::InvalidConstant(format!(
                "fan_out must be between 1 and {}",
                MAX_PROCESSES
            ))
            .into());
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_cancelled() {
            return Err(cancelled_at(point));
        }

        let mut stats = PointStats::new(fan_out);
        stats.start();

        tracing::info!(
            point = %point,
            fan_out,
            max_parallel = self.max_parallel,
            "Starting grid point"
        );

        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(fan_out.max(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let launch_failed = Arc::new(AtomicBool::new(false));
        let invocation = Arc::new(invocation.clone());
        let mut tasks = JoinSet::new();

        for run in 0..fan_out {
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.map_err(|_| BenchError::scheduler("concurrency semaphore closed"))?
                }
                _ = shutdown_rx.recv() => {
                    tasks.shutdown().await;
                    return Err(cancelled_at(point));
                }
            };

            if launch_failed.load(Ordering::SeqCst) {
                tracing::debug!(run, "Not launching further processes after a launch failure");
                break;
            }

            let workload = Arc::clone(&self.workload);
            let invocation = Arc::clone(&invocation);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let launch_failed = Arc::clone(&launch_failed);
            let done_tx = done_tx.clone();

            stats.launched += 1;
            tasks.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let result = workload.execute(&invocation).await;

                running.fetch_sub(1, Ordering::SeqCst);
                if matches!(result, Err(LaunchError::Spawn { .. })) {
                    launch_failed.store(true, Ordering::SeqCst);
                }
                drop(permit);

                // the receiver is only gone if the point was abandoned
                let _ = done_tx.send(Completion { run, result }).await;
            });
        }
        drop(done_tx);

        let mut aggregator = ResultAggregator::new(fan_out);
        let mut launch_error = None;

        loop {
            let completion = tokio::select! {
                completion = done_rx.recv() => completion,
                _ = shutdown_rx.recv() => {
                    tasks.shutdown().await;
                    return Err(cancelled_at(point));
                }
            };
            let Some(Completion { run, result }) = completion else {
                break;
            };

            match result {
                Ok(output) => {
                    let elapsed_ms = output.elapsed.as_millis() as u64;
                    match aggregator.record_output(run, &output) {
                        Some(failure) => tracing::warn!(
                            point = %point,
                            run,
                            reason = %failure.reason,
                            stderr = %failure.stderr_tail,
                            "Workload invocation failed"
                        ),
                        None => tracing::debug!(run, elapsed_ms, "Workload process completed"),
                    }
                }
                Err(LaunchError::Spawn { program, source }) => {
                    tracing::error!(
                        program = %program.display(),
                        error = %source,
                        "Failed to launch workload"
                    );
                    if launch_error.is_none() {
                        launch_error = Some(BenchError::Launch { program, source });
                    }
                }
                Err(LaunchError::Wait(e)) => {
                    tracing::warn!(point = %point, run, error = %e, "Lost workload output");
                    aggregator.record_failure(InvocationFailure::new(
                        run,
                        FailureReason::Lost {
                            detail: e.to_string(),
                        },
                    ));
                }
            }
        }

        // a panicked slot never reported; the aggregator counts it missing
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(point = %point, error = %e, "Workload task panicked");
            }
        }

        stats.stop();
        stats.peak_running = peak.load(Ordering::SeqCst);
        stats.succeeded = aggregator.succeeded();
        stats.failed = aggregator.failed();

        if let Some(err) = launch_error {
            return Err(err);
        }

        let outcome = aggregator.finish();
        tracing::info!(
            point = %point,
            succeeded = stats.succeeded,
            failed = stats.failed,
            peak_running = stats.peak_running,
            elapsed_secs = stats.elapsed().unwrap_or_default().as_secs_f64(),
            "Grid point finished"
        );

        Ok(PointRun { outcome, stats })
    }
}

fn cancelled_at(point: &GridPoint) -> BenchError {
    tracing::warn!(point = %point, "Grid point cancelled, discarding partial results");
    BenchError::Cancelled {
        point: point.to_string(),
    }
}

impl std::fmt::Debug for FanOutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutScheduler")
            .field("max_parallel", &self.max_parallel)
            .field("workload", &self.workload.name())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
