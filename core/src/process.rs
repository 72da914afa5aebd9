//! Workload backed by real OS processes

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::invocation::Invocation;
use crate::traits::{ExitOutcome, LaunchError, ProcessOutput, Workload};

/// Runs each invocation as a separate child process
///
/// Each instance gets its own address space, which is what the workload's
/// memory measurements depend on.
#[derive(Debug, Clone, Default)]
pub struct ProcessWorkload {
    timeout: Option<Duration>,
}

impl ProcessWorkload {
    /// Workload without a timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill processes that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Workload for ProcessWorkload {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput, LaunchError> {
        let start = Instant::now();
        let child = invocation
            .to_command()
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: invocation.program().clone(),
                source,
            })?;

        tracing::trace!(pid = ?child.id(), "Workload process started");

        // the child moves into the wait future; dropping it (timeout or
        // cancellation) kills the process via kill_on_drop
        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(waited) => waited,
                Err(_) => return Ok(ProcessOutput::timed_out(start.elapsed())),
            },
            None => child.wait_with_output().await,
        };
        let output = waited.map_err(LaunchError::Wait)?;

        Ok(ProcessOutput {
            exit: ExitOutcome::from(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::grid::{Axis, AxisKind, AxisValue, FanOut, Grid, RunConstants};
    use crate::invocation::WorkloadSpec;
    use crate::test_utils::write_script;

    fn invocation_for(program: &std::path::Path) -> Invocation {
        let grid = Grid::new(
            vec![Axis::new(
                AxisKind::Size,
                vec![AxisValue::Size("16K".parse().unwrap())],
            )],
            RunConstants {
                iterations: 3,
                max_parallel: 1,
                fan_out: FanOut::Fixed(1),
            },
        )
        .unwrap();
        let point = grid.points().next().unwrap();
        Invocation::build(&WorkloadSpec::new(program), &point)
    }

    #[tokio::test]
    async fn test_execute_captures_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "echo.sh", r#"echo "{\"args\": \"$*\"}""#);

        let output = ProcessWorkload::new()
            .execute(&invocation_for(&script))
            .await
            .unwrap();

        assert!(output.exit.success());
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(value["args"], "--size 16K --iterations 3 --json");
    }

    #[tokio::test]
    async fn test_execute_reports_exit_code_and_stderr() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "fail.sh", "echo 'mmap failed' >&2\nexit 3");

        let output = ProcessWorkload::new()
            .execute(&invocation_for(&script))
            .await
            .unwrap();

        assert_eq!(output.exit, ExitOutcome::Code(3));
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "mmap failed");
    }

    #[tokio::test]
    async fn test_execute_missing_binary() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = ProcessWorkload::new()
            .execute(&invocation_for(&dir.path().join("does-not-exist")))
            .await;

        assert!(matches!(result, Err(LaunchError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_execute_timeout_kills_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = write_script(dir.path(), "slow.sh", "sleep 5\necho '{}'");

        let start = Instant::now();
        let output = ProcessWorkload::new()
            .with_timeout(Some(Duration::from_millis(200)))
            .execute(&invocation_for(&script))
            .await
            .unwrap();

        assert_eq!(output.exit, ExitOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
