//! Workload execution seam
//!
//! The scheduler only ever talks to a [`Workload`]. The real implementation
//! ([`ProcessWorkload`](crate::ProcessWorkload)) spawns OS processes; tests
//! plug in mocks.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::invocation::Invocation;

// ============================================================================
// Workload Trait
// ============================================================================

/// Something that can run one invocation to completion
#[async_trait]
pub trait Workload: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &str;

    /// Run `invocation` once and collect its output
    ///
    /// Returns `Err` only when the invocation could not be started or its
    /// output could not be collected. A process that ran and failed is an
    /// `Ok` with a non-success [`ExitOutcome`].
    ///
    /// Dropping the returned future must stop the underlying process.
    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput, LaunchError>;
}

// ============================================================================
// Outputs
// ============================================================================

/// How a finished process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status 0
    Success,
    /// Non-zero exit status
    Code(i32),
    /// Terminated by a signal
    Signalled(Option<i32>),
    /// Killed after exceeding the configured timeout
    TimedOut,
}

impl ExitOutcome {
    /// Whether the process exited 0
    pub fn success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        if status.success() {
            return Self::Success;
        }
        match status.code() {
            Some(code) => Self::Code(code),
            None => Self::Signalled(signal_of(&status)),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Everything captured from one finished process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit outcome
    pub exit: ExitOutcome,

    /// Raw standard output
    pub stdout: Vec<u8>,

    /// Raw standard error
    pub stderr: Vec<u8>,

    /// Wall-clock time from spawn to exit
    pub elapsed: Duration,
}

impl ProcessOutput {
    /// Successful exit with the given stdout
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            exit: ExitOutcome::Success,
            stdout: stdout.into(),
            stderr: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Failed exit with the given code and stderr
    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit: ExitOutcome::Code(code),
            stdout: Vec::new(),
            stderr: stderr.into(),
            elapsed: Duration::ZERO,
        }
    }

    /// Process killed on timeout
    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            exit: ExitOutcome::TimedOut,
            stdout: Vec::new(),
            stderr: Vec::new(),
            elapsed,
        }
    }

    /// Set the elapsed time
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failure to run an invocation at all
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The executable could not be spawned (missing, not executable, ...)
    #[error("cannot start {program}: {source}")]
    Spawn {
        /// Executable path
        program: PathBuf,
        /// Spawn error
        #[source]
        source: std::io::Error,
    },

    /// The process started but its output could not be collected
    #[error("lost contact with workload process: {0}")]
    Wait(#[source] std::io::Error),
}
