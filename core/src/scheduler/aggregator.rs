//! Collecting per-process outputs into a result set

use std::fmt;

use serde::Serialize;
use serde_json::value::RawValue;

use crate::traits::{ExitOutcome, ProcessOutput};

/// Maximum stderr kept per failure
const STDERR_TAIL_BYTES: usize = 2048;

/// One process's measurement, kept byte-for-byte as the workload printed it
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct RunRecord(Box<RawValue>);

impl RunRecord {
    /// Parse stdout as exactly one JSON value
    ///
    /// Leading and trailing whitespace is allowed; empty output, trailing
    /// data or a second value are rejected.
    pub fn parse(stdout: &[u8]) -> Result<Self, FailureReason> {
        let text = std::str::from_utf8(stdout).map_err(|e| FailureReason::InvalidOutput {
            detail: format!("stdout is not UTF-8: {}", e),
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(FailureReason::InvalidOutput {
                detail: "no output on stdout".into(),
            });
        }
        serde_json::from_str::<Box<RawValue>>(trimmed)
            .map(Self)
            .map_err(|e| FailureReason::InvalidOutput {
                detail: e.to_string(),
            })
    }

    /// Record text exactly as emitted
    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    /// Decode into a JSON value
    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(self.0.get())
    }
}

/// Why one invocation did not produce a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Exited with a non-zero status
    NonZeroExit {
        /// Exit code
        code: i32,
    },
    /// Terminated by a signal
    Signalled {
        /// Signal number, when known
        signal: Option<i32>,
    },
    /// Killed after exceeding the timeout
    TimedOut {
        /// Time until the kill, in milliseconds
        after_ms: u64,
    },
    /// Stdout was not exactly one JSON value
    InvalidOutput {
        /// Parser message
        detail: String,
    },
    /// Output could not be collected
    Lost {
        /// IO error message
        detail: String,
    },
    /// No outcome reported at all
    Missing,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit { code } => write!(f, "exited with status {}", code),
            Self::Signalled { signal: Some(sig) } => write!(f, "killed by signal {}", sig),
            Self::Signalled { signal: None } => f.write_str("killed by a signal"),
            Self::TimedOut { after_ms } => write!(f, "timed out after {} ms", after_ms),
            Self::InvalidOutput { detail } => write!(f, "invalid output: {}", detail),
            Self::Lost { detail } => write!(f, "output lost: {}", detail),
            Self::Missing => f.write_str("no outcome reported"),
        }
    }
}

/// A failed invocation within a grid point
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationFailure {
    /// Launch slot within the point (0-based)
    pub run: usize,

    /// What went wrong
    pub reason: FailureReason,

    /// Last bytes of the process's stderr
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
}

impl InvocationFailure {
    /// Failure without stderr
    pub fn new(run: usize, reason: FailureReason) -> Self {
        Self {
            run,
            reason,
            stderr_tail: String::new(),
        }
    }

    /// Attach the tail of `stderr`
    pub fn with_stderr(mut self, stderr: &[u8]) -> Self {
        let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        self.stderr_tail = String::from_utf8_lossy(&stderr[start..]).trim().to_string();
        self
    }
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {} {}", self.run, self.reason)?;
        if let Some(last) = self.stderr_tail.lines().last() {
            write!(f, " ({})", last)?;
        }
        Ok(())
    }
}

/// All records of one grid point, in completion order
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ResultSet {
    records: Vec<RunRecord>,
}

impl ResultSet {
    /// Records in completion order
    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize as a UTF-8 JSON array
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(&self.records)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Final state of one grid point's fan-out
#[derive(Debug, Clone)]
pub enum PointOutcome {
    /// Every expected process produced a record
    Complete(ResultSet),
    /// At least one process failed; the partial set is discarded
    Failed(Vec<InvocationFailure>),
}

impl PointOutcome {
    /// Whether the point succeeded
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Collects outcomes for one grid point
///
/// Purely a collector: records are kept in the order they arrive, never
/// reordered, deduplicated or post-processed.
#[derive(Debug)]
pub struct ResultAggregator {
    expected: usize,
    seen: Vec<bool>,
    records: Vec<RunRecord>,
    failures: Vec<InvocationFailure>,
}

impl ResultAggregator {
    /// Aggregator expecting `expected` outcomes
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            seen: vec![false; expected],
            records: Vec::with_capacity(expected),
            failures: Vec::new(),
        }
    }

    /// Record the output of launch slot `run`
    ///
    /// Returns the failure if this output does not yield a record.
    pub fn record_output(&mut self, run: usize, output: &ProcessOutput) -> Option<&InvocationFailure> {
        self.mark_seen(run);

        let reason = match output.exit {
            ExitOutcome::Success => match RunRecord::parse(&output.stdout) {
                Ok(record) => {
                    self.records.push(record);
                    return None;
                }
                Err(reason) => reason,
            },
            ExitOutcome::Code(code) => FailureReason::NonZeroExit { code },
            ExitOutcome::Signalled(signal) => FailureReason::Signalled { signal },
            ExitOutcome::TimedOut => FailureReason::TimedOut {
                after_ms: output.elapsed.as_millis() as u64,
            },
        };

        self.failures
            .push(InvocationFailure::new(run, reason).with_stderr(&output.stderr));
        self.failures.last()
    }

    /// Record a failure that happened outside the process
    pub fn record_failure(&mut self, failure: InvocationFailure) {
        self.mark_seen(failure.run);
        self.failures.push(failure);
    }

    /// Number of outcomes received so far
    pub fn received(&self) -> usize {
        self.records.len() + self.failures.len()
    }

    /// Number of records collected so far
    pub fn succeeded(&self) -> usize {
        self.records.len()
    }

    /// Number of failures collected so far
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Finish the point
    ///
    /// Launch slots that never reported count as failures, so a complete
    /// set always holds exactly `expected` records.
    pub fn finish(mut self) -> PointOutcome {
        let missing: Vec<usize> = self
            .seen
            .iter()
            .enumerate()
            .filter(|(_, seen)| !**seen)
            .map(|(run, _)| run)
            .collect();
        for run in missing {
            self.failures
                .push(InvocationFailure::new(run, FailureReason::Missing));
        }

        if self.failures.is_empty() && self.records.len() == self.expected {
            PointOutcome::Complete(ResultSet {
                records: self.records,
            })
        } else {
            self.failures.sort_by_key(|f| f.run);
            PointOutcome::Failed(self.failures)
        }
    }

    fn mark_seen(&mut self, run: usize) {
        if let Some(seen) = self.seen.get_mut(run) {
            *seen = true;
        }
    }
}
