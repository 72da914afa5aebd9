//! Sweep configuration types

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BenchResult;
use crate::grid::{Axis, AxisKind, AxisValue, FanOut, Grid, RunConstants};
use crate::invocation::WorkloadSpec;

/// Largest concurrency ceiling, fan-out or process count accepted
///
/// Every launch slot is a semaphore permit, so these values are bounded by
/// what a tokio semaphore can hold.
pub const MAX_PROCESSES: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Allocation size as understood by the workload (`16K`, `512M`, `1G`)
///
/// Keeps the normalized label next to the byte count: the label is what
/// gets passed on the command line and encoded into file names. Equality
/// is by byte count, so `1024K` and `1M` are the same size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteSize {
    bytes: u64,
    label: String,
}

impl ByteSize {
    /// Size in bytes
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Normalized label, e.g. `16K`
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl PartialEq for ByteSize {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for ByteSize {}

impl std::hash::Hash for ByteSize {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl FromStr for ByteSize {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_uppercase();
        let invalid = || ConfigError::InvalidSize(s.to_string());

        let suffix = label.chars().last().ok_or_else(invalid)?;
        let multiplier: u64 = match suffix {
            'K' => 1024,
            'M' => 1024 * 1024,
            'G' => 1024 * 1024 * 1024,
            _ => return Err(invalid()),
        };
        let digits = &label[..label.len() - 1];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let count: u64 = digits.parse().map_err(|_| invalid())?;
        let bytes = count.checked_mul(multiplier).ok_or_else(invalid)?;
        if bytes == 0 {
            return Err(invalid());
        }

        // drop leading zeros so "016K" and "16K" share one label
        let label = format!("{}{}", count, suffix);
        Ok(Self { bytes, label })
    }
}

impl TryFrom<String> for ByteSize {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.label
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Value lists for every recognized axis
///
/// `size` and `dirty_fraction` are always swept. The other axes are only
/// active when present; an axis that is present must not be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Allocation sizes
    pub size: Vec<ByteSize>,

    /// Fraction of the allocation to dirty (0.0 - 1.0)
    pub dirty_fraction: Vec<f64>,

    /// Fraction of the allocation made resident before measuring
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resident_fraction: Option<Vec<f64>>,

    /// Threads inside each workload process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<Vec<usize>>,

    /// Process-group size reported to the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<Vec<usize>>,
}

impl AxisConfig {
    /// Active axes in declaration order (outermost first)
    pub fn axes(&self) -> Vec<Axis> {
        let mut axes = vec![
            Axis::new(
                AxisKind::Size,
                self.size.iter().cloned().map(AxisValue::Size).collect(),
            ),
            Axis::new(
                AxisKind::DirtyFraction,
                self.dirty_fraction
                    .iter()
                    .copied()
                    .map(AxisValue::Fraction)
                    .collect(),
            ),
        ];
        if let Some(values) = &self.resident_fraction {
            axes.push(Axis::new(
                AxisKind::ResidentFraction,
                values.iter().copied().map(AxisValue::Fraction).collect(),
            ));
        }
        if let Some(values) = &self.threads {
            axes.push(Axis::new(
                AxisKind::Threads,
                values.iter().copied().map(AxisValue::Count).collect(),
            ));
        }
        if let Some(values) = &self.processes {
            axes.push(Axis::new(
                AxisKind::Processes,
                values.iter().copied().map(AxisValue::Count).collect(),
            ));
        }
        axes
    }
}

/// Where and how result files are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving one file per grid point
    pub dir: PathBuf,

    /// Prepended to every file name
    pub prefix: String,

    /// Write `<name>.failed.json` for failed grid points
    pub failure_markers: bool,

    /// Write a manifest summarizing the sweep
    pub manifest: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
            prefix: String::new(),
            failure_markers: true,
            manifest: true,
        }
    }
}

/// Complete sweep configuration
///
/// One structure covers every harness variant: the variants only differ in
/// which axes are active and in their run constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Workload executable and pass-through arguments
    pub workload: WorkloadSpec,

    /// Axis value lists
    pub axes: AxisConfig,

    /// Iterations each workload process runs internally
    #[serde(default = "default_iterations")]
    pub iterations: u64,

    /// Maximum number of workload processes running at once
    #[serde(default = "default_max_parallel", alias = "parallel", alias = "jobs")]
    pub max_parallel: usize,

    /// Processes launched per grid point; follows the `processes` axis when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<usize>,

    /// Per-process wall-clock limit in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Output settings
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_iterations() -> u64 {
    1
}

fn default_max_parallel() -> usize {
    1
}

impl SweepConfig {
    /// Create a config for `program` with the mandatory axes
    pub fn new(program: impl Into<PathBuf>, size: Vec<ByteSize>, dirty_fraction: Vec<f64>) -> Self {
        Self {
            workload: WorkloadSpec::new(program),
            axes: AxisConfig {
                size,
                dirty_fraction,
                ..Default::default()
            },
            iterations: default_iterations(),
            max_parallel: default_max_parallel(),
            fan_out: None,
            timeout_secs: None,
            output: OutputConfig::default(),
        }
    }

    /// Load a JSON config file
    pub fn from_file(path: &Path) -> BenchResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Set the iteration count
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the concurrency ceiling
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Set a fixed fan-out width
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = Some(fan_out);
        self
    }

    /// Set the output directory
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output.dir = dir.into();
        self
    }

    /// Per-process timeout, if configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Run-wide constants shared by every grid point
    pub fn run_constants(&self) -> RunConstants {
        RunConstants {
            iterations: self.iterations,
            max_parallel: self.max_parallel,
            fan_out: match self.fan_out {
                Some(n) => FanOut::Fixed(n),
                None => FanOut::MatchProcesses,
            },
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workload.program.as_os_str().is_empty() {
            return Err(ConfigError::MissingWorkload);
        }
        if self.iterations == 0 {
            return Err(ConfigError::InvalidConstant(
                "iterations must be at least 1".into(),
            ));
        }
        if self.max_parallel == 0 || self.max_parallel > MAX_PROCESSES {
            return Err(ConfigError::InvalidConstant(format!(
                "max_parallel must be between 1 and {}",
                MAX_PROCESSES
            )));
        }
        if matches!(self.fan_out, Some(n) if n == 0 || n > MAX_PROCESSES) {
            return Err(ConfigError::InvalidConstant(format!(
                "fan_out must be between 1 and {}",
                MAX_PROCESSES
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::InvalidConstant(
                "timeout must be at least 1 second".into(),
            ));
        }
        if self.output.prefix.contains(['/', '\\']) {
            return Err(ConfigError::InvalidPrefix(self.output.prefix.clone()));
        }

        for axis in self.axes.axes() {
            for value in axis.values() {
                match value {
                    AxisValue::Fraction(f) => {
                        if !f.is_finite() || f.is_sign_negative() || *f > 1.0 {
                            return Err(ConfigError::InvalidFraction {
                                axis: axis.kind().name(),
                                value: *f,
                            });
                        }
                    }
                    AxisValue::Count(n) if *n == 0 || *n > MAX_PROCESSES => {
                        return Err(ConfigError::InvalidCount(axis.kind().name()));
                    }
                    AxisValue::Count(_) | AxisValue::Size(_) => {}
                }
            }
        }

        Ok(())
    }

    /// Validate and build the grid
    pub fn grid(&self) -> Result<Grid, ConfigError> {
        self.validate()?;
        Grid::new(self.axes.axes(), self.run_constants())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An active axis has no values
    #[error("axis '{0}' has no values")]
    EmptyAxis(&'static str),

    /// The same value appears twice on one axis
    #[error("axis '{axis}' lists {value} more than once")]
    DuplicateValue {
        /// Axis name
        axis: &'static str,
        /// Offending value
        value: String,
    },

    /// The same axis was declared twice
    #[error("axis '{0}' declared more than once")]
    DuplicateAxis(&'static str),

    /// Size without a K/M/G suffix, zero, or overflowing
    #[error("invalid size '{0}': expected a positive integer followed by K, M or G")]
    InvalidSize(String),

    /// Fraction outside [0, 1]
    #[error("axis '{axis}' value {value} is not a fraction between 0.0 and 1.0")]
    InvalidFraction {
        /// Axis name
        axis: &'static str,
        /// Offending value
        value: f64,
    },

    /// Zero or out-of-range value on a count axis
    #[error("axis '{0}' values must be between 1 and {max}", max = MAX_PROCESSES)]
    InvalidCount(&'static str),

    /// Invalid run constant
    #[error("invalid run constant: {0}")]
    InvalidConstant(String),

    /// Fan-out cannot be determined for the grid
    #[error("fan_out is unset and there is no processes axis to follow")]
    UnresolvedFanOut,

    /// No workload executable given
    #[error("no workload executable configured")]
    MissingWorkload,

    /// File prefix would escape the output directory
    #[error("output prefix '{0}' must not contain path separators")]
    InvalidPrefix(String),
}
