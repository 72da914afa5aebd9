//! Mapping grid points to workload command lines

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};

use crate::grid::{AxisKind, GridPoint};

/// Flag asking the workload for a single JSON value on stdout
pub const JSON_FLAG: &str = "--json";

/// The external workload executable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Path to the executable
    pub program: PathBuf,

    /// Arguments appended after the generated flags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl WorkloadSpec {
    /// Workload at `program` with no extra arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Append a pass-through argument
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

/// Long flag the workload accepts for each axis
pub fn axis_flag(kind: AxisKind) -> &'static str {
    match kind {
        AxisKind::Size => "--size",
        AxisKind::DirtyFraction => "--dirty-fraction",
        AxisKind::ResidentFraction => "--resident-fraction",
        AxisKind::Threads => "--threads",
        AxisKind::Processes => "--processes",
    }
}

/// Concrete command line for one grid point
///
/// Every parameter is passed as an explicit `--flag value` pair so the
/// order of axes never changes what the workload sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
}

impl Invocation {
    /// Build the invocation of `workload` for `point`
    pub fn build(workload: &WorkloadSpec, point: &GridPoint) -> Self {
        let mut args = Vec::with_capacity(point.values().len() * 2 + 3 + workload.extra_args.len());

        for (kind, value) in point.values() {
            args.push(axis_flag(*kind).to_string());
            args.push(value.to_string());
        }
        args.push("--iterations".to_string());
        args.push(point.iterations().to_string());
        args.push(JSON_FLAG.to_string());
        args.extend(workload.extra_args.iter().cloned());

        Self {
            program: workload.program.clone(),
            args,
        }
    }

    /// Executable path
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Arguments, without the program
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Value following `flag`, if present
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .windows(2)
            .find(|pair| pair[0] == flag)
            .map(|pair| pair[1].as_str())
    }

    /// A ready-to-spawn command with piped stdout/stderr
    ///
    /// Children are killed when their handle is dropped so an abandoned
    /// grid point never leaves workload processes behind.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(self.args.iter().map(OsString::from))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
