//! sweep-bench-core: Parameter-sweep orchestration for external benchmarks
//!
//! This crate drives an external workload executable across a grid of
//! parameters, including:
//!
//! - Sweep configuration and validation
//! - Grid enumeration and invocation building
//! - Bounded process fan-out per grid point
//! - Result aggregation and atomic persistence
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod grid;
pub mod invocation;
pub mod persistence;
pub mod process;
pub mod scheduler;
pub mod sweep;
pub mod traits;

#[cfg(all(test, unix))]
mod test_utils;

pub use config::{AxisConfig, ByteSize, ConfigError, OutputConfig, SweepConfig};
pub use error::*;
pub use grid::{Axis, AxisKind, AxisValue, FanOut, Grid, GridPoint, GridPoints, RunConstants};
pub use invocation::{Invocation, WorkloadSpec, JSON_FLAG};
pub use persistence::{OutputNamer, ResultStore};
pub use process::ProcessWorkload;
pub use scheduler::{
    FailureReason, FanOutScheduler, InvocationFailure, PointOutcome, PointRun, PointStats,
    ResultAggregator, ResultSet, RunRecord, SchedulerBuilder, ShutdownHandle,
};
pub use sweep::{PlannedPoint, PointStatus, PointSummary, Sweep, SweepSummary};
pub use traits::*;
