//! Bounded process fan-out per grid point
//!
//! The scheduler runs one grid point at a time:
//! - Launching `fan_out` workload processes for the point
//! - Bounding how many run at once via a semaphore
//! - Collecting outcomes in completion order over a channel
//! - Draining every launch before returning, even after a failure
//!
//! # Example
//!
//! ```ignore
//! use sweep_bench_core::{Invocation, PointOutcome, SchedulerBuilder};
//!
//! let scheduler = SchedulerBuilder::new().max_parallel(16).build()?;
//!
//! for point in grid.points() {
//!     let invocation = Invocation::build(&workload, &point);
//!     let run = scheduler.run_point(&point, &invocation).await?;
//!     if let PointOutcome::Complete(results) = run.outcome {
//!         // persist results
//!     }
//! }
//! ```

mod aggregator;
mod builder;
mod executor;
mod stats;

pub use aggregator::{
    FailureReason, InvocationFailure, PointOutcome, ResultAggregator, ResultSet, RunRecord,
};
pub use builder::SchedulerBuilder;
pub use executor::{FanOutScheduler, PointRun, ShutdownHandle};
pub use stats::PointStats;
