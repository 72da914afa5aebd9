//! Builder pattern for FanOutScheduler construction

use std::sync::Arc;

use crate::config::{ConfigError, MAX_PROCESSES};
use crate::error::BenchResult;
use crate::process::ProcessWorkload;
use crate::traits::Workload;

use super::executor::FanOutScheduler;

/// Builder for creating a FanOutScheduler
///
/// # Example
///
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .max_parallel(16)
///     .workload(Arc::new(ProcessWorkload::new()))
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    max_parallel: usize,
    workload: Option<Arc<dyn Workload>>,
}

impl SchedulerBuilder {
    /// Create a new builder with a ceiling of one process
    pub fn new() -> Self {
        Self {
            max_parallel: 1,
            workload: None,
        }
    }

    /// Set the concurrency ceiling
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Set the workload; defaults to [`ProcessWorkload`]
    pub fn workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workload = Some(workload);
        self
    }

    /// Build the scheduler
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the ceiling is zero or larger than
    /// [`MAX_PROCESSES`].
    pub fn build(self) -> BenchResult<FanOutScheduler> {
        if self.max_parallel == 0 || self.max_parallel > MAX_PROCESSES {
            return Err(ConfigError::InvalidConstant(format!(
                "max_parallel must be between 1 and {}",
                MAX_PROCESSES
            ))
            .into());
        }

        let workload = self
            .workload
            .unwrap_or_else(|| Arc::new(ProcessWorkload::new()));

        Ok(FanOutScheduler::new(self.max_parallel, workload))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
