//! Per-point fan-out statistics

use std::time::{Duration, Instant};

/// Statistics tracked for each grid point
#[derive(Debug, Default, Clone)]
pub struct PointStats {
    /// Processes the point was supposed to launch
    pub fan_out: usize,

    /// Processes actually launched
    pub launched: usize,

    /// Processes that produced a record
    pub succeeded: usize,

    /// Processes that failed
    pub failed: usize,

    /// Highest number of processes observed running at once
    pub peak_running: usize,

    /// Fan-out start time
    pub started_at: Option<Instant>,

    /// Fan-out end time
    pub ended_at: Option<Instant>,
}

impl PointStats {
    /// Create new empty stats for a point of width `fan_out`
    pub fn new(fan_out: usize) -> Self {
        Self {
            fan_out,
            ..Default::default()
        }
    }

    /// Start tracking (records start time)
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Stop tracking (records end time)
    pub fn stop(&mut self) {
        self.ended_at = Some(Instant::now());
    }

    /// Get elapsed time, if started
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        Some(self.ended_at.unwrap_or_else(Instant::now) - start)
    }

    /// Whether every launched process has reported
    pub fn is_drained(&self) -> bool {
        self.succeeded + self.failed == self.launched
    }
}
