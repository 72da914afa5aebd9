//! Grid enumeration
//!
//! A [`Grid`] is the cross product of an ordered list of [`Axis`] value
//! lists. Points come out in declaration order with the first axis varying
//! slowest, so two enumerations of the same grid always agree.

use std::fmt;

use serde::Serialize;

use crate::config::{ByteSize, ConfigError};

/// A recognized sweep dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    /// Allocation size
    Size,
    /// Fraction of the allocation dirtied
    DirtyFraction,
    /// Fraction of the allocation made resident
    ResidentFraction,
    /// Threads per workload process
    Threads,
    /// Process-group size
    Processes,
}

impl AxisKind {
    /// Short name used in diagnostics and file names
    pub fn name(&self) -> &'static str {
        match self {
            Self::Size => "size",
            Self::DirtyFraction => "dirty",
            Self::ResidentFraction => "resident",
            Self::Threads => "threads",
            Self::Processes => "procs",
        }
    }
}

impl fmt::Display for AxisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value on an axis
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AxisValue {
    /// Allocation size
    Size(ByteSize),
    /// Ratio between 0.0 and 1.0
    Fraction(f64),
    /// Positive count
    Count(usize),
}

impl fmt::Display for AxisValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Size(size) => write!(f, "{}", size),
            Self::Fraction(v) => write!(f, "{}", v),
            Self::Count(n) => write!(f, "{}", n),
        }
    }
}

/// A named dimension with its ordered values
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    kind: AxisKind,
    values: Vec<AxisValue>,
}

impl Axis {
    /// Create an axis
    pub fn new(kind: AxisKind, values: Vec<AxisValue>) -> Self {
        Self { kind, values }
    }

    /// Axis kind
    pub fn kind(&self) -> AxisKind {
        self.kind
    }

    /// Values in sweep order
    pub fn values(&self) -> &[AxisValue] {
        &self.values
    }
}

/// How many processes each grid point launches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    /// Same width for every point
    Fixed(usize),
    /// Width equals the point's `processes` value
    MatchProcesses,
}

/// Constants shared by every point of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunConstants {
    /// Iterations per workload process
    pub iterations: u64,
    /// Global concurrency ceiling
    pub max_parallel: usize,
    /// Fan-out rule
    pub fan_out: FanOut,
}

/// One concrete assignment of a value to every active axis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridPoint {
    index: usize,
    values: Vec<(AxisKind, AxisValue)>,
    iterations: u64,
    max_parallel: usize,
    fan_out: usize,
}

impl GridPoint {
    /// Position in enumeration order
    pub fn index(&self) -> usize {
        self.index
    }

    /// Axis values in declaration order
    pub fn values(&self) -> &[(AxisKind, AxisValue)] {
        &self.values
    }

    /// Value of `kind`, if that axis is active
    pub fn value(&self, kind: AxisKind) -> Option<&AxisValue> {
        self.values
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| v)
    }

    /// Allocation size
    pub fn size(&self) -> Option<&ByteSize> {
        match self.value(AxisKind::Size) {
            Some(AxisValue::Size(size)) => Some(size),
            _ => None,
        }
    }

    /// Dirty fraction
    pub fn dirty_fraction(&self) -> Option<f64> {
        self.fraction(AxisKind::DirtyFraction)
    }

    /// Resident fraction
    pub fn resident_fraction(&self) -> Option<f64> {
        self.fraction(AxisKind::ResidentFraction)
    }

    /// Threads per process
    pub fn threads(&self) -> Option<usize> {
        self.count(AxisKind::Threads)
    }

    /// Process-group size
    pub fn processes(&self) -> Option<usize> {
        self.count(AxisKind::Processes)
    }

    /// Iterations per process
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Concurrency ceiling
    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Number of processes to launch for this point
    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    fn fraction(&self, kind: AxisKind) -> Option<f64> {
        match self.value(kind) {
            Some(AxisValue::Fraction(v)) => Some(*v),
            _ => None,
        }
    }

    fn count(&self, kind: AxisKind) -> Option<usize> {
        match self.value(kind) {
            Some(AxisValue::Count(n)) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for GridPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)?;
        for (kind, value) in &self.values {
            write!(f, " {}={}", kind, value)?;
        }
        write!(
            f,
            " iter={} par={} fanout={}",
            self.iterations, self.max_parallel, self.fan_out
        )
    }
}

/// Validated cross product of axes
#[derive(Debug, Clone)]
pub struct Grid {
    axes: Vec<Axis>,
    constants: RunConstants,
}

impl Grid {
    /// Validate `axes` and build the grid
    ///
    /// Fails on an empty axis, a repeated axis, a repeated value within an
    /// axis, or a fan-out rule with nothing to follow.
    pub fn new(axes: Vec<Axis>, constants: RunConstants) -> Result<Self, ConfigError> {
        for (i, axis) in axes.iter().enumerate() {
            if axis.values.is_empty() {
                return Err(ConfigError::EmptyAxis(axis.kind.name()));
            }
            if axes[..i].iter().any(|a| a.kind == axis.kind) {
                return Err(ConfigError::DuplicateAxis(axis.kind.name()));
            }
            for (j, value) in axis.values.iter().enumerate() {
                if axis.values[..j].contains(value) {
                    return Err(ConfigError::DuplicateValue {
                        axis: axis.kind.name(),
                        value: value.to_string(),
                    });
                }
            }
        }

        if constants.fan_out == FanOut::MatchProcesses
            && !axes.iter().any(|a| a.kind == AxisKind::Processes)
        {
            return Err(ConfigError::UnresolvedFanOut);
        }

        Ok(Self { axes, constants })
    }

    /// Axes in declaration order
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Run constants
    pub fn constants(&self) -> RunConstants {
        self.constants
    }

    /// Number of grid points
    pub fn len(&self) -> usize {
        if self.axes.is_empty() {
            return 0;
        }
        self.axes.iter().map(|a| a.values.len()).product()
    }

    /// Whether the grid has no points (only possible with no axes)
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Lazily enumerate every point
    pub fn points(&self) -> GridPoints<'_> {
        GridPoints {
            grid: self,
            cursor: vec![0; self.axes.len()],
            next: 0,
            total: self.len(),
        }
    }

    fn point_at(&self, index: usize, cursor: &[usize]) -> GridPoint {
        let values: Vec<(AxisKind, AxisValue)> = self
            .axes
            .iter()
            .zip(cursor)
            .map(|(axis, &i)| (axis.kind, axis.values[i].clone()))
            .collect();

        let fan_out = match self.constants.fan_out {
            FanOut::Fixed(n) => n,
            // Grid::new guarantees a processes axis for this rule
            FanOut::MatchProcesses => values
                .iter()
                .find_map(|(kind, value)| match (kind, value) {
                    (AxisKind::Processes, AxisValue::Count(n)) => Some(*n),
                    _ => None,
                })
                .unwrap_or(1),
        };

        GridPoint {
            index,
            values,
            iterations: self.constants.iterations,
            max_parallel: self.constants.max_parallel,
            fan_out,
        }
    }
}

/// Iterator over a grid's points, outer axis slowest
#[derive(Debug, Clone)]
pub struct GridPoints<'a> {
    grid: &'a Grid,
    cursor: Vec<usize>,
    next: usize,
    total: usize,
}

impl Iterator for GridPoints<'_> {
    type Item = GridPoint;

    fn next(&mut self) -> Option<GridPoint> {
        if self.next >= self.total {
            return None;
        }

        let point = self.grid.point_at(self.next, &self.cursor);
        self.next += 1;

        // odometer: bump the innermost axis, carry outwards
        for (slot, axis) in self.cursor.iter_mut().zip(&self.grid.axes).rev() {
            *slot += 1;
            if *slot < axis.values.len() {
                break;
            }
            *slot = 0;
        }

        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GridPoints<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn size_axis(labels: &[&str]) -> Axis {
        Axis::new(
            AxisKind::Size,
            labels
                .iter()
                .map(|s| AxisValue::Size(s.parse().unwrap()))
                .collect(),
        )
    }

    fn fraction_axis(kind: AxisKind, values: &[f64]) -> Axis {
        Axis::new(kind, values.iter().copied().map(AxisValue::Fraction).collect())
    }

    fn count_axis(kind: AxisKind, values: &[usize]) -> Axis {
        Axis::new(kind, values.iter().copied().map(AxisValue::Count).collect())
    }

    fn constants(fan_out: FanOut) -> RunConstants {
        RunConstants {
            iterations: 10,
            max_parallel: 16,
            fan_out,
        }
    }

    #[test]
    fn test_cross_product_count() {
        let grid = Grid::new(
            vec![
                size_axis(&["16K", "32K", "64K"]),
                fraction_axis(AxisKind::DirtyFraction, &[1.0, 0.5]),
                count_axis(AxisKind::Threads, &[1, 2, 4, 8]),
            ],
            constants(FanOut::Fixed(16)),
        )
        .unwrap();

        assert_eq!(grid.len(), 24);
        assert_eq!(grid.points().len(), 24);
        assert_eq!(grid.points().count(), 24);
    }

    #[test]
    fn test_outer_axis_varies_slowest() {
        let grid = Grid::new(
            vec![
                size_axis(&["16K", "32K"]),
                fraction_axis(AxisKind::DirtyFraction, &[1.0, 0.5]),
            ],
            constants(FanOut::Fixed(16)),
        )
        .unwrap();

        let order: Vec<(String, f64)> = grid
            .points()
            .map(|p| (p.size().unwrap().to_string(), p.dirty_fraction().unwrap()))
            .collect();

        assert_eq!(
            order,
            vec![
                ("16K".to_string(), 1.0),
                ("16K".to_string(), 0.5),
                ("32K".to_string(), 1.0),
                ("32K".to_string(), 0.5),
            ]
        );
    }

    #[test]
    fn test_enumeration_is_deterministic_and_unique() {
        let grid = Grid::new(
            vec![
                size_axis(&["16K", "1M"]),
                fraction_axis(AxisKind::DirtyFraction, &[1.0, 0.25, 0.0]),
                fraction_axis(AxisKind::ResidentFraction, &[0.5, 1.0]),
            ],
            constants(FanOut::Fixed(4)),
        )
        .unwrap();

        let first: Vec<GridPoint> = grid.points().collect();
        let second: Vec<GridPoint> = grid.points().collect();
        assert_eq!(first, second);

        for (i, a) in first.iter().enumerate() {
            assert_eq!(a.index(), i);
            for b in &first[i + 1..] {
                assert_ne!(a.values(), b.values());
            }
        }
    }

    #[test]
    fn test_points_carry_run_constants() {
        let grid = Grid::new(vec![size_axis(&["16K"])], constants(FanOut::Fixed(8))).unwrap();
        let point = grid.points().next().unwrap();

        assert_eq!(point.iterations(), 10);
        assert_eq!(point.max_parallel(), 16);
        assert_eq!(point.fan_out(), 8);
        assert_eq!(point.threads(), None);
    }

    #[test]
    fn test_fan_out_follows_processes() {
        let grid = Grid::new(
            vec![
                size_axis(&["16K"]),
                count_axis(AxisKind::Processes, &[1, 4, 16]),
            ],
            constants(FanOut::MatchProcesses),
        )
        .unwrap();

        let widths: Vec<usize> = grid.points().map(|p| p.fan_out()).collect();
        assert_eq!(widths, vec![1, 4, 16]);
    }

    #[test]
    fn test_match_processes_without_axis_fails() {
        let result = Grid::new(vec![size_axis(&["16K"])], constants(FanOut::MatchProcesses));
        assert!(matches!(result, Err(ConfigError::UnresolvedFanOut)));
    }

    #[test]
    fn test_empty_axis_rejected() {
        let result = Grid::new(
            vec![size_axis(&["16K"]), count_axis(AxisKind::Threads, &[])],
            constants(FanOut::Fixed(1)),
        );
        assert!(matches!(result, Err(ConfigError::EmptyAxis("threads"))));
    }

    #[test]
    fn test_duplicate_value_rejected() {
        let result = Grid::new(
            vec![size_axis(&["1024K", "1024k"])],
            constants(FanOut::Fixed(1)),
        );
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateValue { axis: "size", .. })
        ));

        let result = Grid::new(vec![size_axis(&["1024K", "1M"])], constants(FanOut::Fixed(1)));
        assert!(result.is_err());

        let result = Grid::new(
            vec![fraction_axis(AxisKind::DirtyFraction, &[0.5, 1.0, 0.5])],
            constants(FanOut::Fixed(1)),
        );
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateValue { axis: "dirty", .. })
        ));
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let result = Grid::new(
            vec![
                count_axis(AxisKind::Threads, &[1]),
                count_axis(AxisKind::Threads, &[2]),
            ],
            constants(FanOut::Fixed(1)),
        );
        assert!(matches!(result, Err(ConfigError::DuplicateAxis("threads"))));
    }

    #[test]
    fn test_no_axes_yields_nothing() {
        let grid = Grid::new(vec![], constants(FanOut::Fixed(1))).unwrap();
        assert!(grid.is_empty());
        assert_eq!(grid.points().count(), 0);
    }

    #[test]
    fn test_point_display() {
        let grid = Grid::new(
            vec![
                size_axis(&["16K"]),
                fraction_axis(AxisKind::DirtyFraction, &[0.5]),
            ],
            constants(FanOut::Fixed(16)),
        )
        .unwrap();
        let point = grid.points().next().unwrap();

        assert_eq!(
            point.to_string(),
            "#0 size=16K dirty=0.5 iter=10 par=16 fanout=16"
        );
    }
}
