//! Grid generation for 1D and 2D scans.
//!
//! A scan is described by a [`GridRequest`] and turned, once per scan
//! setup, into an immutable [`Grid`]: the ordered list of target positions
//! the engine will visit, plus the addressing scheme the storage layer
//! writes with. Each [`GridStep`] carries its integer grid-cell index into
//! the per-axis unique-value sets, so (step, average) maps directly onto a
//! position in every channel's data array.
//!
//! Sub-kind support by scan kind:
//!
//! | sub-kind          | Scan1D | Scan2D |
//! |-------------------|--------|--------|
//! | Linear            | yes    | yes (axis-1 outer, axis-2 inner) |
//! | LinearBackToStart | yes    | no     |
//! | Random            | yes    | yes    |
//! | BackAndForth      | no     | yes (inner axis reversed on alternating rows) |
//! | Spiral            | no     | yes (square spiral outward from the center) |

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use scan_core::{ScanError, ScanResult};

/// Absolute tolerance used when snapping generated values onto bounds.
const EPS: f64 = 1e-9;

/// Scan dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanKind {
    Scan1D,
    Scan2D,
}

impl ScanKind {
    /// Number of move axes this kind requires.
    pub fn axes_needed(&self) -> usize {
        match self {
            ScanKind::Scan1D => 1,
            ScanKind::Scan2D => 2,
        }
    }
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanKind::Scan1D => write!(f, "Scan1D"),
            ScanKind::Scan2D => write!(f, "Scan2D"),
        }
    }
}

/// Trajectory shape within a scan kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanSubKind {
    Linear,
    LinearBackToStart,
    Spiral,
    BackAndForth,
    Random,
}

impl std::fmt::Display for ScanSubKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ScanSubKind::Linear => "Linear",
            ScanSubKind::LinearBackToStart => "LinearBackToStart",
            ScanSubKind::Spiral => "Spiral",
            ScanSubKind::BackAndForth => "BackAndForth",
            ScanSubKind::Random => "Random",
        };
        write!(f, "{}", label)
    }
}

/// Inclusive start/stop range with step magnitude for one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

/// Spiral parameters: center point, maximal ring radius and ring spacing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpiralRange {
    pub center1: f64,
    pub center2: f64,
    pub rmax: f64,
    pub rstep: f64,
}

/// Everything needed to generate a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridRequest {
    pub kind: ScanKind,
    pub sub_kind: ScanSubKind,
    /// Per-axis ranges, ignored for Spiral.
    pub axes: Vec<AxisRange>,
    /// Spiral parameters, required for Spiral.
    pub spiral: Option<SpiralRange>,
    /// Actuator names in axis order.
    pub actuators: Vec<String>,
}

/// One target of a scan: (actuator, position) pairs in axis order plus the
/// integer grid-cell index used for storage addressing.
#[derive(Debug, Clone, PartialEq)]
pub struct GridStep {
    pub targets: Vec<(String, f64)>,
    pub cell: Vec<usize>,
}

/// Immutable scan trajectory, created once per scan setup.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    /// Ordered steps the session will visit.
    pub steps: Vec<GridStep>,
    /// Raw per-step value sequence for each axis (the navigation axes).
    pub axes: Vec<Vec<f64>>,
    /// Unique value set for each axis; grid cells index into these.
    pub axes_unique: Vec<Vec<f64>>,
    pub kind: ScanKind,
    pub sub_kind: ScanSubKind,
}

impl Grid {
    /// Generate the grid for a request.
    pub fn build(req: &GridRequest) -> ScanResult<Grid> {
        let needed = req.kind.axes_needed();
        if req.actuators.len() < needed {
            return Err(ScanError::InvalidScanConfig(format!(
                "{} requires {} actuator(s), {} configured",
                req.kind,
                needed,
                req.actuators.len()
            )));
        }
        match (req.kind, req.sub_kind) {
            (ScanKind::Scan1D, ScanSubKind::Linear) => build_linear_1d(req, false),
            (ScanKind::Scan1D, ScanSubKind::LinearBackToStart) => build_back_to_start(req),
            (ScanKind::Scan1D, ScanSubKind::Random) => build_linear_1d(req, true),
            (ScanKind::Scan2D, ScanSubKind::Linear) => build_linear_2d(req, false, false),
            (ScanKind::Scan2D, ScanSubKind::BackAndForth) => build_linear_2d(req, true, false),
            (ScanKind::Scan2D, ScanSubKind::Random) => build_linear_2d(req, false, true),
            (ScanKind::Scan2D, ScanSubKind::Spiral) => build_spiral(req),
            (kind, sub) => Err(ScanError::InvalidScanConfig(format!(
                "sub-kind {} is not supported for {}",
                sub, kind
            ))),
        }
    }

    /// Scan shape: per-axis unique-value counts, in axis order.
    pub fn shape(&self) -> Vec<usize> {
        self.axes_unique.iter().map(Vec::len).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Inclusive value sequence from `start` to `stop` with increment
/// magnitude `|step|`; direction inferred from `sign(stop - start)`. The
/// final increment is shortened so the sequence lands exactly on `stop`.
pub fn linspace_step(start: f64, stop: f64, step: f64) -> ScanResult<Vec<f64>> {
    if !start.is_finite() || !stop.is_finite() || !step.is_finite() {
        return Err(ScanError::InvalidScanConfig(
            "axis bounds and step must be finite".to_string(),
        ));
    }
    if step == 0.0 {
        return Err(ScanError::InvalidScanConfig(
            "axis step must be non-zero".to_string(),
        ));
    }
    let span = stop - start;
    if span.abs() <= EPS {
        return Ok(vec![start]);
    }
    let inc = step.abs() * span.signum();
    let whole = (span / inc + EPS).floor() as usize;
    let mut values: Vec<f64> = (0..=whole).map(|i| start + i as f64 * inc).collect();
    let tol = step.abs() * 1e-6;
    match values.last_mut() {
        Some(last) if (stop - *last).abs() <= tol => *last = stop,
        _ => values.push(stop),
    }
    Ok(values)
}

fn axis_values(req: &GridRequest, axis: usize) -> ScanResult<Vec<f64>> {
    let range = req.axes.get(axis).ok_or_else(|| {
        ScanError::InvalidScanConfig(format!(
            "{} requires {} axis range(s), {} configured",
            req.kind,
            req.kind.axes_needed(),
            req.axes.len()
        ))
    })?;
    linspace_step(range.start, range.stop, range.step)
}

fn sorted_unique(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v.dedup();
    v
}

/// Index of a generated value within its axis-unique set. Values are
/// looked up by exact equality: both come from the same computation.
fn unique_index(unique: &[f64], value: f64) -> usize {
    unique.iter().position(|u| *u == value).unwrap_or(0)
}

fn build_linear_1d(req: &GridRequest, shuffle: bool) -> ScanResult<Grid> {
    let name = &req.actuators[0];
    let mut values = axis_values(req, 0)?;
    if shuffle {
        values.shuffle(&mut rand::thread_rng());
    }
    let unique = sorted_unique(&values);
    let steps = values
        .iter()
        .map(|&v| GridStep {
            targets: vec![(name.clone(), v)],
            cell: vec![unique_index(&unique, v)],
        })
        .collect();
    Ok(Grid {
        steps,
        axes: vec![values],
        axes_unique: vec![unique],
        kind: req.kind,
        sub_kind: req.sub_kind,
    })
}

/// Interleave every value with the start position (value first), doubling
/// the sequence length. Addressing for this sub-kind is the raw step
/// index: the unique set is the interleaved sequence itself, so a trace
/// can be reconstructed from even-indexed samples alone.
fn build_back_to_start(req: &GridRequest) -> ScanResult<Grid> {
    let name = &req.actuators[0];
    let range = req.axes.first().ok_or_else(|| {
        ScanError::InvalidScanConfig("Scan1D requires one axis range".to_string())
    })?;
    let base = linspace_step(range.start, range.stop, range.step)?;
    let mut values = Vec::with_capacity(base.len() * 2);
    for v in base {
        values.push(v);
        values.push(range.start);
    }
    let steps = values
        .iter()
        .enumerate()
        .map(|(i, &v)| GridStep {
            targets: vec![(name.clone(), v)],
            cell: vec![i],
        })
        .collect();
    Ok(Grid {
        steps,
        axes: vec![values.clone()],
        axes_unique: vec![values],
        kind: req.kind,
        sub_kind: req.sub_kind,
    })
}

fn build_linear_2d(req: &GridRequest, back_and_forth: bool, shuffle: bool) -> ScanResult<Grid> {
    let name1 = &req.actuators[0];
    let name2 = &req.actuators[1];
    let values1 = axis_values(req, 0)?;
    let values2 = axis_values(req, 1)?;
    let unique1 = sorted_unique(&values1);
    let unique2 = sorted_unique(&values2);

    let mut steps = Vec::with_capacity(values1.len() * values2.len());
    for (row, &v1) in values1.iter().enumerate() {
        let reversed = back_and_forth && row % 2 == 1;
        let inner: Vec<f64> = if reversed {
            values2.iter().rev().copied().collect()
        } else {
            values2.clone()
        };
        for &v2 in &inner {
            steps.push(GridStep {
                targets: vec![(name1.clone(), v1), (name2.clone(), v2)],
                cell: vec![unique_index(&unique1, v1), unique_index(&unique2, v2)],
            });
        }
    }
    if shuffle {
        steps.shuffle(&mut rand::thread_rng());
    }
    let axes = raw_axes(&steps, 2);
    Ok(Grid {
        steps,
        axes,
        axes_unique: vec![unique1, unique2],
        kind: req.kind,
        sub_kind: req.sub_kind,
    })
}

/// Square spiral walked outward from the center with ring spacing
/// `rstep`. The ring count is `floor(rmax / rstep)`, so no point exceeds
/// `rmax` in ring (Chebyshev) radius; `rmax < rstep` degenerates to the
/// single center point.
fn build_spiral(req: &GridRequest) -> ScanResult<Grid> {
    let spiral = req.spiral.ok_or_else(|| {
        ScanError::InvalidScanConfig("Spiral requires spiral parameters".to_string())
    })?;
    if !spiral.rstep.is_finite() || spiral.rstep <= 0.0 {
        return Err(ScanError::InvalidScanConfig(
            "spiral rstep must be positive".to_string(),
        ));
    }
    if !spiral.rmax.is_finite() || spiral.rmax < 0.0 {
        return Err(ScanError::InvalidScanConfig(
            "spiral rmax must be non-negative".to_string(),
        ));
    }
    let name1 = &req.actuators[0];
    let name2 = &req.actuators[1];
    let rings = (spiral.rmax / spiral.rstep + EPS).floor() as i64;

    let offsets = spiral_offsets(rings);
    let unique = |center: f64| -> Vec<f64> {
        (-rings..=rings)
            .map(|k| center + k as f64 * spiral.rstep)
            .collect()
    };
    let unique1 = unique(spiral.center1);
    let unique2 = unique(spiral.center2);

    let steps: Vec<GridStep> = offsets
        .iter()
        .map(|&(ix, iy)| GridStep {
            targets: vec![
                (name1.clone(), spiral.center1 + ix as f64 * spiral.rstep),
                (name2.clone(), spiral.center2 + iy as f64 * spiral.rstep),
            ],
            cell: vec![(ix + rings) as usize, (iy + rings) as usize],
        })
        .collect();
    let axes = raw_axes(&steps, 2);
    Ok(Grid {
        steps,
        axes,
        axes_unique: vec![unique1, unique2],
        kind: req.kind,
        sub_kind: req.sub_kind,
    })
}

/// Integer offsets of a square (Ulam) spiral: start at the center, run
/// lengths 1,1,2,2,3,3,... with directions cycling right/up/left/down,
/// truncated to fill exactly a (2n+1) x (2n+1) square.
fn spiral_offsets(n: i64) -> Vec<(i64, i64)> {
    let side = (2 * n + 1) as usize;
    let total = side * side;
    let mut points = Vec::with_capacity(total);
    points.push((0i64, 0i64));
    if total == 1 {
        return points;
    }
    let dirs = [(1i64, 0i64), (0, 1), (-1, 0), (0, -1)];
    let (mut ix, mut iy) = (0i64, 0i64);
    let mut run = 1usize;
    let mut dir = 0usize;
    'walk: loop {
        for _ in 0..2 {
            let (dx, dy) = dirs[dir % 4];
            for _ in 0..run {
                ix += dx;
                iy += dy;
                points.push((ix, iy));
                if points.len() == total {
                    break 'walk;
                }
            }
            dir += 1;
        }
        run += 1;
    }
    points
}

/// Per-axis raw value sequences in step order, for the navigation axes.
fn raw_axes(steps: &[GridStep], naxes: usize) -> Vec<Vec<f64>> {
    (0..naxes)
        .map(|axis| {
            steps
                .iter()
                .map(|s| s.targets.get(axis).map(|t| t.1).unwrap_or(f64::NAN))
                .collect()
        })
        .collect()
}
