//! Spatial erodibility field (K) for the recovery phase.
//!
//! Each recovery year gets one field:
//!   1. active cells take `K_unmined` or the scenario's mined K for that year;
//!   2. closed cells take the log-space midpoint of the active range;
//!   3. `log10(K)` is averaged over a square odd window, padding beyond the
//!      grid edge with the same midpoint;
//!   4. the result is exponentiated back.
//!
//! Erodibility spans orders of magnitude, so averaging happens in log space.
//! The output is strictly positive wherever the inputs are.
#[cfg(feature = "threading")]
use rayon::prelude::*;

use crate::error::ConfigError;
use crate::forcing::ForcingTimeline;
use crate::grid::RasterGrid;
use crate::raster::Raster;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskClass {
    Mined,
    Unmined,
    NoData,
}

/// Per-cell mined/unmined classification.
#[derive(Debug, Clone)]
pub struct MinedMask {
    classes: Vec<MaskClass>,
}

impl MinedMask {
    /// Classify a 0/1 mask raster: `1` is mined, the sentinel or a
    /// non-finite value is no-data, anything else is unmined. The mask must
    /// share the DEM's shape.
    pub fn from_raster(raster: &Raster, nodata: f64, grid: &RasterGrid) -> Result<Self, ConfigError> {
        let h = &raster.header;
        if h.nrows != grid.nrows() || h.ncols != grid.ncols() {
            return Err(ConfigError::ShapeMismatch {
                what: "mined mask".into(),
                expected_rows: grid.nrows(),
                expected_cols: grid.ncols(),
                rows: h.nrows,
                cols: h.ncols,
            });
        }
        if !h.same_geometry(grid.header()) {
            tracing::warn!("mined mask georeferencing differs from the DEM; using cell order");
        }
        let classes = raster
            .data
            .iter()
            .map(|&v| {
                if !v.is_finite() || v == nodata {
                    MaskClass::NoData
                } else if v == 1.0 {
                    MaskClass::Mined
                } else {
                    MaskClass::Unmined
                }
            })
            .collect();
        Ok(Self { classes })
    }

    pub fn uniform(len: usize, class: MaskClass) -> Self {
        Self {
            classes: vec![class; len],
        }
    }

    pub fn from_classes(classes: Vec<MaskClass>) -> Self {
        Self { classes }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    #[inline]
    pub fn is_mined(&self, i: usize) -> bool {
        self.classes[i] == MaskClass::Mined
    }

    pub fn mined_count(&self) -> usize {
        self.classes.iter().filter(|&&c| c == MaskClass::Mined).count()
    }
}

/// Builds the smoothed erodibility field for any recovery year.
#[derive(Debug, Clone)]
pub struct ErodibilitySynthesizer {
    nrows: usize,
    ncols: usize,
    active: Vec<bool>,
    mined: Vec<bool>,
    k_unmined: f64,
    /// Mined-cell K per recovery year.
    mined_curve: Vec<f64>,
    window: usize,
}

impl ErodibilitySynthesizer {
    /// `mined_curve[i]` is the K of mined cells in recovery year `i`.
    pub fn new(
        grid: &RasterGrid,
        mask: &MinedMask,
        k_unmined: f64,
        mined_curve: Vec<f64>,
        window: usize,
    ) -> Result<Self, ConfigError> {
        if mask.len() != grid.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "mined mask".into(),
                expected_rows: grid.nrows(),
                expected_cols: grid.ncols(),
                rows: mask.len() / grid.ncols().max(1),
                cols: grid.ncols(),
            });
        }
        if window == 0 || window % 2 == 0 {
            return Err(ConfigError::Erodibility(format!(
                "window size must be odd, got {window}"
            )));
        }
        if mined_curve.is_empty() {
            return Err(ConfigError::Erodibility("mined erodibility curve is empty".into()));
        }
        let bad = std::iter::once(k_unmined)
            .chain(mined_curve.iter().copied())
            .find(|k| !(k.is_finite() && *k > 0.0));
        if let Some(k) = bad {
            return Err(ConfigError::Erodibility(format!(
                "log-space smoothing needs positive erodibility, got {k}"
            )));
        }

        let active = (0..grid.len()).map(|i| !grid.is_closed(i)).collect();
        let mined = (0..grid.len()).map(|i| mask.is_mined(i)).collect();
        Ok(Self {
            nrows: grid.nrows(),
            ncols: grid.ncols(),
            active,
            mined,
            k_unmined,
            mined_curve,
            window,
        })
    }

    /// Synthesizer following the scenario's own recovery curve.
    pub fn from_forcing(
        grid: &RasterGrid,
        mask: &MinedMask,
        forcing: &ForcingTimeline,
        window: usize,
    ) -> Result<Self, ConfigError> {
        let curve = (0..forcing.recovery_years())
            .map(|y| forcing.erodibility_curve(y))
            .collect();
        Self::new(grid, mask, forcing.k_unmined(), curve, window)
    }

    pub fn recovery_years(&self) -> usize {
        self.mined_curve.len()
    }

    /// Unsmoothed K: `None` on closed cells.
    pub fn raw_field(&self, year: usize) -> Vec<Option<f64>> {
        let k_mined = self.mined_curve[year.min(self.mined_curve.len() - 1)];
        self.active
            .iter()
            .zip(&self.mined)
            .map(|(&active, &mined)| match (active, mined) {
                (false, _) => None,
                (true, true) => Some(k_mined),
                (true, false) => Some(self.k_unmined),
            })
            .collect()
    }

    /// The smoothed field for recovery year `year`; years past the curve
    /// reuse its final value.
    pub fn field(&self, year: usize) -> Vec<f64> {
        let raw = self.raw_field(year);
        let log_fill = log_midpoint(&raw);

        let log_k: Vec<f64> = raw
            .iter()
            .map(|k| k.map_or(log_fill, f64::log10))
            .collect();
        let smoothed = window_mean(&log_k, self.nrows, self.ncols, self.window, log_fill);
        smoothed.into_iter().map(|v| 10f64.powf(v)).collect()
    }

    /// Erodibility assigned to closed cells for `year`.
    pub fn closed_fill(&self, year: usize) -> f64 {
        10f64.powf(log_midpoint(&self.raw_field(year)))
    }
}

/// Midpoint of `log10(K)` between the smallest and largest active value.
fn log_midpoint(raw: &[Option<f64>]) -> f64 {
    let (lo, hi) = raw
        .iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &k| (lo.min(k), hi.max(k)));
    (lo.log10() + hi.log10()) / 2.0
}

/// Yearly fields for the recovery phase, computed on demand and memoized
/// one year at a time.
///
/// Sub-annual steps map to year `floor(elapsed)`, so with `dt = 0.5` two
/// consecutive steps share one field and it is computed once.
#[derive(Debug, Clone)]
pub struct RecoverySchedule {
    synth: ErodibilitySynthesizer,
    cached: Option<(usize, Vec<f64>)>,
    computed: usize,
}

impl RecoverySchedule {
    pub fn new(synth: ErodibilitySynthesizer) -> Self {
        Self {
            synth,
            cached: None,
            computed: 0,
        }
    }

    pub fn field(&mut self, year: usize) -> &[f64] {
        match &mut self.cached {
            Some((y, _)) if *y == year => {}
            slot => {
                *slot = Some((year, self.synth.field(year)));
                self.computed += 1;
            }
        }
        self.cached.as_ref().map(|(_, f)| f.as_slice()).unwrap_or_default()
    }

    /// How many distinct fields have been synthesized so far.
    pub fn fields_computed(&self) -> usize {
        self.computed
    }

    /// The static long-run field: the final recovery year's field.
    pub fn final_field(&mut self) -> Vec<f64> {
        let last = self.synth.recovery_years() - 1;
        self.field(last).to_vec()
    }
}

/// Where a run's erodibility comes from.
#[derive(Debug, Clone)]
pub enum ErodibilityPlan {
    /// Smoothed yearly fields during recovery, the final one afterwards.
    Scheduled(RecoverySchedule),
    /// One value everywhere for the whole run, unsmoothed.
    Uniform(f64),
}

impl ErodibilityPlan {
    /// Write the field for recovery year `year` into `out`.
    pub fn fill_recovery(&mut self, year: usize, out: &mut Vec<f64>) {
        match self {
            ErodibilityPlan::Scheduled(schedule) => {
                let field = schedule.field(year);
                out.clear();
                out.extend_from_slice(field);
            }
            ErodibilityPlan::Uniform(k) => out.iter_mut().for_each(|v| *v = *k),
        }
    }

    /// Write the static long-run field into `out`.
    pub fn fill_long_run(&mut self, out: &mut Vec<f64>) {
        match self {
            ErodibilityPlan::Scheduled(schedule) => *out = schedule.final_field(),
            ErodibilityPlan::Uniform(k) => out.iter_mut().for_each(|v| *v = *k),
        }
    }
}

/// Square moving-window mean over a row-major grid with constant padding.
///
/// Separable: a horizontal pass of row sums, then a vertical pass over
/// those. Rows outside the grid contribute `window * fill`.
pub fn window_mean(data: &[f64], nrows: usize, ncols: usize, window: usize, fill: f64) -> Vec<f64> {
    let half = (window / 2) as isize;
    let area = (window * window) as f64;

    let mut row_sums = vec![0.0_f64; nrows * ncols];
    for_each_row(&mut row_sums, ncols, |r, out| {
        let src = &data[r * ncols..(r + 1) * ncols];
        for (c, o) in out.iter_mut().enumerate() {
            let mut sum = 0.0;
            for dc in -half..=half {
                let nc = c as isize + dc;
                sum += if nc < 0 || nc >= ncols as isize { fill } else { src[nc as usize] };
            }
            *o = sum;
        }
    });

    let fill_row = fill * window as f64;
    let mut out = vec![0.0_f64; nrows * ncols];
    for_each_row(&mut out, ncols, |r, out_row| {
        for (c, o) in out_row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for dr in -half..=half {
                let nr = r as isize + dr;
                sum += if nr < 0 || nr >= nrows as isize {
                    fill_row
                } else {
                    row_sums[nr as usize * ncols + c]
                };
            }
            *o = sum / area;
        }
    });
    out
}

#[cfg(feature = "threading")]
fn for_each_row<F>(buf: &mut [f64], ncols: usize, f: F)
where
    F: Fn(usize, &mut [f64]) + Sync + Send,
{
    buf.par_chunks_mut(ncols)
        .enumerate()
        .for_each(|(r, row)| f(r, row));
}

#[cfg(not(feature = "threading"))]
fn for_each_row<F>(buf: &mut [f64], ncols: usize, f: F)
where
    F: Fn(usize, &mut [f64]),
{
    for (r, row) in buf.chunks_mut(ncols).enumerate() {
        f(r, row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::NodeStatus;
    use crate::raster::RasterHeader;
    use approx::assert_relative_eq;

    /// `n × n` grid, closed ring, outlet at the middle of the bottom edge.
    fn square_grid(n: usize) -> RasterGrid {
        let mut status = vec![NodeStatus::Closed; n * n];
        for r in 1..n - 1 {
            for c in 1..n - 1 {
                status[r * n + c] = NodeStatus::Core;
            }
        }
        status[(n - 1) * n + n / 2] = NodeStatus::FixedValue;
        RasterGrid::from_status(RasterHeader::new(n, n, 10.0), status).unwrap()
    }

    #[test]
    fn uniform_unmined_mask_returns_k_unmined_everywhere() {
        let grid = square_grid(12);
        let mask = MinedMask::uniform(grid.len(), MaskClass::Unmined);
        let synth = ErodibilitySynthesizer::new(&grid, &mask, 1e-5, vec![1e-3; 5], 9).unwrap();
        for year in [0, 3, 4] {
            for &k in &synth.field(year) {
                assert_relative_eq!(k, 1e-5, max_relative = 1e-10);
            }
        }
    }

    #[test]
    fn field_is_strictly_positive_and_bounded() {
        let grid = square_grid(16);
        let classes = (0..grid.len())
            .map(|i| if i % 16 < 8 { MaskClass::Mined } else { MaskClass::Unmined })
            .collect();
        let mask = MinedMask::from_classes(classes);
        let synth = ErodibilitySynthesizer::new(&grid, &mask, 1e-6, vec![1e-2, 1e-3], 5).unwrap();
        for year in 0..2 {
            for &k in &synth.field(year) {
                assert!(k > 0.0);
                assert!((1e-6 * (1.0 - 1e-9)..=1e-2 * (1.0 + 1e-9)).contains(&k), "{k}");
            }
        }
    }

    #[test]
    fn smoothing_softens_mine_boundary() {
        let grid = square_grid(20);
        let classes = (0..grid.len())
            .map(|i| if i % 20 < 10 { MaskClass::Mined } else { MaskClass::Unmined })
            .collect();
        let mask = MinedMask::from_classes(classes);
        let synth = ErodibilitySynthesizer::new(&grid, &mask, 1e-6, vec![1e-2], 9).unwrap();
        let field = synth.field(0);
        let row = 10 * 20;
        let jump_raw = (1e-2_f64.log10() - 1e-6_f64.log10()).abs();
        let jump = (field[row + 9].log10() - field[row + 10].log10()).abs();
        assert!(jump < jump_raw / 4.0, "boundary jump {jump} not smoothed");
        // Deep inside the mine, away from the fill, K moves toward the mined value.
        assert!(field[row + 5] > field[row + 14]);
    }

    #[test]
    fn closed_fill_is_log_midpoint() {
        let grid = square_grid(8);
        let classes = (0..grid.len())
            .map(|i| if i == 27 { MaskClass::Mined } else { MaskClass::Unmined })
            .collect();
        let mask = MinedMask::from_classes(classes);
        let synth = ErodibilitySynthesizer::new(&grid, &mask, 1e-6, vec![1e-2], 3).unwrap();
        assert_relative_eq!(synth.closed_fill(0), 1e-4, max_relative = 1e-12);
    }

    #[test]
    fn window_mean_of_constant_is_constant_with_same_fill() {
        let data = vec![2.5; 7 * 5];
        for v in window_mean(&data, 7, 5, 3, 2.5) {
            assert_relative_eq!(v, 2.5, max_relative = 1e-14);
        }
    }

    #[test]
    fn window_mean_uses_fill_outside_grid() {
        // 1×1 grid, 3×3 window: 1 real value, 8 padded.
        let v = window_mean(&[9.0], 1, 1, 3, 0.0);
        assert_relative_eq!(v[0], 1.0);
    }

    #[test]
    fn zero_or_even_window_and_nonpositive_k_are_rejected() {
        let grid = square_grid(6);
        let mask = MinedMask::uniform(grid.len(), MaskClass::Unmined);
        assert!(ErodibilitySynthesizer::new(&grid, &mask, 1e-5, vec![1e-4], 4).is_err());
        assert!(ErodibilitySynthesizer::new(&grid, &mask, 1e-5, vec![1e-4], 0).is_err());
        assert!(ErodibilitySynthesizer::new(&grid, &mask, 0.0, vec![1e-4], 3).is_err());
    }

    #[test]
    fn schedule_computes_each_year_once() {
        let grid = square_grid(6);
        let mask = MinedMask::uniform(grid.len(), MaskClass::Mined);
        let synth = ErodibilitySynthesizer::new(&grid, &mask, 1e-5, vec![1e-3, 5e-4, 2e-4], 3).unwrap();
        let mut schedule = RecoverySchedule::new(synth);
        for step in 0..6 {
            let year = step / 2;
            schedule.field(year);
        }
        assert_eq!(schedule.fields_computed(), 3);
        let last = schedule.final_field();
        assert_eq!(schedule.fields_computed(), 3);
        assert_eq!(last.len(), grid.len());
    }

    #[test]
    fn mask_shape_mismatch_is_rejected() {
        let grid = square_grid(6);
        let raster = Raster::new(RasterHeader::new(5, 6, 10.0), vec![0.0; 30]).unwrap();
        assert!(matches!(
            MinedMask::from_raster(&raster, -9999.0, &grid),
            Err(ConfigError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn plan_switches_to_final_field_for_long_run() {
        let grid = square_grid(10);
        let mask = MinedMask::uniform(grid.len(), MaskClass::Mined);
        let synth = ErodibilitySynthesizer::new(&grid, &mask, 1e-5, vec![1e-3, 1e-4], 3).unwrap();
        let mut plan = ErodibilityPlan::Scheduled(RecoverySchedule::new(synth));
        let mut out = vec![0.0; grid.len()];
        plan.fill_recovery(0, &mut out);
        assert_relative_eq!(out[55], 1e-3, max_relative = 1e-10);
        plan.fill_long_run(&mut out);
        assert_relative_eq!(out[55], 1e-4, max_relative = 1e-10);

        let mut uniform = ErodibilityPlan::Uniform(2e-5);
        uniform.fill_recovery(7, &mut out);
        assert!(out.iter().all(|&k| k == 2e-5));
    }
}
