//! Raster model grid and the per-cell landscape state.
//!
//! `RasterGrid` owns topology only: shape, cell size, node status and the
//! outlet. `LandscapeState` owns one `Vec<f64>` per physical field, all
//! row-major over the same grid. Elevations are `f64` throughout; the
//! per-step baselevel drop is far below `f32` resolution at hundreds of
//! metres.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Phase, SimError};
use crate::raster::{Raster, RasterHeader};

/// D8 neighbour offsets `(drow, dcol)`, clockwise from north.
pub const D8_OFFSETS: [(isize, isize); 8] = [
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
];

/// Distance to each D8 neighbour in cell widths.
pub const D8_DIST: [f64; 8] = [
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
];

/// Depth a core cell may sit below its bedrock before the run is failed, m.
pub const SOIL_TOLERANCE: f64 = 1e-6;
/// A core cell more than this many initial reliefs below the lowest
/// initial surface is treated as a numerical blow-up.
pub const INSTABILITY_RELIEF_MULTIPLE: f64 = 10.0;

/// Rook neighbours, used for links (diffusion, outlet adjacency).
pub const D4_OFFSETS: [(isize, isize); 4] = [(-1, 0), (0, 1), (1, 0), (0, -1)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Active interior cell; eroded, diffused, routed.
    Core,
    /// Open boundary with a prescribed elevation (the outlet).
    FixedValue,
    /// Inactive: no data, domain edge, or disconnected.
    Closed,
}

/// Whether a cell sits inside a filled depression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloodStatus {
    Unflooded,
    Flooded,
}

/// Grid topology with a fixed core/boundary partition and one outlet.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    header: RasterHeader,
    status: Vec<NodeStatus>,
    core: Vec<usize>,
    outlet: usize,
}

impl RasterGrid {
    /// Classify a DEM into core, closed and outlet cells.
    ///
    /// Cells equal to `nodata_value`, non-finite, or below `validity_floor`
    /// are closed, as are the four grid edges. The outlet is the lowest
    /// valid closed cell that shares an edge with a core cell. Core cells
    /// with no 8-connected path to the outlet are closed as well.
    pub fn load_and_classify(
        raster: &Raster,
        nodata_value: f64,
        validity_floor: f64,
    ) -> Result<Self, ConfigError> {
        let header = raster.header.clone();
        let (nrows, ncols) = (header.nrows, header.ncols);
        let z = &raster.data;

        let valid: Vec<bool> = z
            .iter()
            .map(|&v| v.is_finite() && v != nodata_value && v >= validity_floor)
            .collect();

        let mut status = vec![NodeStatus::Closed; z.len()];
        for r in 1..nrows.saturating_sub(1) {
            for c in 1..ncols.saturating_sub(1) {
                let i = r * ncols + c;
                if valid[i] {
                    status[i] = NodeStatus::Core;
                }
            }
        }
        if !status.contains(&NodeStatus::Core) {
            return Err(ConfigError::EmptyDomain);
        }

        let mut grid = Self {
            header,
            status,
            core: Vec::new(),
            outlet: 0,
        };

        let outlet = (0..z.len())
            .filter(|&i| valid[i] && grid.status[i] == NodeStatus::Closed)
            .filter(|&i| {
                grid.d4_neighbors(i)
                    .any(|n| grid.status[n] == NodeStatus::Core)
            })
            .min_by(|&a, &b| z[a].total_cmp(&z[b]).then(a.cmp(&b)))
            .ok_or(ConfigError::NoOutlet)?;

        grid.status[outlet] = NodeStatus::FixedValue;
        grid.outlet = outlet;

        let disconnected = grid.close_disconnected();
        if disconnected > 0 {
            tracing::warn!(
                cells = disconnected,
                "closed core cells with no path to the outlet"
            );
        }

        grid.core = grid.collect_core();
        if grid.core.is_empty() {
            return Err(ConfigError::EmptyDomain);
        }
        tracing::debug!(
            rows = nrows,
            cols = ncols,
            core = grid.core.len(),
            outlet,
            outlet_elevation = z[outlet],
            "classified grid"
        );
        Ok(grid)
    }

    /// Build a grid from an explicit status array. Exactly one node must be
    /// `FixedValue`; it becomes the outlet.
    pub fn from_status(header: RasterHeader, status: Vec<NodeStatus>) -> Result<Self, ConfigError> {
        if status.len() != header.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "node status".into(),
                expected_rows: header.nrows,
                expected_cols: header.ncols,
                rows: status.len() / header.ncols.max(1),
                cols: header.ncols,
            });
        }
        let fixed: Vec<usize> = status
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == NodeStatus::FixedValue)
            .map(|(i, _)| i)
            .collect();
        let outlet = match fixed.as_slice() {
            [o] => *o,
            _ => return Err(ConfigError::NoOutlet),
        };
        let mut grid = Self {
            header,
            status,
            core: Vec::new(),
            outlet,
        };
        grid.core = grid.collect_core();
        if grid.core.is_empty() {
            return Err(ConfigError::EmptyDomain);
        }
        Ok(grid)
    }

    fn collect_core(&self) -> Vec<usize> {
        (0..self.status.len())
            .filter(|&i| self.status[i] == NodeStatus::Core)
            .collect()
    }

    /// Breadth-first search from the outlet through non-closed cells.
    /// Returns how many core cells were closed.
    fn close_disconnected(&mut self) -> usize {
        let mut seen = vec![false; self.status.len()];
        let mut queue = VecDeque::from([self.outlet]);
        seen[self.outlet] = true;
        while let Some(i) = queue.pop_front() {
            for (n, _) in self.d8_neighbors(i) {
                if !seen[n] && self.status[n] == NodeStatus::Core {
                    seen[n] = true;
                    queue.push_back(n);
                }
            }
        }
        let mut closed = 0;
        for (i, s) in self.status.iter_mut().enumerate() {
            if *s == NodeStatus::Core && !seen[i] {
                *s = NodeStatus::Closed;
                closed += 1;
            }
        }
        closed
    }

    #[inline]
    pub fn header(&self) -> &RasterHeader {
        &self.header
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.header.nrows
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.header.ncols
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.status.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    #[inline]
    pub fn cell_size(&self) -> f64 {
        self.header.cell_size
    }

    #[inline]
    pub fn cell_area(&self) -> f64 {
        self.header.cell_size * self.header.cell_size
    }

    #[inline]
    pub fn status(&self, i: usize) -> NodeStatus {
        self.status[i]
    }

    #[inline]
    pub fn is_core(&self, i: usize) -> bool {
        self.status[i] == NodeStatus::Core
    }

    #[inline]
    pub fn is_closed(&self, i: usize) -> bool {
        self.status[i] == NodeStatus::Closed
    }

    /// Core node indices in ascending order.
    #[inline]
    pub fn core_nodes(&self) -> &[usize] {
        &self.core
    }

    #[inline]
    pub fn outlet(&self) -> usize {
        self.outlet
    }

    pub fn closed_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.status.len()).filter(move |&i| self.is_closed(i))
    }

    #[inline]
    pub fn row_col(&self, i: usize) -> (usize, usize) {
        (i / self.header.ncols, i % self.header.ncols)
    }

    /// In-bounds neighbour at offset `(dr, dc)`.
    #[inline]
    pub fn offset(&self, i: usize, dr: isize, dc: isize) -> Option<usize> {
        let (r, c) = self.row_col(i);
        let nr = r as isize + dr;
        let nc = c as isize + dc;
        if nr < 0 || nc < 0 || nr >= self.header.nrows as isize || nc >= self.header.ncols as isize {
            return None;
        }
        Some(nr as usize * self.header.ncols + nc as usize)
    }

    /// In-bounds D8 neighbours with their direction index `k` into
    /// `D8_OFFSETS`/`D8_DIST`.
    pub fn d8_neighbors(&self, i: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        D8_OFFSETS
            .iter()
            .enumerate()
            .filter_map(move |(k, &(dr, dc))| self.offset(i, dr, dc).map(|n| (n, k)))
    }

    pub fn d4_neighbors(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        D4_OFFSETS
            .iter()
            .filter_map(move |&(dr, dc)| self.offset(i, dr, dc))
    }
}

/// All per-cell fields of one scenario run.
#[derive(Debug, Clone)]
pub struct LandscapeState {
    pub grid: RasterGrid,
    pub elevation: Vec<f64>,
    pub bedrock_elevation: Vec<f64>,
    pub soil_depth: Vec<f64>,
    pub drainage_area: Vec<f64>,
    pub discharge: Vec<f64>,
    pub erodibility: Vec<f64>,
    pub steepest_slope: Vec<f64>,
    pub flood_status: Vec<FloodStatus>,
    /// Lowest elevation a core cell may reach, fixed from the initial DEM.
    pub stability_floor: f64,
}

impl LandscapeState {
    /// Initialise fields. Bedrock sits `initial_soil_depth` below the
    /// surface everywhere and is never modified afterwards.
    pub fn new(grid: RasterGrid, elevation: Vec<f64>, initial_soil_depth: f64) -> Result<Self, ConfigError> {
        if elevation.len() != grid.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "elevation".into(),
                expected_rows: grid.nrows(),
                expected_cols: grid.ncols(),
                rows: elevation.len() / grid.ncols().max(1),
                cols: grid.ncols(),
            });
        }
        if !initial_soil_depth.is_finite() || initial_soil_depth < 0.0 {
            return Err(ConfigError::Parameter {
                name: "initial_soil_depth",
                value: initial_soil_depth,
                message: "must be finite and non-negative".into(),
            });
        }
        let n = grid.len();
        let bedrock_elevation = elevation.iter().map(|z| z - initial_soil_depth).collect();
        let (lo, hi) = (0..n)
            .filter(|&i| !grid.is_closed(i))
            .map(|i| elevation[i])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), z| (lo.min(z), hi.max(z)));
        let stability_floor = lo - INSTABILITY_RELIEF_MULTIPLE * (hi - lo).max(1.0);
        Ok(Self {
            grid,
            elevation,
            bedrock_elevation,
            soil_depth: vec![initial_soil_depth; n],
            drainage_area: vec![0.0; n],
            discharge: vec![0.0; n],
            erodibility: vec![0.0; n],
            steepest_slope: vec![0.0; n],
            flood_status: vec![FloodStatus::Unflooded; n],
            stability_floor,
        })
    }

    /// `soil_depth = elevation - bedrock_elevation` on every cell.
    pub fn reconcile_soil_depth(&mut self) {
        for ((h, &z), &br) in self
            .soil_depth
            .iter_mut()
            .zip(&self.elevation)
            .zip(&self.bedrock_elevation)
        {
            *h = z - br;
        }
    }

    /// Largest `|elevation - (bedrock + soil)|` over all cells.
    pub fn soil_invariant_error(&self) -> f64 {
        self.elevation
            .iter()
            .zip(&self.bedrock_elevation)
            .zip(&self.soil_depth)
            .map(|((z, br), h)| (z - (br + h)).abs())
            .fold(0.0, f64::max)
    }

    /// First non-closed node whose elevation is not finite.
    pub fn first_non_finite(&self) -> Option<(usize, f64)> {
        self.elevation
            .iter()
            .enumerate()
            .find(|&(i, z)| !z.is_finite() && !self.grid.is_closed(i))
            .map(|(i, &z)| (i, z))
    }

    /// Fail with `NumericalInstability` when a non-closed elevation is not
    /// finite, a core cell has been cut into bedrock, or a core cell has
    /// fallen below `stability_floor`.
    pub fn check_stability(&self, scenario: &str, phase: Phase, step: usize) -> Result<(), SimError> {
        let unstable = self
            .first_non_finite()
            .map(|(node, value)| (node, "elevation", value))
            .or_else(|| {
                self.grid
                    .core_nodes()
                    .iter()
                    .find(|&&i| self.soil_depth[i] < -SOIL_TOLERANCE)
                    .map(|&i| (i, "soil depth", self.soil_depth[i]))
            })
            .or_else(|| {
                self.grid
                    .core_nodes()
                    .iter()
                    .find(|&&i| self.elevation[i] < self.stability_floor)
                    .map(|&i| (i, "elevation", self.elevation[i]))
            });
        match unstable {
            Some((node, quantity, value)) => Err(SimError::NumericalInstability {
                scenario: scenario.to_string(),
                phase,
                step,
                node,
                quantity,
                value,
            }),
            None => Ok(()),
        }
    }

    /// Sum of elevations over core cells.
    pub fn core_elevation_sum(&self) -> f64 {
        self.grid.core_nodes().iter().map(|&i| self.elevation[i]).sum()
    }

    /// Export a field on this grid; closed cells get the header's nodata.
    pub fn to_raster(&self, field: &[f64]) -> Raster {
        let header = self.grid.header().clone();
        let nodata = header.nodata.unwrap_or(-9999.0);
        let data = field
            .iter()
            .enumerate()
            .map(|(i, &v)| if self.grid.is_closed(i) { nodata } else { v })
            .collect();
        Raster { header, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dem(rows: &[&[f64]]) -> Raster {
        let nrows = rows.len();
        let ncols = rows[0].len();
        let mut header = RasterHeader::new(nrows, ncols, 10.0);
        header.nodata = Some(-99999.0);
        Raster::new(header, rows.iter().flat_map(|r| r.iter().copied()).collect()).unwrap()
    }

    #[test]
    fn edges_are_closed_and_lowest_edge_cell_is_outlet() {
        let r = dem(&[
            &[50.0, 50.0, 50.0, 50.0],
            &[50.0, 20.0, 21.0, 50.0],
            &[50.0, 19.0, 22.0, 50.0],
            &[50.0, 10.0, 50.0, 50.0],
        ]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        assert_eq!(grid.outlet(), 13);
        assert_eq!(grid.status(13), NodeStatus::FixedValue);
        assert_eq!(grid.core_nodes(), &[5, 6, 9, 10]);
        assert!(grid.is_closed(0));
        assert!(grid.is_closed(15));
    }

    #[test]
    fn nodata_and_below_floor_cells_are_closed() {
        let r = dem(&[
            &[50.0, 50.0, 50.0, 50.0, 50.0],
            &[50.0, 20.0, -99999.0, 0.5, 50.0],
            &[50.0, 19.0, 22.0, 23.0, 50.0],
            &[50.0, 10.0, 50.0, 50.0, 50.0],
        ]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        assert!(grid.is_closed(7));
        assert!(grid.is_closed(8));
        assert!(grid.is_core(6));
    }

    #[test]
    fn outlet_must_touch_a_core_cell() {
        // Only the corner has valid data next to the core cell diagonally.
        let r = dem(&[
            &[5.0, -99999.0, -99999.0],
            &[-99999.0, 20.0, -99999.0],
            &[-99999.0, -99999.0, -99999.0],
        ]);
        let err = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap_err();
        assert!(matches!(err, ConfigError::NoOutlet), "{err}");
    }

    #[test]
    fn all_nodata_is_an_empty_domain() {
        let r = dem(&[&[-99999.0; 3], &[-99999.0; 3], &[-99999.0; 3]]);
        assert!(matches!(
            RasterGrid::load_and_classify(&r, -99999.0, 1.0),
            Err(ConfigError::EmptyDomain)
        ));
    }

    #[test]
    fn isolated_core_island_is_closed() {
        let r = dem(&[
            &[50.0, 50.0, 50.0, 50.0, 50.0, 50.0],
            &[50.0, 20.0, -99999.0, -99999.0, 30.0, 50.0],
            &[50.0, 19.0, -99999.0, -99999.0, -99999.0, 50.0],
            &[50.0, 10.0, 50.0, 50.0, 50.0, 50.0],
        ]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        // (1,4) only touches closed edge cells, which do not conduct flow.
        assert!(grid.is_closed(10));
        assert_eq!(grid.core_nodes(), &[7, 13]);
    }

    #[test]
    fn soil_depth_reconciles_against_fixed_bedrock() {
        let r = dem(&[&[50.0, 50.0, 50.0], &[50.0, 20.0, 50.0], &[50.0, 10.0, 50.0]]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        let mut state = LandscapeState::new(grid, r.data.clone(), 500.0).unwrap();
        assert_eq!(state.bedrock_elevation[4], -480.0);
        state.elevation[4] -= 1.5;
        state.reconcile_soil_depth();
        assert_eq!(state.soil_depth[4], 498.5);
        assert_eq!(state.bedrock_elevation[4], -480.0);
        assert!(state.soil_invariant_error() < 1e-12);
    }

    #[test]
    fn to_raster_masks_closed_cells() {
        let r = dem(&[&[50.0, 50.0, 50.0], &[50.0, 20.0, 50.0], &[50.0, 10.0, 50.0]]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        let state = LandscapeState::new(grid, r.data.clone(), 500.0).unwrap();
        let out = state.to_raster(&state.elevation);
        assert_eq!(out.data[0], -99999.0);
        assert_eq!(out.data[4], 20.0);
        assert_eq!(out.data[7], 10.0);
    }

    #[test]
    fn non_finite_core_elevation_is_reported_with_context() {
        let r = dem(&[&[50.0, 50.0, 50.0], &[50.0, 20.0, 50.0], &[50.0, 10.0, 50.0]]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        let mut state = LandscapeState::new(grid, r.data.clone(), 500.0).unwrap();
        state.check_stability("scenario_1", Phase::Recovery, 3).unwrap();
        state.elevation[0] = f64::NAN;
        state.check_stability("scenario_1", Phase::Recovery, 3).unwrap();
        state.elevation[4] = f64::INFINITY;
        let err = state.check_stability("scenario_1", Phase::LongRun, 17).unwrap_err();
        assert!(matches!(
            err,
            SimError::NumericalInstability { node: 4, step: 17, phase: Phase::LongRun, .. }
        ));
    }

    #[test]
    fn core_cell_cut_into_bedrock_is_unstable() {
        let r = dem(&[&[50.0, 50.0, 50.0], &[50.0, 20.0, 50.0], &[50.0, 10.0, 50.0]]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        let mut state = LandscapeState::new(grid, r.data.clone(), 5.0).unwrap();
        state.elevation[4] = 15.0 - SOIL_TOLERANCE / 2.0;
        state.reconcile_soil_depth();
        state.check_stability("scenario_2", Phase::Recovery, 0).unwrap();

        state.elevation[4] = 14.0;
        state.reconcile_soil_depth();
        let err = state.check_stability("scenario_2", Phase::Recovery, 5).unwrap_err();
        match err {
            SimError::NumericalInstability {
                node, quantity, value, step, ..
            } => {
                assert_eq!((node, quantity, step), (4, "soil depth", 5));
                assert!((value + 1.0).abs() < 1e-12);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn core_cell_far_below_the_outlet_is_unstable() {
        let r = dem(&[&[50.0, 50.0, 50.0], &[50.0, 20.0, 50.0], &[50.0, 10.0, 50.0]]);
        let grid = RasterGrid::load_and_classify(&r, -99999.0, 1.0).unwrap();
        let mut state = LandscapeState::new(grid, r.data.clone(), 500.0).unwrap();
        // Lowest non-closed cell is the outlet at 10 m, relief 10 m.
        assert_eq!(state.stability_floor, 10.0 - INSTABILITY_RELIEF_MULTIPLE * 10.0);

        state.elevation[4] = -50.0;
        state.reconcile_soil_depth();
        state.check_stability("scenario_3", Phase::LongRun, 8).unwrap();

        state.elevation[4] = -200.0;
        state.reconcile_soil_depth();
        let err = state.check_stability("scenario_3", Phase::LongRun, 9).unwrap_err();
        assert!(matches!(
            err,
            SimError::NumericalInstability { node: 4, quantity: "elevation", step: 9, .. }
        ));
        // The outlet is not a core cell and is exempt.
        state.elevation[4] = 20.0;
        state.elevation[7] = -1000.0;
        state.reconcile_soil_depth();
        state.check_stability("scenario_3", Phase::LongRun, 10).unwrap();
    }
}
