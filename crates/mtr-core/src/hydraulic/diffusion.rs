//! Linear hillslope diffusion, `∂z/∂t = D ∇²z`, explicit on rook links.
//!
//! Links to closed cells carry no flux; the outlet takes flux but keeps its
//! elevation. Explicit stepping is only stable for `dt < dx² / (4D)`, so a
//! step longer than `cfl_safety · dx² / D` is split into equal substeps.
use crate::error::OperatorError;
use crate::grid::RasterGrid;

use super::Diffuser;

const DEFAULT_CFL_SAFETY: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct LinearDiffuser {
    /// m²/yr.
    diffusivity: f64,
    cfl_safety: f64,
    delta: Vec<f64>,
}

impl LinearDiffuser {
    pub fn new(diffusivity: f64) -> Self {
        Self {
            diffusivity,
            cfl_safety: DEFAULT_CFL_SAFETY,
            delta: Vec::new(),
        }
    }

    /// Longest stable explicit step for this grid.
    pub fn stable_dt(&self, cell_size: f64) -> f64 {
        if self.diffusivity <= 0.0 {
            return f64::INFINITY;
        }
        self.cfl_safety * cell_size * cell_size / self.diffusivity
    }

    pub fn required_substeps(&self, cell_size: f64, dt: f64) -> usize {
        let stable = self.stable_dt(cell_size);
        if !stable.is_finite() {
            return 1;
        }
        ((dt / stable).ceil() as usize).max(1)
    }

    fn substep(&mut self, grid: &RasterGrid, z: &mut [f64], dt: f64) {
        let coeff = self.diffusivity * dt / (grid.cell_size() * grid.cell_size());
        for &i in grid.core_nodes() {
            let mut lap = 0.0;
            for nb in grid.d4_neighbors(i) {
                if !grid.is_closed(nb) {
                    lap += z[nb] - z[i];
                }
            }
            self.delta[i] = coeff * lap;
        }
        for &i in grid.core_nodes() {
            z[i] += self.delta[i];
        }
    }
}

impl Diffuser for LinearDiffuser {
    fn run_one_step(&mut self, grid: &RasterGrid, elevation: &mut [f64], dt: f64) -> Result<(), OperatorError> {
        const NAME: &str = "linear diffuser";
        if elevation.len() != grid.len() {
            return Err(OperatorError::FieldLength {
                operator: NAME,
                what: "elevation",
                expected: grid.len(),
                actual: elevation.len(),
            });
        }
        if self.diffusivity == 0.0 || dt <= 0.0 {
            return Ok(());
        }

        self.delta.clear();
        self.delta.resize(grid.len(), 0.0);
        let n_sub = self.required_substeps(grid.cell_size(), dt);
        let sub_dt = dt / n_sub as f64;
        if n_sub > 1 {
            tracing::trace!(n_sub, sub_dt, "diffusion substepping");
        }
        for _ in 0..n_sub {
            self.substep(grid, elevation, sub_dt);
        }

        if let Some(&i) = grid.core_nodes().iter().find(|&&i| !elevation[i].is_finite()) {
            return Err(OperatorError::NonFinite {
                operator: NAME,
                quantity: "elevation",
                node: i,
                value: elevation[i],
            });
        }
        Ok(())
    }
}
