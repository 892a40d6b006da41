//! SPACE-type sediment erosion and deposition (Shobe et al., 2017), with
//! the bedrock held fixed.
//!
//! Each step nodes are processed head-to-base along the flow stack:
//!   1. Entrainment `E_s = max(K q^m S^n − ω_c, 0) · (1 − e^{−H/H*})`,
//!      zero on flooded cells.
//!   2. Outgoing sediment flux
//!      `qs_out = (qs_in + (1 − F_f) E_s A) / (1 + v_s A / q)`; the fines
//!      fraction leaves as wash load.
//!   3. Deposition `D_s = v_s qs_out / q`.
//!   4. `ΔH = (D_s − E_s) dt / (1 − φ)`, bounded so no more soil is removed
//!      than is present.
//!
//! A base-to-head pass then keeps eroding nodes from being cut below their
//! receiver.
use crate::error::OperatorError;
use crate::grid::{FloodStatus, LandscapeState};
use crate::params::ModelParams;

use super::flow_routing::FlowField;
use super::Eroder;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceParams {
    pub m_sp: f64,
    pub n_sp: f64,
    /// Fraction of entrained sediment too fine to redeposit.
    pub fines_fraction: f64,
    pub porosity: f64,
    /// Soil depth scale for entrainment, m.
    pub h_star: f64,
    /// Effective settling velocity, m/yr.
    pub v_s: f64,
    /// Entrainment threshold, m/yr.
    pub sp_crit_sed: f64,
}

impl From<&ModelParams> for SpaceParams {
    fn from(p: &ModelParams) -> Self {
        Self {
            m_sp: p.m_sp,
            n_sp: p.n_sp,
            fines_fraction: p.fines_fraction,
            porosity: p.porosity,
            h_star: p.h_star,
            v_s: p.v_s,
            sp_crit_sed: p.sp_crit_sed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpaceEroder {
    params: SpaceParams,
    qs_in: Vec<f64>,
    pre: Vec<f64>,
}

impl SpaceEroder {
    pub fn new(params: SpaceParams) -> Self {
        Self {
            params,
            qs_in: Vec::new(),
            pre: Vec::new(),
        }
    }

    /// Entrainment rate for one node, m/yr.
    fn entrainment(&self, k: f64, q: f64, slope: f64, soil: f64) -> f64 {
        let p = &self.params;
        let omega = k * q.powf(p.m_sp) * slope.powf(p.n_sp);
        (omega - p.sp_crit_sed).max(0.0) * (1.0 - (-soil.max(0.0) / p.h_star).exp())
    }
}

impl Eroder for SpaceEroder {
    fn run_one_step(
        &mut self,
        state: &mut LandscapeState,
        flow: &FlowField,
        dt: f64,
    ) -> Result<f64, OperatorError> {
        const NAME: &str = "space eroder";
        let LandscapeState {
            grid,
            elevation,
            soil_depth,
            discharge,
            erodibility,
            flood_status,
            ..
        } = state;
        let n = grid.len();
        for (what, len) in [
            ("erodibility", erodibility.len()),
            ("discharge", discharge.len()),
            ("receivers", flow.receivers.len()),
        ] {
            if len != n {
                return Err(OperatorError::FieldLength {
                    operator: NAME,
                    what,
                    expected: n,
                    actual: len,
                });
            }
        }

        let area = grid.cell_area();
        let p = self.params;
        self.qs_in.clear();
        self.qs_in.resize(n, 0.0);
        self.pre.clear();
        self.pre.extend_from_slice(elevation);

        // ── Head-to-base sweep ───────────────────────────────────────────────
        for &i in flow.stack.iter().rev() {
            if !grid.is_core(i) {
                continue;
            }
            let q = discharge[i];
            let es = if flood_status[i] == FloodStatus::Flooded {
                0.0
            } else {
                self.entrainment(erodibility[i], q, flow.steepest_slope[i], soil_depth[i])
            };

            let (qs_out, ds) = if q > 0.0 {
                let qs_out = (self.qs_in[i] + (1.0 - p.fines_fraction) * es * area)
                    / (1.0 + p.v_s * area / q);
                (qs_out, p.v_s * qs_out / q)
            } else {
                // No flow to carry it: everything arriving settles here.
                (0.0, self.qs_in[i] / area)
            };
            if !qs_out.is_finite() {
                return Err(OperatorError::NonFinite {
                    operator: NAME,
                    quantity: "sediment flux",
                    node: i,
                    value: qs_out,
                });
            }

            let dh = ((ds - es) * dt / (1.0 - p.porosity)).max(-soil_depth[i].max(0.0));
            elevation[i] += dh;
            soil_depth[i] += dh;
            self.qs_in[flow.receivers[i]] += qs_out;
        }

        // ── Receiver clamp ───────────────────────────────────────────────────
        for &i in &flow.stack {
            let r = flow.receivers[i];
            if r == i || !grid.is_core(i) {
                continue;
            }
            if elevation[i] < self.pre[i] {
                let floor = elevation[r].min(self.pre[i]);
                if elevation[i] < floor {
                    soil_depth[i] += floor - elevation[i];
                    elevation[i] = floor;
                }
            }
        }

        Ok(self.qs_in[grid.outlet()])
    }
}
