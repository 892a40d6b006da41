//! D8 flow direction and accumulation on the depression-free surface.
//!
//! Steps:
//!   1. Priority-flood fill from the outlet.
//!   2. Each core cell drains to its steepest-descent D8 neighbour on the
//!      filled surface; on flats it drains to its flood parent.
//!   3. Order nodes base-to-head (the stack) by walking donors from the
//!      outlet.
//!   4. Accumulate drainage area head-to-base.
//!   5. Steepest slope toward the receiver on the actual surface.
use crate::error::RoutingError;
use crate::grid::{RasterGrid, D8_DIST};

use super::depressions::priority_flood;

#[derive(Debug, Clone)]
pub struct FlowField {
    /// Receiver of each node; a node that does not drain anywhere (the
    /// outlet, closed cells) is its own receiver.
    pub receivers: Vec<usize>,
    /// Distance to the receiver in metres (0 for self-receivers).
    pub receiver_distance: Vec<f64>,
    /// Outlet first, then every core node after its receiver.
    pub stack: Vec<usize>,
    /// Upstream area in m², including the cell itself.
    pub drainage_area: Vec<f64>,
    /// Downhill gradient toward the receiver, never negative.
    pub steepest_slope: Vec<f64>,
    pub depression_free_elevation: Vec<f64>,
}

impl FlowField {
    /// Receiver of `i`, or `None` for base and closed nodes.
    #[inline]
    pub fn receiver(&self, i: usize) -> Option<usize> {
        let r = self.receivers[i];
        (r != i).then_some(r)
    }
}

pub fn compute_d8_flow(grid: &RasterGrid, elevation: &[f64]) -> Result<FlowField, RoutingError> {
    let n = grid.len();
    let dx = grid.cell_size();
    let filled = priority_flood(grid, elevation)?;
    let f = &filled.elevation;

    // ── Receivers ────────────────────────────────────────────────────────────
    let mut receivers: Vec<usize> = (0..n).collect();
    let mut receiver_distance = vec![0.0; n];
    for &i in grid.core_nodes() {
        let mut best_drop = 0.0;
        let mut best: Option<(usize, f64)> = None;
        for (nb, k) in grid.d8_neighbors(i) {
            if grid.is_closed(nb) {
                continue;
            }
            let dist = dx * D8_DIST[k];
            let drop = (f[i] - f[nb]) / dist;
            if drop > best_drop {
                best_drop = drop;
                best = Some((nb, dist));
            }
        }
        let (recv, dist) = match best {
            Some(b) => b,
            None => {
                // Flat: follow the flood tree back toward the outlet.
                let p = filled.flood_parent[i].ok_or(RoutingError::Unreachable { unreached: 1 })?;
                (p, link_length(grid, i, p))
            }
        };
        receivers[i] = recv;
        receiver_distance[i] = dist;
    }

    // ── Stack ────────────────────────────────────────────────────────────────
    let mut donors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &i in grid.core_nodes() {
        donors[receivers[i]].push(i);
    }
    let mut stack = Vec::with_capacity(grid.core_nodes().len() + 1);
    stack.push(grid.outlet());
    let mut head = 0;
    while head < stack.len() {
        let node = stack[head];
        stack.extend_from_slice(&donors[node]);
        head += 1;
    }
    let expected = grid.core_nodes().len() + 1;
    if stack.len() != expected {
        return Err(RoutingError::Unreachable {
            unreached: expected.saturating_sub(stack.len()),
        });
    }

    // ── Accumulation ─────────────────────────────────────────────────────────
    let cell_area = grid.cell_area();
    let mut drainage_area = vec![0.0; n];
    for &i in grid.core_nodes() {
        drainage_area[i] = cell_area;
    }
    for &i in stack.iter().rev() {
        let r = receivers[i];
        if r != i {
            drainage_area[r] += drainage_area[i];
        }
    }

    // ── Slope ────────────────────────────────────────────────────────────────
    let mut steepest_slope = vec![0.0; n];
    for &i in grid.core_nodes() {
        let r = receivers[i];
        steepest_slope[i] = ((elevation[i] - elevation[r]) / receiver_distance[i]).max(0.0);
    }

    Ok(FlowField {
        receivers,
        receiver_distance,
        stack,
        drainage_area,
        steepest_slope,
        depression_free_elevation: filled.elevation,
    })
}

/// Centre-to-centre distance between two D8 neighbours, in metres.
fn link_length(grid: &RasterGrid, a: usize, b: usize) -> f64 {
    let (ra, ca) = grid.row_col(a);
    let (rb, cb) = grid.row_col(b);
    if ra != rb && ca != cb {
        grid.cell_size() * std::f64::consts::SQRT_2
    } else {
        grid.cell_size()
    }
}
