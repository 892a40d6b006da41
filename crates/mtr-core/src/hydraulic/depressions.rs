//! Priority-flood depression filling.
//!
//! Floods inward from the outlet in order of (filled) elevation. A cell
//! reached from a higher neighbour is raised to that neighbour's level, so
//! every reached cell has a non-ascending path to the outlet. The flood
//! parent of each cell is kept to route across flats.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;

use super::flow_routing::FlowField;
use crate::error::RoutingError;
use crate::grid::{FloodStatus, RasterGrid};

/// Depression-free surface plus the flood tree.
#[derive(Debug, Clone)]
pub struct FilledSurface {
    pub elevation: Vec<f64>,
    /// Neighbour each cell was flooded from; `None` for the outlet and
    /// closed cells.
    pub flood_parent: Vec<Option<usize>>,
}

/// Fill depressions on all non-closed cells, seeded at the outlet.
pub fn priority_flood(grid: &RasterGrid, elevation: &[f64]) -> Result<FilledSurface, RoutingError> {
    let n = grid.len();
    if let Some((node, &value)) = elevation
        .iter()
        .enumerate()
        .find(|&(i, z)| !z.is_finite() && !grid.is_closed(i))
    {
        return Err(RoutingError::NonFinite { node, value });
    }

    let mut filled = elevation.to_vec();
    let mut parent = vec![None; n];
    let mut processed = vec![false; n];
    // Insertion counter breaks ties first-in first-out, so flats are
    // crossed breadth-first from their spill point.
    let mut seq: u64 = 0;
    let mut queue: BinaryHeap<Reverse<(OrderedFloat<f64>, u64, usize)>> = BinaryHeap::new();

    let outlet = grid.outlet();
    processed[outlet] = true;
    queue.push(Reverse((OrderedFloat(filled[outlet]), seq, outlet)));

    while let Some(Reverse((OrderedFloat(level), _, cell))) = queue.pop() {
        for (nb, _) in grid.d8_neighbors(cell) {
            if processed[nb] || grid.is_closed(nb) {
                continue;
            }
            processed[nb] = true;
            filled[nb] = filled[nb].max(level);
            parent[nb] = Some(cell);
            seq += 1;
            queue.push(Reverse((OrderedFloat(filled[nb]), seq, nb)));
        }
    }

    let unreached = grid
        .core_nodes()
        .iter()
        .filter(|&&i| !processed[i])
        .count();
    if unreached > 0 {
        return Err(RoutingError::Unreachable { unreached });
    }

    Ok(FilledSurface {
        elevation: filled,
        flood_parent: parent,
    })
}

/// Mark cells whose depression-free elevation sits above the surface.
/// Only core cells are ever raised by filling, so only they can flood.
pub fn resolve_depressions(flow: &FlowField, elevation: &[f64]) -> Vec<FloodStatus> {
    flow.depression_free_elevation
        .iter()
        .zip(elevation)
        .map(|(&filled, &z)| {
            if filled > z {
                FloodStatus::Flooded
            } else {
                FloodStatus::Unflooded
            }
        })
        .collect()
}
