//! Geomorphic operators applied once per time step:
//! flow routing → depression handling → erosion/deposition → hillslope
//! diffusion.
//!
//! Each operator sits behind a trait so the stepper can be driven by other
//! kernels (or by test doubles). `GeomorphicOperators::from_params` wires
//! up the default D8 priority-flood router, the SPACE-type eroder and the
//! explicit linear diffuser.
pub mod depressions;
pub mod diffusion;
pub mod flow_routing;
pub mod space;

use crate::error::{OperatorError, RoutingError};
use crate::grid::{LandscapeState, RasterGrid};
use crate::params::ModelParams;

pub use depressions::{priority_flood, resolve_depressions, FilledSurface};
pub use diffusion::LinearDiffuser;
pub use flow_routing::{compute_d8_flow, FlowField};
pub use space::{SpaceEroder, SpaceParams};

/// Routes flow over the current topography.
///
/// Contract: single flow direction (D8), deterministic for a given surface,
/// every core node drains to the outlet through the returned receivers.
pub trait FlowRouter: Send {
    fn route(&mut self, grid: &RasterGrid, elevation: &[f64]) -> Result<FlowField, RoutingError>;
}

/// Erosion/deposition over `dt` years.
///
/// Contract: only core nodes change; flooded nodes are not eroded; returns
/// the sediment volume per year leaving through the outlet.
pub trait Eroder: Send {
    fn run_one_step(
        &mut self,
        state: &mut LandscapeState,
        flow: &FlowField,
        dt: f64,
    ) -> Result<f64, OperatorError>;
}

/// Hillslope diffusion over `dt` years.
///
/// Contract: only core nodes change; stable for any `dt`.
pub trait Diffuser: Send {
    fn run_one_step(
        &mut self,
        grid: &RasterGrid,
        elevation: &mut [f64],
        dt: f64,
    ) -> Result<(), OperatorError>;
}

/// Priority-flood filling followed by D8 steepest descent.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityFloodRouter;

impl FlowRouter for PriorityFloodRouter {
    fn route(&mut self, grid: &RasterGrid, elevation: &[f64]) -> Result<FlowField, RoutingError> {
        compute_d8_flow(grid, elevation)
    }
}

/// The set of operators one scenario run uses.
pub struct GeomorphicOperators {
    pub router: Box<dyn FlowRouter>,
    pub eroder: Box<dyn Eroder>,
    pub diffuser: Box<dyn Diffuser>,
}

impl GeomorphicOperators {
    pub fn new(
        router: Box<dyn FlowRouter>,
        eroder: Box<dyn Eroder>,
        diffuser: Box<dyn Diffuser>,
    ) -> Self {
        Self {
            router,
            eroder,
            diffuser,
        }
    }

    /// Default kernels parameterized from `params`.
    pub fn from_params(params: &ModelParams) -> Self {
        Self::new(
            Box::new(PriorityFloodRouter),
            Box::new(SpaceEroder::new(SpaceParams::from(params))),
            Box::new(LinearDiffuser::new(params.diffusivity)),
        )
    }
}

impl std::fmt::Debug for GeomorphicOperators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeomorphicOperators").finish_non_exhaustive()
    }
}
