//! Landscape evolution of mountaintop-removal-mined watersheds.
//!
//! A watershed DEM is eroded for thousands of years under a two-phase
//! schedule: a recovery phase in which the erodibility of mined ground
//! relaxes year by year toward unmined values, then a long run with the
//! recovered field held fixed. Each run yields the final topography,
//! drainage area, slope and the sediment flux series.
pub mod driver;
pub mod erodibility;
pub mod error;
pub mod forcing;
pub mod grid;
pub mod hydraulic;
pub mod output;
pub mod params;
pub mod raster;
pub mod scenario;
pub mod stepper;
pub mod synthetic;
pub mod tables;

pub use driver::{run_batch, run_scenario, BatchReport, RunConfig, WatershedInputs, WatershedPaths};
pub use error::{ConfigError, MtrError, MtrResult, OperatorError, Phase, RoutingError, SimError};
pub use grid::{LandscapeState, RasterGrid};
pub use params::ModelParams;
pub use raster::{Raster, RasterHeader};
pub use scenario::{Scenario, ScenarioPreset};
pub use stepper::{CancelToken, SimulationOutcome, TimeStepper};
