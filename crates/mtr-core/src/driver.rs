//! Scenario driver: loads one watershed's inputs once, then runs any number
//! of scenarios against them.
//!
//! Steps per scenario:
//!   1. Build the forcing timeline for the scenario's table column.
//!   2. Choose the erodibility plan for its preset.
//!   3. Initialise the landscape state from the DEM.
//!   4. Step through both phases.
//!   5. Write rasters, flux series and manifest.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "threading")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::erodibility::MinedMask;
use crate::error::{ConfigError, MtrError, MtrResult};
use crate::forcing::ForcingTimeline;
use crate::grid::{LandscapeState, RasterGrid};
use crate::hydraulic::GeomorphicOperators;
use crate::output::{write_outputs, OutputSet};
use crate::params::ModelParams;
use crate::raster::Raster;
use crate::scenario::Scenario;
use crate::stepper::{CancelToken, SimulationOutcome, TimeStepper};
use crate::tables::{read_climate_record, ScenarioTable};

fn default_skip_columns() -> usize {
    2
}

/// Input and output locations for one watershed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatershedPaths {
    pub dem: PathBuf,
    /// Mined-area mask; only the unmined control may omit it.
    #[serde(default)]
    pub mask: Option<PathBuf>,
    pub erodibility_table: PathBuf,
    pub climate: PathBuf,
    /// Data row of this watershed in the climate CSV.
    #[serde(default)]
    pub climate_row: usize,
    /// Leading label columns in the climate CSV.
    #[serde(default = "default_skip_columns")]
    pub climate_skip_columns: usize,
    pub output_dir: PathBuf,
}

impl WatershedPaths {
    /// Interpret relative paths against `base`.
    pub fn resolve_against(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.dem);
        if let Some(m) = self.mask.as_mut() {
            fix(m);
        }
        fix(&mut self.erodibility_table);
        fix(&mut self.climate);
        fix(&mut self.output_dir);
    }
}

/// A complete run description, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub watershed: WatershedPaths,
    #[serde(default)]
    pub params: ModelParams,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
}

impl RunConfig {
    /// Read a config file; relative paths are taken from its directory.
    pub fn read(path: &Path) -> MtrResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| MtrError::io(path, e))?;
        let mut config: RunConfig = serde_json::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.watershed.resolve_against(base);
        }
        Ok(config)
    }
}

/// Everything loaded from disk for one watershed, shared by its scenarios.
#[derive(Debug, Clone)]
pub struct WatershedInputs {
    pub dem: Raster,
    pub grid: RasterGrid,
    pub mask: Option<MinedMask>,
    pub table: ScenarioTable,
    /// Annual totals in mm.
    pub climate_mm: Vec<f64>,
}

impl WatershedInputs {
    pub fn load(paths: &WatershedPaths, params: &ModelParams) -> MtrResult<Self> {
        let dem = Raster::read(&paths.dem)?;
        let grid = RasterGrid::load_and_classify(&dem, params.dem_nodata, params.validity_floor)?;
        let mask = match &paths.mask {
            Some(p) => Some(MinedMask::from_raster(&Raster::read(p)?, params.mask_nodata, &grid)?),
            None => None,
        };
        let table = ScenarioTable::read(&paths.erodibility_table)?;
        let climate_mm = read_climate_record(&paths.climate, paths.climate_row, paths.climate_skip_columns)?;
        tracing::info!(
            dem = %paths.dem.display(),
            core_cells = grid.core_nodes().len(),
            mined_cells = mask.as_ref().map_or(0, MinedMask::mined_count),
            scenarios = table.n_scenarios(),
            climate_years = climate_mm.len(),
            "watershed loaded"
        );
        Ok(Self {
            dem,
            grid,
            mask,
            table,
            climate_mm,
        })
    }

    /// Build the initial state and stepper for `scenario`.
    pub fn prepare(
        &self,
        scenario: Scenario,
        params: &ModelParams,
    ) -> MtrResult<(TimeStepper, LandscapeState)> {
        params.validate()?;
        let forcing = ForcingTimeline::build(
            &self.climate_mm,
            &self.table,
            scenario.id,
            params.v_s,
            params.recovery_years(),
        )?;
        let plan = scenario.erodibility_plan(&self.grid, self.mask.as_ref(), &forcing, params.window_size)?;
        let state = LandscapeState::new(self.grid.clone(), self.dem.data.clone(), params.initial_soil_depth)?;
        let operators = GeomorphicOperators::from_params(params);
        let stepper = TimeStepper::new(scenario.label(), params.clone(), forcing, plan, operators)?;
        Ok((stepper, state))
    }

    /// Run `scenario` to completion without writing anything.
    pub fn simulate(
        &self,
        scenario: Scenario,
        params: &ModelParams,
        cancel: &CancelToken,
    ) -> MtrResult<SimulationOutcome> {
        let (stepper, state) = self.prepare(scenario, params)?;
        Ok(stepper.with_cancel(cancel.clone()).run(state)?)
    }
}

/// Simulate `scenario` and write its outputs under `output_dir`.
pub fn run_scenario(
    inputs: &WatershedInputs,
    scenario: Scenario,
    params: &ModelParams,
    output_dir: &Path,
    cancel: &CancelToken,
) -> MtrResult<Vec<PathBuf>> {
    let outcome = inputs.simulate(scenario, params, cancel)?;
    let set = OutputSet::new(output_dir, scenario.prefix());
    write_outputs(&set, &inputs.dem.header, &scenario.label(), params, &outcome)
}

/// Outcome of a batch: which scenarios finished and which failed.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub completed: Vec<(Scenario, Vec<PathBuf>)>,
    pub failed: Vec<(Scenario, MtrError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Run independent scenarios, in parallel with the `threading` feature.
/// A failing scenario does not stop its siblings. Repeats of a label
/// already in the batch fail without running, so no two runs share files.
pub fn run_batch(
    inputs: &WatershedInputs,
    scenarios: &[Scenario],
    params: &ModelParams,
    output_dir: &Path,
    cancel: &CancelToken,
) -> BatchReport {
    let mut report = BatchReport::default();
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(scenarios.len());
    for &s in scenarios {
        if seen.insert(s.label()) {
            unique.push(s);
        } else {
            let e = MtrError::from(ConfigError::DuplicateScenario { label: s.label() });
            tracing::error!(scenario = %s, error = %e, "scenario rejected");
            report.failed.push((s, e));
        }
    }

    let run_one = |&s: &Scenario| (s, run_scenario(inputs, s, params, output_dir, cancel));

    #[cfg(feature = "threading")]
    let results: Vec<_> = unique.par_iter().map(run_one).collect();
    #[cfg(not(feature = "threading"))]
    let results: Vec<_> = unique.iter().map(run_one).collect();

    for (scenario, result) in results {
        match result {
            Ok(files) => report.completed.push((scenario, files)),
            Err(e) => {
                tracing::error!(scenario = %scenario, error = %e, "scenario failed");
                report.failed.push((scenario, e));
            }
        }
    }
    report
}
