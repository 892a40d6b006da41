//! Two-phase time stepper.
//!
//! The run starts in `Recovery` with step `recovery_dt` and yearly
//! erodibility fields, switches to `LongRun` with step `fast_dt` and the
//! final recovery field once `recovery_period` is reached, and ends in
//! `Done` at `total_time`. Phase boundaries are counted in whole steps so
//! the flux series length never depends on floating-point accumulation.
//!
//! Per step:
//!   1. snapshot elevation;
//!   2. route flow, resolve depressions;
//!   3. discharge = drainage area × precipitation of the current year;
//!   4. erosion/deposition, then diffusion (soil depth reconciled after each);
//!   5. lower the outlet by `baselevel_lowering_rate · dt`;
//!   6. check for non-finite, cut-into-bedrock or runaway elevations;
//!   7. record `Σ_core(pre − post) / dt` next to the eroder's own outlet
//!      sediment flux, advance the timer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::erodibility::ErodibilityPlan;
use crate::error::{ConfigError, OperatorError, Phase, RoutingError, SimError};
use crate::forcing::ForcingTimeline;
use crate::grid::LandscapeState;
use crate::hydraulic::{resolve_depressions, GeomorphicOperators};
use crate::params::ModelParams;

/// Timer resolution; keeps `0.5 + 0.5 + …` landing on whole years.
const TIMER_DECIMALS: f64 = 1e6;
/// Slack when mapping elapsed time onto a year index.
const YEAR_EPS: f64 = 1e-9;

/// Year whose forcing applies at `timer` years elapsed.
///
/// Sub-annual steps share the year they start in: with `dt = 0.5`, steps at
/// 0.0 and 0.5 both use year 0.
pub fn year_index(timer: f64) -> usize {
    (timer + YEAR_EPS).floor().max(0.0) as usize
}

fn round_timer(t: f64) -> f64 {
    (t * TIMER_DECIMALS).round() / TIMER_DECIMALS
}

/// Cooperative cancellation flag, checked before every step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Final state of a completed run.
#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub state: LandscapeState,
    /// Net core volume change rate per step, m³/yr.
    pub sediment_flux: Vec<f64>,
    /// Sediment delivered to the outlet by the transport law per step, m³/yr.
    pub transport_flux: Vec<f64>,
    pub steps: usize,
}

pub struct TimeStepper {
    scenario: String,
    params: ModelParams,
    forcing: ForcingTimeline,
    erodibility: ErodibilityPlan,
    operators: GeomorphicOperators,
    cancel: CancelToken,
    phase: Phase,
    step: usize,
    timer: f64,
    flux: Vec<f64>,
    transport: Vec<f64>,
    snapshot: Vec<f64>,
    applied_year: Option<usize>,
}

impl TimeStepper {
    pub fn new(
        scenario: impl Into<String>,
        params: ModelParams,
        forcing: ForcingTimeline,
        erodibility: ErodibilityPlan,
        operators: GeomorphicOperators,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        let mut stepper = Self {
            scenario: scenario.into(),
            flux: Vec::with_capacity(params.expected_steps()),
            transport: Vec::with_capacity(params.expected_steps()),
            params,
            forcing,
            erodibility,
            operators,
            cancel: CancelToken::new(),
            phase: Phase::Recovery,
            step: 0,
            timer: 0.0,
            snapshot: Vec::new(),
            applied_year: None,
        };
        stepper.phase = stepper.phase_at(0);
        Ok(stepper)
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Simulated years elapsed.
    pub fn timer(&self) -> f64 {
        self.timer
    }

    pub fn sediment_flux(&self) -> &[f64] {
        &self.flux
    }

    pub fn transport_flux(&self) -> &[f64] {
        &self.transport
    }

    fn phase_at(&self, step: usize) -> Phase {
        if step < self.params.recovery_steps() {
            Phase::Recovery
        } else if step < self.params.expected_steps() {
            Phase::LongRun
        } else {
            Phase::Done
        }
    }

    fn dt(&self) -> f64 {
        match self.phase {
            Phase::Recovery => self.params.recovery_dt,
            _ => self.params.fast_dt,
        }
    }

    /// Run every remaining step and hand back the final state.
    pub fn run(mut self, mut state: LandscapeState) -> Result<SimulationOutcome, SimError> {
        tracing::info!(
            scenario = %self.scenario,
            steps = self.params.expected_steps(),
            core_cells = state.grid.core_nodes().len(),
            "starting run"
        );
        while self.phase != Phase::Done {
            self.advance(&mut state)?;
        }
        let expected = self.params.expected_steps();
        if self.flux.len() != expected {
            return Err(SimError::FluxLength {
                expected,
                actual: self.flux.len(),
            });
        }
        tracing::info!(scenario = %self.scenario, years = self.timer, "run complete");
        Ok(SimulationOutcome {
            state,
            sediment_flux: self.flux,
            transport_flux: self.transport,
            steps: self.step,
        })
    }

    /// Advance one step. Returns the phase the stepper is in afterwards.
    pub fn advance(&mut self, state: &mut LandscapeState) -> Result<Phase, SimError> {
        if self.phase == Phase::Done {
            return Ok(Phase::Done);
        }
        if self.cancel.is_cancelled() {
            return Err(SimError::Cancelled {
                scenario: self.scenario.clone(),
                phase: self.phase,
                step: self.step,
            });
        }

        let dt = self.dt();
        let year = year_index(self.timer);
        self.apply_erodibility(state, year);

        self.snapshot.clear();
        self.snapshot.extend_from_slice(&state.elevation);

        // ── Routing ──────────────────────────────────────────────────────────
        let flow = self
            .operators
            .router
            .route(&state.grid, &state.elevation)
            .map_err(|e| self.routing_error(e))?;
        state.drainage_area.clone_from(&flow.drainage_area);
        state.steepest_slope.clone_from(&flow.steepest_slope);
        state.flood_status = resolve_depressions(&flow, &state.elevation);

        let precipitation = self.forcing.precipitation(year);
        for (q, &a) in state.discharge.iter_mut().zip(&state.drainage_area) {
            *q = a * precipitation;
        }

        // ── Erosion, diffusion ───────────────────────────────────────────────
        let delivered = self
            .operators
            .eroder
            .run_one_step(state, &flow, dt)
            .map_err(|e| self.operator_error(e))?;
        state.reconcile_soil_depth();

        self.operators
            .diffuser
            .run_one_step(&state.grid, &mut state.elevation, dt)
            .map_err(|e| self.operator_error(e))?;
        state.reconcile_soil_depth();

        // ── Baselevel ────────────────────────────────────────────────────────
        let outlet = state.grid.outlet();
        state.elevation[outlet] -= self.params.baselevel_lowering_rate * dt;
        state.reconcile_soil_depth();

        state.check_stability(&self.scenario, self.phase, self.step)?;

        let removed: f64 = state
            .grid
            .core_nodes()
            .iter()
            .map(|&i| self.snapshot[i] - state.elevation[i])
            .sum();
        self.flux.push(removed / dt);
        self.transport.push(delivered);

        self.timer = round_timer(self.timer + dt);
        self.step += 1;
        self.report_progress();

        let next = self.phase_at(self.step);
        if next != self.phase {
            tracing::info!(
                scenario = %self.scenario,
                from = %self.phase,
                to = %next,
                years = self.timer,
                "phase transition"
            );
            self.phase = next;
        }
        Ok(self.phase)
    }

    /// Yearly fields in recovery; one static field for the long run.
    fn apply_erodibility(&mut self, state: &mut LandscapeState, year: usize) {
        let key = match self.phase {
            Phase::Recovery => year,
            _ => usize::MAX,
        };
        if self.applied_year == Some(key) {
            return;
        }
        if self.phase == Phase::Recovery {
            self.erodibility.fill_recovery(year, &mut state.erodibility);
        } else {
            self.erodibility.fill_long_run(&mut state.erodibility);
        }
        self.applied_year = Some(key);

        let (lo, hi) = state
            .grid
            .core_nodes()
            .iter()
            .map(|&i| state.erodibility[i])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), k| (lo.min(k), hi.max(k)));
        tracing::debug!(
            scenario = %self.scenario,
            phase = %self.phase,
            year,
            k_min = lo,
            k_max = hi,
            "erodibility updated"
        );
    }

    fn report_progress(&self) {
        let every = self.params.progress_interval;
        if every > 0 && self.step % every == 0 {
            tracing::info!(
                scenario = %self.scenario,
                phase = %self.phase,
                step = self.step,
                years = self.timer,
                flux = self.flux.last().copied().unwrap_or_default(),
                transport = self.transport.last().copied().unwrap_or_default(),
                "step"
            );
        }
    }

    fn routing_error(&self, source: RoutingError) -> SimError {
        SimError::Routing {
            scenario: self.scenario.clone(),
            phase: self.phase,
            step: self.step,
            source,
        }
    }

    fn operator_error(&self, source: OperatorError) -> SimError {
        SimError::Operator {
            scenario: self.scenario.clone(),
            phase: self.phase,
            step: self.step,
            source,
        }
    }
}

impl std::fmt::Debug for TimeStepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeStepper")
            .field("scenario", &self.scenario)
            .field("phase", &self.phase)
            .field("step", &self.step)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erodibility::{ErodibilitySynthesizer, MaskClass, MinedMask, RecoverySchedule};
    use crate::grid::{NodeStatus, RasterGrid};
    use crate::hydraulic::{FlowField, FlowRouter};
    use crate::raster::RasterHeader;
    use approx::assert_relative_eq;

    /// 5×5 core cells inside a closed ring, outlet on the bottom edge.
    fn state() -> LandscapeState {
        let size = 7;
        let mut status = vec![NodeStatus::Closed; size * size];
        for r in 1..size - 1 {
            for c in 1..size - 1 {
                status[r * size + c] = NodeStatus::Core;
            }
        }
        status[(size - 1) * size + 3] = NodeStatus::FixedValue;
        let grid = RasterGrid::from_status(RasterHeader::new(size, size, 10.0), status).unwrap();
        let z = (0..size * size)
            .map(|i| {
                let (r, c) = (i / size, i % size);
                100.0 - r as f64 * 2.0 + (c as f64 - 3.0).abs()
            })
            .collect();
        LandscapeState::new(grid, z, 500.0).unwrap()
    }

    fn short_params() -> ModelParams {
        ModelParams {
            total_time: 20.0,
            recovery_period: 10.0,
            recovery_dt: 0.5,
            fast_dt: 1.0,
            ..ModelParams::default()
        }
    }

    fn forcing(k: f64) -> ForcingTimeline {
        ForcingTimeline::from_parts(vec![1.0], vec![k], k, 0.0, 10).unwrap()
    }

    #[test]
    fn year_index_maps_half_steps() {
        assert_eq!(year_index(0.0), 0);
        assert_eq!(year_index(0.5), 0);
        assert_eq!(year_index(1.0), 1);
        assert_eq!(year_index(0.999_999_999_9), 1);
        assert_eq!(year_index(199.5), 199);
    }

    #[test]
    fn baselevel_only_run_lowers_outlet_exactly() {
        let params = ModelParams {
            diffusivity: 0.0,
            ..short_params()
        };
        let ops = GeomorphicOperators::from_params(&params);
        let s = state();
        let outlet = s.grid.outlet();
        let z0 = s.elevation[outlet];
        let core_before: Vec<f64> = s.grid.core_nodes().iter().map(|&i| s.elevation[i]).collect();
        let rate = params.baselevel_lowering_rate;

        let stepper =
            TimeStepper::new("check", params, forcing(1e-5), ErodibilityPlan::Uniform(0.0), ops).unwrap();
        let out = stepper.run(s).unwrap();

        assert_eq!(out.sediment_flux.len(), 30);
        assert_eq!(out.steps, 30);
        assert_relative_eq!(z0 - out.state.elevation[outlet], rate * 20.0, epsilon = 1e-10);
        let core_after: Vec<f64> = out.state.grid.core_nodes().iter().map(|&i| out.state.elevation[i]).collect();
        assert_eq!(core_before, core_after);
        assert!(out.sediment_flux.iter().all(|&f| f == 0.0));
        assert!(out.transport_flux.iter().all(|&q| q == 0.0));
    }

    #[test]
    fn flux_matches_core_volume_change() {
        let params = short_params();
        let ops = GeomorphicOperators::from_params(&params);
        let s = state();
        let before = s.core_elevation_sum();
        let stepper =
            TimeStepper::new("mass", params.clone(), forcing(1e-3), ErodibilityPlan::Uniform(1e-3), ops).unwrap();
        let out = stepper.run(s).unwrap();

        let dts = std::iter::repeat(params.recovery_dt)
            .take(params.recovery_steps())
            .chain(std::iter::repeat(params.fast_dt).take(params.long_run_steps()));
        let removed: f64 = out.sediment_flux.iter().zip(dts).map(|(f, dt)| f * dt).sum();
        assert_relative_eq!(removed, before - out.state.core_elevation_sum(), max_relative = 1e-9);
        assert!(removed > 0.0);
        assert!(out.state.soil_invariant_error() < 1e-9);
    }

    #[test]
    fn every_step_balances_and_keeps_soil_consistent() {
        let params = short_params();
        let ops = GeomorphicOperators::from_params(&params);
        let mut s = state();
        let mut stepper =
            TimeStepper::new("per-step", params.clone(), forcing(1e-3), ErodibilityPlan::Uniform(1e-3), ops).unwrap();

        let mut k = 0;
        while stepper.phase() != Phase::Done {
            let dt = match stepper.phase() {
                Phase::Recovery => params.recovery_dt,
                _ => params.fast_dt,
            };
            let pre: Vec<f64> = s.elevation.clone();
            stepper.advance(&mut s).unwrap();
            let removed: f64 = s.grid.core_nodes().iter().map(|&i| pre[i] - s.elevation[i]).sum();

            assert_relative_eq!(stepper.sediment_flux()[k] * dt, removed, epsilon = 1e-12, max_relative = 1e-9);
            assert!(s.soil_invariant_error() < 1e-9, "step {k}");
            assert!(stepper.transport_flux()[k] >= 0.0, "step {k}");
            k += 1;
        }
        assert_eq!(k, 30);
        assert_eq!(stepper.transport_flux().len(), 30);
        assert!(stepper.transport_flux().iter().any(|&q| q > 0.0));
    }

    #[test]
    fn recovery_fields_are_computed_once_per_year() {
        let params = short_params();
        let s = state();
        let mask = MinedMask::uniform(s.grid.len(), MaskClass::Mined);
        let synth = ErodibilitySynthesizer::new(&s.grid, &mask, 1e-5, vec![1e-3; 10], 3).unwrap();
        let plan = ErodibilityPlan::Scheduled(RecoverySchedule::new(synth));
        let ops = GeomorphicOperators::from_params(&params);
        let mut stepper = TimeStepper::new("memo", params, forcing(1e-3), plan, ops).unwrap();
        let mut s = s;
        for _ in 0..20 {
            stepper.advance(&mut s).unwrap();
        }
        assert_eq!(stepper.phase(), Phase::LongRun);
        assert_relative_eq!(stepper.timer(), 10.0);
        match &stepper.erodibility {
            ErodibilityPlan::Scheduled(schedule) => assert_eq!(schedule.fields_computed(), 10),
            ErodibilityPlan::Uniform(_) => unreachable!(),
        }
    }

    #[test]
    fn phases_progress_in_order() {
        let params = short_params();
        let ops = GeomorphicOperators::from_params(&params);
        let mut s = state();
        let mut stepper =
            TimeStepper::new("phases", params, forcing(1e-4), ErodibilityPlan::Uniform(1e-4), ops).unwrap();
        let mut seen = vec![stepper.phase()];
        while stepper.phase() != Phase::Done {
            let p = stepper.advance(&mut s).unwrap();
            if seen.last() != Some(&p) {
                seen.push(p);
            }
        }
        assert_eq!(seen, vec![Phase::Recovery, Phase::LongRun, Phase::Done]);
        assert_relative_eq!(stepper.timer(), 20.0);
        assert_eq!(stepper.advance(&mut s).unwrap(), Phase::Done);
        assert_eq!(stepper.sediment_flux().len(), 30);
    }

    struct FailingRouter {
        after: usize,
        calls: usize,
    }

    impl FlowRouter for FailingRouter {
        fn route(&mut self, grid: &RasterGrid, z: &[f64]) -> Result<FlowField, RoutingError> {
            self.calls += 1;
            if self.calls > self.after {
                return Err(RoutingError::Unreachable { unreached: 3 });
            }
            crate::hydraulic::compute_d8_flow(grid, z)
        }
    }

    #[test]
    fn routing_failure_reports_phase_and_step() {
        let params = short_params();
        let mut ops = GeomorphicOperators::from_params(&params);
        ops.router = Box::new(FailingRouter { after: 22, calls: 0 });
        let stepper =
            TimeStepper::new("scenario_4", params, forcing(1e-4), ErodibilityPlan::Uniform(1e-4), ops).unwrap();
        let err = stepper.run(state()).unwrap_err();
        match err {
            SimError::Routing {
                scenario,
                phase,
                step,
                ..
            } => {
                assert_eq!(scenario, "scenario_4");
                assert_eq!(phase, Phase::LongRun);
                assert_eq!(step, 22);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn cancelled_run_stops_before_first_step() {
        let params = short_params();
        let ops = GeomorphicOperators::from_params(&params);
        let token = CancelToken::new();
        token.cancel();
        let stepper = TimeStepper::new("cancel", params, forcing(1e-4), ErodibilityPlan::Uniform(1e-4), ops)
            .unwrap()
            .with_cancel(token);
        let err = stepper.run(state()).unwrap_err();
        assert!(matches!(
            err,
            SimError::Cancelled {
                phase: Phase::Recovery,
                step: 0,
                ..
            }
        ));
    }

    #[test]
    fn uneven_time_grid_is_rejected() {
        let params = ModelParams {
            recovery_dt: 0.3,
            ..short_params()
        };
        let ops = GeomorphicOperators::from_params(&params);
        let err = TimeStepper::new("bad", params, forcing(1e-4), ErodibilityPlan::Uniform(1e-4), ops).unwrap_err();
        assert!(matches!(err, ConfigError::TimeGrid(_)));
    }
}
