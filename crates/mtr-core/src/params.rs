//! Model parameters. Defaults are the values used for the published
//! Laurel Creek and White Oak runs.
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tolerance used when checking that phase lengths divide into whole steps.
const STEP_TOL: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Simulated years in total.
    pub total_time: f64,
    /// Years of vegetation recovery at fine resolution.
    pub recovery_period: f64,
    pub recovery_dt: f64,
    pub fast_dt: f64,
    /// Linear hillslope diffusivity (m²/yr).
    pub diffusivity: f64,
    /// Drainage-area (discharge) exponent.
    pub m_sp: f64,
    /// Slope exponent.
    pub n_sp: f64,
    /// Fraction of entrained material carried off as wash load.
    pub fines_fraction: f64,
    /// Sediment porosity.
    pub porosity: f64,
    /// Soil entrainment depth scale (m).
    pub h_star: f64,
    /// Effective settling velocity (m/yr).
    pub v_s: f64,
    /// Entrainment threshold for sediment.
    pub sp_crit_sed: f64,
    /// Outlet lowering (m/yr).
    pub baselevel_lowering_rate: f64,
    /// Side of the square erodibility smoothing window, in cells. Odd.
    pub window_size: usize,
    /// Regolith thickness above bedrock at t = 0 (m).
    pub initial_soil_depth: f64,
    /// DEM values below this are inactive.
    pub validity_floor: f64,
    pub dem_nodata: f64,
    pub mask_nodata: f64,
    /// Emit a progress line every this many steps.
    pub progress_interval: usize,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            total_time: 10_000.0,
            recovery_period: 200.0,
            recovery_dt: 0.5,
            fast_dt: 1.0,
            diffusivity: 3e-3,
            m_sp: 0.5,
            n_sp: 1.0,
            fines_fraction: 0.0,
            porosity: 0.3,
            h_star: 1.0,
            v_s: 0.01,
            sp_crit_sed: 0.0,
            baselevel_lowering_rate: 2.7e-5,
            window_size: 9,
            initial_soil_depth: 500.0,
            validity_floor: 1.0,
            dem_nodata: -99999.0,
            mask_nodata: -9999.0,
            progress_interval: 1,
        }
    }
}

impl ModelParams {
    /// Whole number of steps in the recovery phase.
    pub fn recovery_steps(&self) -> usize {
        (self.recovery_period / self.recovery_dt).round() as usize
    }

    /// Whole number of steps in the long-run phase.
    pub fn long_run_steps(&self) -> usize {
        ((self.total_time - self.recovery_period) / self.fast_dt).round() as usize
    }

    /// Length of the sediment flux series for a complete run.
    pub fn expected_steps(&self) -> usize {
        self.recovery_steps() + self.long_run_steps()
    }

    /// Number of yearly erodibility fields the recovery phase indexes.
    pub fn recovery_years(&self) -> usize {
        self.recovery_period.ceil() as usize
    }

    /// Reject parameter sets the stepper cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("recovery_dt", self.recovery_dt),
            ("fast_dt", self.fast_dt),
            ("h_star", self.h_star),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Parameter {
                    name,
                    value,
                    message: "must be positive".into(),
                });
            }
        }
        let non_negative = [
            ("total_time", self.total_time),
            ("diffusivity", self.diffusivity),
            ("m_sp", self.m_sp),
            ("n_sp", self.n_sp),
            ("v_s", self.v_s),
            ("sp_crit_sed", self.sp_crit_sed),
            ("baselevel_lowering_rate", self.baselevel_lowering_rate),
            ("initial_soil_depth", self.initial_soil_depth),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Parameter {
                    name,
                    value,
                    message: "must be finite and non-negative".into(),
                });
            }
        }
        if !(0.0..1.0).contains(&self.porosity) {
            return Err(ConfigError::Parameter {
                name: "porosity",
                value: self.porosity,
                message: "must lie in [0, 1)".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.fines_fraction) {
            return Err(ConfigError::Parameter {
                name: "fines_fraction",
                value: self.fines_fraction,
                message: "must lie in [0, 1]".into(),
            });
        }
        if self.window_size == 0 || self.window_size % 2 == 0 {
            return Err(ConfigError::Parameter {
                name: "window_size",
                value: self.window_size as f64,
                message: "must be an odd number of cells".into(),
            });
        }
        if !(self.recovery_period.is_finite() && self.recovery_period > 0.0) {
            return Err(ConfigError::TimeGrid(format!(
                "recovery_period must be positive, got {}",
                self.recovery_period
            )));
        }
        if self.recovery_period > self.total_time {
            return Err(ConfigError::TimeGrid(format!(
                "recovery_period {} exceeds total_time {}",
                self.recovery_period, self.total_time
            )));
        }
        check_whole_steps("recovery", self.recovery_period, self.recovery_dt)?;
        check_whole_steps("long-run", self.total_time - self.recovery_period, self.fast_dt)?;
        Ok(())
    }
}

fn check_whole_steps(phase: &str, span: f64, dt: f64) -> Result<(), ConfigError> {
    let n = span / dt;
    if (n - n.round()).abs() > STEP_TOL * n.abs().max(1.0) {
        return Err(ConfigError::TimeGrid(format!(
            "{phase} phase of {span} yr is not a whole number of {dt} yr steps"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_and_count_steps() {
        let p = ModelParams::default();
        p.validate().unwrap();
        assert_eq!(p.recovery_steps(), 400);
        assert_eq!(p.long_run_steps(), 9_800);
        assert_eq!(p.expected_steps(), 10_200);
        assert_eq!(p.recovery_years(), 200);
    }

    #[test]
    fn fractional_step_count_is_rejected() {
        let p = ModelParams {
            recovery_period: 10.0,
            recovery_dt: 0.3,
            ..ModelParams::default()
        };
        assert!(matches!(p.validate(), Err(ConfigError::TimeGrid(_))));
    }

    #[test]
    fn even_window_is_rejected() {
        let p = ModelParams {
            window_size: 8,
            ..ModelParams::default()
        };
        assert!(matches!(
            p.validate(),
            Err(ConfigError::Parameter { name: "window_size", .. })
        ));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let p: ModelParams = serde_json::from_str(r#"{ "total_time": 20, "recovery_period": 10 }"#).unwrap();
        assert_eq!(p.total_time, 20.0);
        assert_eq!(p.fast_dt, 1.0);
        assert_eq!(p.expected_steps(), 30);
    }
}
