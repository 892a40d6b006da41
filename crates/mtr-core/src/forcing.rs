//! Forcing timeline: yearly precipitation and the scenario erodibility
//! curve, both extended past their records by holding the last value.
//!
//! Erodibility is rescaled by `v_s / min(P) + 1` so that K is compatible
//! with the discharge-based transport law. The same factor applies to every
//! scenario curve and to the unmined baseline.
use crate::error::ConfigError;
use crate::tables::ScenarioTable;

/// Convert an annual total in mm to m/yr, rounded to the centimetre.
pub fn normalize_precipitation(mm_per_yr: f64) -> f64 {
    (mm_per_yr / 1000.0 * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForcingTimeline {
    /// m/yr, indexed by year.
    precipitation: Vec<f64>,
    /// Rescaled scenario curve, indexed by year.
    k_modeled: Vec<f64>,
    k_unmined: f64,
    normalization: f64,
    recovery_years: usize,
}

impl ForcingTimeline {
    /// Build from a climate record in mm/yr and one column of the scenario
    /// table.
    pub fn build(
        climate_mm: &[f64],
        table: &ScenarioTable,
        scenario_id: usize,
        v_s: f64,
        recovery_years: usize,
    ) -> Result<Self, ConfigError> {
        let precipitation = climate_mm.iter().map(|&mm| normalize_precipitation(mm)).collect();
        let raw_curve = table.column(scenario_id)?;
        Self::from_parts(precipitation, raw_curve, table.min_value(), v_s, recovery_years)
    }

    /// Build from precipitation already in m/yr and a raw K curve.
    /// `raw_min` is the smallest raw K across all scenarios.
    pub fn from_parts(
        precipitation: Vec<f64>,
        raw_curve: Vec<f64>,
        raw_min: f64,
        v_s: f64,
        recovery_years: usize,
    ) -> Result<Self, ConfigError> {
        if precipitation.is_empty() {
            return Err(ConfigError::Forcing("climate record is empty".into()));
        }
        if raw_curve.is_empty() {
            return Err(ConfigError::Forcing("erodibility curve is empty".into()));
        }
        if recovery_years == 0 {
            return Err(ConfigError::Forcing("recovery period covers no years".into()));
        }
        if let Some(p) = precipitation.iter().find(|p| !p.is_finite() || **p < 0.0) {
            return Err(ConfigError::Forcing(format!("invalid precipitation {p}")));
        }
        let p_min = precipitation.iter().copied().fold(f64::INFINITY, f64::min);
        if p_min <= 0.0 {
            return Err(ConfigError::Forcing(
                "minimum precipitation must be positive to normalize erodibility".into(),
            ));
        }

        let normalization = v_s / p_min + 1.0;
        let k_modeled = raw_curve.iter().map(|k| k * normalization).collect();
        let k_unmined = raw_min * normalization;

        Ok(Self {
            precipitation,
            k_modeled,
            k_unmined,
            normalization,
            recovery_years,
        })
    }

    /// Precipitation (m/yr) for `year`; the final record value past its end.
    pub fn precipitation(&self, year: usize) -> f64 {
        self.precipitation[year.min(self.precipitation.len() - 1)]
    }

    /// Scenario erodibility for `year`. Held at the last recovery year once
    /// the recovery period is over, and at the last table value past the
    /// table's end.
    pub fn erodibility_curve(&self, year: usize) -> f64 {
        let last = (self.recovery_years - 1).min(self.k_modeled.len() - 1);
        self.k_modeled[year.min(last)]
    }

    pub fn k_unmined(&self) -> f64 {
        self.k_unmined
    }

    /// Erodibility of freshly mined ground.
    pub fn k_mined_initial(&self) -> f64 {
        self.k_modeled[0]
    }

    pub fn normalization(&self) -> f64 {
        self.normalization
    }

    pub fn climate_record_len(&self) -> usize {
        self.precipitation.len()
    }

    pub fn recovery_years(&self) -> usize {
        self.recovery_years
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> ScenarioTable {
        ScenarioTable::from_rows(vec![
            vec![4e-4, 4e-4, 4e-4],
            vec![3e-4, 2e-4, 4e-4],
            vec![2e-4, 1e-4, 4e-4],
            vec![1e-4, 1e-4, 4e-4],
        ])
        .unwrap()
    }

    #[test]
    fn precipitation_is_converted_and_rounded() {
        assert_eq!(normalize_precipitation(1234.0), 1.23);
        assert_eq!(normalize_precipitation(1006.0), 1.01);
    }

    #[test]
    fn precipitation_plateaus_after_record() {
        let f = ForcingTimeline::build(&[1100.0, 1200.0, 1300.0], &table(), 0, 0.01, 3).unwrap();
        assert_eq!(f.climate_record_len(), 3);
        for year in 2..500 {
            assert_eq!(f.precipitation(year), 1.3);
        }
    }

    #[test]
    fn erodibility_is_rescaled_uniformly() {
        let v_s = 0.01;
        let f = ForcingTimeline::build(&[1100.0, 1200.0], &table(), 1, v_s, 4).unwrap();
        let factor = v_s / 1.1 + 1.0;
        assert_relative_eq!(f.normalization(), factor, max_relative = 1e-12);
        assert_relative_eq!(f.erodibility_curve(1), 2e-4 * factor, max_relative = 1e-12);
        assert_relative_eq!(f.k_unmined(), 1e-4 * factor, max_relative = 1e-12);
        assert_relative_eq!(f.k_mined_initial(), 4e-4 * factor, max_relative = 1e-12);
    }

    #[test]
    fn erodibility_plateaus_after_recovery_period() {
        let f = ForcingTimeline::build(&[1000.0], &table(), 0, 0.0, 2).unwrap();
        assert_eq!(f.erodibility_curve(1), 3e-4);
        assert_eq!(f.erodibility_curve(2), 3e-4);
        assert_eq!(f.erodibility_curve(9_999), 3e-4);
    }

    #[test]
    fn erodibility_plateaus_past_short_table() {
        let f = ForcingTimeline::build(&[1000.0], &table(), 0, 0.0, 200).unwrap();
        assert_eq!(f.erodibility_curve(3), 1e-4);
        assert_eq!(f.erodibility_curve(150), 1e-4);
    }

    #[test]
    fn empty_or_dry_climate_is_rejected() {
        assert!(ForcingTimeline::build(&[], &table(), 0, 0.01, 2).is_err());
        assert!(ForcingTimeline::build(&[1000.0, 2.0], &table(), 0, 0.01, 2).is_err());
    }
}
