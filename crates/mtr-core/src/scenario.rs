//! Scenario presets: a recovery scenario follows one column of the
//! erodibility table; the two controls hold erodibility fixed.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::erodibility::{ErodibilityPlan, ErodibilitySynthesizer, MinedMask, RecoverySchedule};
use crate::error::ConfigError;
use crate::forcing::ForcingTimeline;
use crate::grid::RasterGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPreset {
    /// Mined cells follow the scenario's recovery curve.
    Recovery,
    /// Mined cells keep the freshly mined erodibility for the whole run.
    ControlMined,
    /// The whole domain is unmined; no smoothing.
    ControlUnmined,
}

impl fmt::Display for ScenarioPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScenarioPreset::Recovery => "recovery",
            ScenarioPreset::ControlMined => "control-mined",
            ScenarioPreset::ControlUnmined => "control-unmined",
        })
    }
}

impl FromStr for ScenarioPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "recovery" => Ok(ScenarioPreset::Recovery),
            "control-mined" => Ok(ScenarioPreset::ControlMined),
            "control-unmined" => Ok(ScenarioPreset::ControlUnmined),
            other => Err(ConfigError::UnknownPreset(other.to_string())),
        }
    }
}

/// One run: a preset plus the erodibility table column it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scenario {
    pub preset: ScenarioPreset,
    #[serde(default)]
    pub id: usize,
}

impl Scenario {
    pub fn recovery(id: usize) -> Self {
        Self {
            preset: ScenarioPreset::Recovery,
            id,
        }
    }

    pub fn control_mined(id: usize) -> Self {
        Self {
            preset: ScenarioPreset::ControlMined,
            id,
        }
    }

    pub fn control_unmined() -> Self {
        Self {
            preset: ScenarioPreset::ControlUnmined,
            id: 0,
        }
    }

    /// Output file prefix, e.g. `scenario_4_` or `control_mined_4_`.
    pub fn prefix(&self) -> String {
        format!("{}_", self.label())
    }

    /// Identifier used in logs, errors and output names. The unmined
    /// control never reads the table, so its id is not part of it.
    pub fn label(&self) -> String {
        match self.preset {
            ScenarioPreset::Recovery => format!("scenario_{}", self.id),
            ScenarioPreset::ControlMined => format!("control_mined_{}", self.id),
            ScenarioPreset::ControlUnmined => "control_unmined".to_string(),
        }
    }

    pub fn needs_mask(&self) -> bool {
        self.preset != ScenarioPreset::ControlUnmined
    }

    /// How this scenario's erodibility evolves.
    pub fn erodibility_plan(
        &self,
        grid: &RasterGrid,
        mask: Option<&MinedMask>,
        forcing: &ForcingTimeline,
        window: usize,
    ) -> Result<ErodibilityPlan, ConfigError> {
        let mask = match (self.needs_mask(), mask) {
            (false, _) => return Ok(ErodibilityPlan::Uniform(forcing.k_unmined())),
            (true, Some(m)) => m,
            (true, None) => {
                return Err(ConfigError::Erodibility(format!(
                    "{} needs a mined-area mask",
                    self.label()
                )))
            }
        };
        let synth = match self.preset {
            ScenarioPreset::ControlMined => ErodibilitySynthesizer::new(
                grid,
                mask,
                forcing.k_unmined(),
                vec![forcing.k_mined_initial()],
                window,
            )?,
            _ => ErodibilitySynthesizer::from_forcing(grid, mask, forcing, window)?,
        };
        Ok(ErodibilityPlan::Scheduled(RecoverySchedule::new(synth)))
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erodibility::MaskClass;
    use crate::grid::NodeStatus;
    use crate::raster::RasterHeader;

    fn grid() -> RasterGrid {
        let mut status = vec![NodeStatus::Closed; 36];
        for r in 1..5 {
            for c in 1..5 {
                status[r * 6 + c] = NodeStatus::Core;
            }
        }
        status[33] = NodeStatus::FixedValue;
        RasterGrid::from_status(RasterHeader::new(6, 6, 10.0), status).unwrap()
    }

    fn forcing() -> ForcingTimeline {
        ForcingTimeline::from_parts(vec![1.0], vec![1e-3, 5e-4, 1e-4], 1e-5, 0.0, 3).unwrap()
    }

    #[test]
    fn prefixes_match_output_names() {
        assert_eq!(Scenario::recovery(4).prefix(), "scenario_4_");
        assert_eq!(Scenario::control_mined(0).prefix(), "control_mined_0_");
        assert_eq!(Scenario::control_mined(4).prefix(), "control_mined_4_");
        assert_eq!(Scenario::control_unmined().prefix(), "control_unmined_");
    }

    #[test]
    fn presets_parse_both_spellings() {
        assert_eq!("control_unmined".parse::<ScenarioPreset>().unwrap(), ScenarioPreset::ControlUnmined);
        assert_eq!("Control-Mined".parse::<ScenarioPreset>().unwrap(), ScenarioPreset::ControlMined);
        let err = "reclaimed".parse::<ScenarioPreset>().unwrap_err();
        assert!(matches!(&err, ConfigError::UnknownPreset(name) if name == "reclaimed"));
        assert!(err.to_string().contains("control-mined"));
    }

    #[test]
    fn control_unmined_is_uniform_without_mask() {
        let plan = Scenario::control_unmined()
            .erodibility_plan(&grid(), None, &forcing(), 3)
            .unwrap();
        assert!(matches!(plan, ErodibilityPlan::Uniform(k) if k == 1e-5));
    }

    #[test]
    fn recovery_without_mask_is_rejected() {
        let err = Scenario::recovery(1).erodibility_plan(&grid(), None, &forcing(), 3);
        assert!(matches!(err, Err(ConfigError::Erodibility(_))));
    }

    #[test]
    fn control_mined_holds_initial_erodibility() {
        let g = grid();
        let mask = MinedMask::uniform(g.len(), MaskClass::Mined);
        let mut plan = Scenario::control_mined(0)
            .erodibility_plan(&g, Some(&mask), &forcing(), 3)
            .unwrap();
        let mut k = vec![0.0; g.len()];
        plan.fill_long_run(&mut k);
        approx::assert_relative_eq!(k[14], 1e-3, max_relative = 1e-10);
    }

    #[test]
    fn scenario_round_trips_through_json() {
        let s: Scenario = serde_json::from_str(r#"{ "preset": "recovery", "id": 7 }"#).unwrap();
        assert_eq!(s, Scenario::recovery(7));
        let c: Scenario = serde_json::from_str(r#"{ "preset": "control_unmined" }"#).unwrap();
        assert_eq!(c, Scenario::control_unmined());
    }
}
