//! Clearing strategies: when each is safe and the motion each performs.

use std::fmt::Write as _;

use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::ClearingConfig;

/// XY stepper current the boost multiplies, in amps.
const NOMINAL_XY_CURRENT_A: f64 = 1.2;

/// How a finished part is removed from the plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, FromStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[display(style = "SNAKE_CASE")]
pub enum ClearingStrategy {
    /// An operator removes the part.
    Manual,
    /// A1: lower the gantry beam in front of the part and drive the bed
    /// underneath it.
    A1GantrySweep,
    /// A1: push the part off with the toolhead.
    A1ToolheadPush,
    /// CoreXY machines: ram the part from the rear.
    X1MechanicalSweep,
}

impl ClearingStrategy {
    /// The smallest part this strategy can clear, `None` for manual.
    pub fn min_part_height_mm(self, guards: &ClearingConfig) -> Option<f64> {
        match self {
            ClearingStrategy::Manual => None,
            ClearingStrategy::A1GantrySweep => Some(guards.a1_gantry_sweep_min_mm),
            ClearingStrategy::A1ToolheadPush => Some(guards.a1_toolhead_push_min_mm),
            ClearingStrategy::X1MechanicalSweep => Some(guards.x1_mechanical_sweep_min_mm),
        }
    }

    /// Check that automated clearing may run on a part of this height.
    ///
    /// The error is the reason it may not. A part of unknown height is never
    /// cleared automatically.
    pub fn check_safe(self, part_height_mm: Option<f64>, guards: &ClearingConfig) -> Result<(), String> {
        let Some(min) = self.min_part_height_mm(guards) else {
            return Err("strategy is MANUAL".to_string());
        };
        let Some(height) = part_height_mm else {
            return Err("part height unknown".to_string());
        };
        if !height.is_finite() || height < min {
            return Err(format!("part height {height}mm below {min}mm minimum for {self}"));
        }
        Ok(())
    }
}

/// What to clear and how.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClearingPlan {
    /// The strategy.
    pub strategy: ClearingStrategy,
    /// Height of the part on the plate.
    pub part_height_mm: f64,
}

impl ClearingPlan {
    /// The motion script for this plan.
    ///
    /// A `current_boost` wraps the motion in a stepper current increase and
    /// a reset, for a second attempt after a stall.
    pub fn script(&self, current_boost: Option<f64>) -> String {
        let mut script = String::new();
        let _ = writeln!(script, "; --- AUTO CLEAR: {} ---", self.strategy);
        let _ = writeln!(script, "; Part Height: {:.1}mm", self.part_height_mm);
        script.push_str("M400\n");

        if let Some(boost) = current_boost {
            let amps = NOMINAL_XY_CURRENT_A * boost;
            let _ = writeln!(script, "M17 X{amps:.2} Y{amps:.2} ; boost stepper current for retry");
        }

        match self.strategy {
            ClearingStrategy::Manual => script.push_str("; manual clearing, no moves\n"),
            ClearingStrategy::A1GantrySweep => {
                let z = (self.part_height_mm * 0.8).max(15.0);
                script.push_str("M140 S0\n");
                script.push_str("G90\n");
                script.push_str("G1 X252 F12000 ; park toolhead right\n");
                script.push_str("G1 Y0 F12000 ; bed fully front\n");
                let _ = writeln!(script, "G1 Z{z:.2} F3000 ; lower gantry");
                script.push_str("G1 Y250 F3000 ; bed back, part meets gantry\n");
                script.push_str("G1 Z50 F3000\n");
            }
            ClearingStrategy::A1ToolheadPush => {
                let z = (self.part_height_mm + 1.0).max(5.0);
                script.push_str("M140 S0\n");
                script.push_str("G28\n");
                script.push_str("G90\n");
                script.push_str("G1 Z100\n");
                script.push_str("G1 X128 Y256 F12000 ; center back\n");
                let _ = writeln!(script, "G1 Z{z:.2} ; lower nozzle");
                script.push_str("G1 Y0 F2000 ; push forward\n");
                script.push_str("G28\n");
            }
            ClearingStrategy::X1MechanicalSweep => {
                script.push_str("M106 P2 S255\n");
                script.push_str("G28\n");
                script.push_str("G90\n");
                script.push_str("G1 Z10 F600\n");
                script.push_str("G1 X128 Y250 F12000 ; rear center\n");
                script.push_str("M400\n");
                script.push_str("G1 Y0 F20000 ; ram\n");
                script.push_str("G1 Y250 F12000\n");
                script.push_str("M106 P2 S0\n");
            }
        }

        if current_boost.is_some() {
            script.push_str("M17 R ; restore stepper current\n");
        }
        script.push_str("M400\n");
        script.push_str("; --- END AUTO CLEAR ---\n");
        script
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn guards() -> ClearingConfig {
        ClearingConfig::default()
    }

    #[test]
    fn test_manual_is_never_safe() {
        assert!(ClearingStrategy::Manual.check_safe(Some(200.0), &guards()).is_err());
    }

    #[test]
    fn test_height_guards_are_per_strategy() {
        let guards = guards();
        assert!(ClearingStrategy::A1GantrySweep.check_safe(Some(49.9), &guards).is_err());
        assert!(ClearingStrategy::A1GantrySweep.check_safe(Some(50.0), &guards).is_ok());
        assert!(ClearingStrategy::X1MechanicalSweep.check_safe(Some(38.0), &guards).is_ok());
        assert!(ClearingStrategy::X1MechanicalSweep.check_safe(Some(37.0), &guards).is_err());
        assert!(ClearingStrategy::A1ToolheadPush.check_safe(Some(3.0), &guards).is_ok());
    }

    #[test]
    fn test_unknown_height_is_unsafe() {
        assert_eq!(
            ClearingStrategy::A1ToolheadPush.check_safe(None, &guards()),
            Err("part height unknown".to_string())
        );
    }

    #[test]
    fn test_gantry_height_has_a_floor() {
        let tall = ClearingPlan {
            strategy: ClearingStrategy::A1GantrySweep,
            part_height_mm: 100.0,
        };
        assert!(tall.script(None).contains("G1 Z80.00 F3000"));

        let short = ClearingPlan {
            strategy: ClearingStrategy::A1GantrySweep,
            part_height_mm: 10.0,
        };
        assert!(short.script(None).contains("G1 Z15.00 F3000"));
    }

    #[test]
    fn test_toolhead_push_height() {
        let plan = ClearingPlan {
            strategy: ClearingStrategy::A1ToolheadPush,
            part_height_mm: 12.0,
        };
        assert!(plan.script(None).contains("G1 Z13.00 ; lower nozzle"));
    }

    #[test]
    fn test_retry_script_boosts_current() {
        let plan = ClearingPlan {
            strategy: ClearingStrategy::X1MechanicalSweep,
            part_height_mm: 40.0,
        };
        let first = plan.script(None);
        let retry = plan.script(Some(1.5));

        assert!(!first.contains("M17"));
        assert!(retry.contains("M17 X1.80 Y1.80"));
        assert!(retry.contains("M17 R"));
        let boost = retry.find("M17 X").unwrap();
        let ram = retry.find("G1 Y0 F20000").unwrap();
        let reset = retry.find("M17 R").unwrap();
        assert!(boost < ram && ram < reset);
    }
}
