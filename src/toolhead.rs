// src/toolhead.rs
// Owns the kinematics and serves homing requests.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::json;

use crate::configfile::{ConfigError, Configfile};
use crate::core_traits::{AxisPrerequisiteCheck, PositionReader, StepperLookup};
use crate::gcode::{CommandError, GCode, GCodeCommand};
use crate::kinematics::cartesian::CartesianKinematics;
use crate::kinematics::{axis_index, AXIS_NAMES};

pub struct Toolhead {
    kin: Mutex<CartesianKinematics>,
}

impl Toolhead {
    pub fn new(kin: CartesianKinematics) -> Self {
        Toolhead { kin: Mutex::new(kin) }
    }

    pub fn from_config(config: &Configfile) -> Result<Self, ConfigError> {
        Ok(Toolhead::new(CartesianKinematics::from_config(config)?))
    }

    /// Homes the named axes (`'x'`, `'y'`, `'z'`), in XYZ order.
    pub fn home_axes(&self, axes: &[char]) -> Result<(), CommandError> {
        let mut indexes = axes
            .iter()
            .map(|&a| axis_index(a).ok_or_else(|| CommandError::GCodeError(format!("Unknown axis '{}'", a))))
            .collect::<Result<Vec<usize>, _>>()?;
        indexes.sort_unstable();
        indexes.dedup();
        self.kin.lock().home(&indexes)
    }

    /// `G28 [X] [Y] [Z]`; no axis letters homes all axes.
    #[allow(non_snake_case)]
    pub fn cmd_G28(&self, gcmd: &GCodeCommand) -> Result<(), CommandError> {
        let mut axes: Vec<char> = AXIS_NAMES.iter().copied().filter(|a| gcmd.has_param(&a.to_string())).collect();
        if axes.is_empty() {
            axes = AXIS_NAMES.to_vec();
        }
        self.home_axes(&axes)
    }

    pub fn register_commands(this: &Arc<Toolhead>, gcode: &GCode) {
        let weak: Weak<Toolhead> = Arc::downgrade(this);
        gcode.register_command(
            "G28",
            move |gcmd| {
                let toolhead = weak
                    .upgrade()
                    .ok_or_else(|| CommandError::GCodeError("toolhead object dropped".to_string()))?;
                toolhead.cmd_G28(gcmd)
            },
            Some("Home axes"),
        );
    }

    pub fn get_status(&self, _eventtime: f64) -> serde_json::Value {
        let homed = self.homed_axes();
        let homed_axes: String = AXIS_NAMES.iter().filter(|a| homed.contains(*a)).collect();
        json!({ "homed_axes": homed_axes })
    }
}

impl AxisPrerequisiteCheck for Toolhead {
    fn homed_axes(&self) -> HashSet<char> {
        self.kin.lock().homed_axes()
    }
}

impl StepperLookup for Toolhead {
    fn get_steppers(&self) -> Vec<Arc<dyn PositionReader>> {
        self.kin.lock().get_steppers()
    }
}
