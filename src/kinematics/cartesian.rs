// src/kinematics/cartesian.rs

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::configfile::{ConfigError, Configfile};
use crate::core_traits::PositionReader;
use crate::endstop::SimulatedEndstop;
use crate::gcode::CommandError;
use crate::kinematics::AXIS_NAMES;
use crate::stepper::McuStepper;

// Travel allowed past the configured range before a homing move gives up.
const HOMING_OVERTRAVEL: f64 = 5.0;

/// One axis: its steppers, travel range and endstop.
#[derive(Debug)]
pub struct Rail {
    name: char,
    steppers: Vec<Arc<Mutex<McuStepper>>>,
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    endstop: SimulatedEndstop,
}

impl Rail {
    pub fn new(
        name: char,
        steppers: Vec<McuStepper>,
        position_min: f64,
        position_max: f64,
        position_endstop: f64,
        endstop: SimulatedEndstop,
    ) -> Self {
        Rail {
            name,
            steppers: steppers.into_iter().map(|s| Arc::new(Mutex::new(s))).collect(),
            position_min,
            position_max,
            position_endstop,
            endstop,
        }
    }

    /// Reads `[stepper_<axis>]` plus any numbered siblings
    /// (`[stepper_z1]`, `[stepper_z2]`, ...) that share the rail.
    pub fn from_config(config: &Configfile, axis: char) -> Result<Self, ConfigError> {
        let section = format!("stepper_{}", axis);
        if !config.has_section(&section) {
            return Err(ConfigError::SectionNotFound(section));
        }
        let position_endstop = config.getfloat(&section, "position_endstop", None, None, None)?;
        let position_min = config.getfloat(&section, "position_min", Some(0.0), None, None)?;
        let position_max = config.getfloat(&section, "position_max", None, Some(position_min), None)?;
        if position_endstop < position_min || position_endstop > position_max {
            return Err(ConfigError::ValidationError(format!(
                "position_endstop in section '[{}]' must be between position_min and position_max",
                section
            )));
        }

        let mut steppers = vec![McuStepper::from_config(config, &section)?];
        for extra in config.sections_with_prefix(&section) {
            let is_sibling = extra.len() > section.len() && extra[section.len()..].chars().all(|c| c.is_ascii_digit());
            if is_sibling {
                steppers.push(McuStepper::from_config(config, &extra)?);
            }
        }

        let endstop = SimulatedEndstop::from_config(config, &section, position_endstop)?;
        Ok(Rail::new(axis, steppers, position_min, position_max, position_endstop, endstop))
    }

    pub fn get_name(&self) -> char {
        self.name
    }

    pub fn get_steppers(&self) -> &[Arc<Mutex<McuStepper>>] {
        &self.steppers
    }

    /// Drives every stepper of the rail into the endstop and re-bases the
    /// commanded frame on `position_endstop`. Returns the trigger point.
    pub fn home(&mut self) -> Result<f64, CommandError> {
        let triggered_at = self.endstop.trigger();
        if triggered_at < self.position_min - HOMING_OVERTRAVEL || triggered_at > self.position_max + HOMING_OVERTRAVEL {
            return Err(CommandError::GCodeError(format!(
                "No trigger on {} after full movement", self.name
            )));
        }
        for stepper in &self.steppers {
            let mut stepper = stepper.lock();
            stepper.step_to(triggered_at);
            stepper.set_position(self.position_endstop);
            log::debug!(
                "{} triggered at {:.6} (mcu position {})",
                stepper.get_name(), triggered_at, stepper.get_mcu_position()
            );
        }
        Ok(triggered_at)
    }
}

pub struct CartesianKinematics {
    rails: Vec<Rail>,
    homed: [bool; 3],
}

impl CartesianKinematics {
    pub fn new(rails: Vec<Rail>) -> Self {
        CartesianKinematics { rails, homed: [false; 3] }
    }

    pub fn from_config(config: &Configfile) -> Result<Self, ConfigError> {
        let rails = AXIS_NAMES
            .iter()
            .map(|&axis| Rail::from_config(config, axis))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CartesianKinematics::new(rails))
    }

    pub fn get_rails(&self) -> &[Rail] {
        &self.rails
    }

    /// Homes the given axis indexes in order. An axis that fails to home
    /// is left unhomed.
    pub fn home(&mut self, axes: &[usize]) -> Result<(), CommandError> {
        for &axis in axes {
            let rail = self
                .rails
                .get_mut(axis)
                .ok_or_else(|| CommandError::GCodeError(format!("Unknown axis index {}", axis)))?;
            self.homed[axis] = false;
            rail.home()?;
            self.homed[axis] = true;
            log::info!("Homed axis {}", rail.get_name());
        }
        Ok(())
    }

    pub fn homed_axes(&self) -> HashSet<char> {
        AXIS_NAMES
            .iter()
            .zip(self.homed.iter())
            .filter(|(_, homed)| **homed)
            .map(|(axis, _)| *axis)
            .collect()
    }

    pub fn get_steppers(&self) -> Vec<Arc<dyn PositionReader>> {
        self.rails
            .iter()
            .flat_map(|rail| rail.get_steppers().iter())
            .map(|s| Arc::clone(s) as Arc<dyn PositionReader>)
            .collect()
    }
}
