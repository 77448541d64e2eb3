// src/stepper.rs
// Host-side stepper position tracking.

use parking_lot::Mutex;

use crate::configfile::{ConfigError, Configfile};
use crate::core_traits::PositionReader;

/// A stepper as seen from the host: an integer MCU step count plus the
/// offset that maps it into the commanded (toolhead) frame.
#[derive(Debug, Clone)]
pub struct McuStepper {
    name: String,
    step_dist: f64,
    mcu_position: i64,
    mcu_position_offset: f64,
    commanded_position: f64,
}

impl McuStepper {
    pub fn new(name: impl Into<String>, step_dist: f64) -> Self {
        McuStepper {
            name: name.into(),
            step_dist,
            mcu_position: 0,
            mcu_position_offset: 0.0,
            commanded_position: 0.0,
        }
    }

    /// Builds a stepper from a `[stepper_*]` section.
    ///
    /// `step_dist = rotation_distance / (full_steps_per_rotation * microsteps)`
    pub fn from_config(config: &Configfile, section: &str) -> Result<Self, ConfigError> {
        let rotation_distance = config.getfloat_above(section, "rotation_distance", None, 0.0)?;
        let full_steps = config.getint(section, "full_steps_per_rotation", Some(200), Some(1), None)?;
        let microsteps = config.getint(section, "microsteps", Some(16), Some(1), None)?;
        let step_dist = rotation_distance / (full_steps * microsteps) as f64;
        Ok(McuStepper::new(section, step_dist))
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_mcu_position(&self) -> i64 {
        self.mcu_position
    }

    pub fn get_commanded_position(&self) -> f64 {
        self.commanded_position
    }

    pub fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64 {
        mcu_pos as f64 * self.step_dist - self.mcu_position_offset
    }

    /// Steps to the whole step nearest `mcu_frame_pos`. The commanded
    /// position follows the step count.
    pub fn step_to(&mut self, mcu_frame_pos: f64) {
        self.mcu_position = (mcu_frame_pos / self.step_dist).round() as i64;
        self.commanded_position = self.mcu_to_commanded_position(self.mcu_position);
    }

    /// Re-bases the commanded frame so the current step count reads as
    /// `commanded`.
    pub fn set_position(&mut self, commanded: f64) {
        self.mcu_position_offset = self.mcu_position as f64 * self.step_dist - commanded;
        self.commanded_position = commanded;
    }
}

impl PositionReader for Mutex<McuStepper> {
    fn get_name(&self) -> String {
        self.lock().get_name().to_string()
    }

    fn get_commanded_position(&self) -> f64 {
        self.lock().get_commanded_position()
    }

    fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64 {
        self.lock().mcu_to_commanded_position(mcu_pos)
    }
}
