// src/core_traits.rs
// Interfaces between the stable Z home extra and the rest of the host.

use std::collections::HashSet;
use std::sync::Arc;

use crate::gcode::CommandError;

/// Action run before every homing attempt. Blocks until it completes.
pub trait PreAttemptAction {
    fn execute(&self) -> Result<(), CommandError>;
}

/// Performs the physical homing move for one axis. Blocks until the move
/// completes.
pub trait HomingAction {
    fn home(&self, axis: char) -> Result<(), CommandError>;
}

/// Position of a single stepper.
pub trait PositionReader {
    fn get_name(&self) -> String;
    /// Position of the stepper in the commanded (toolhead) frame.
    fn get_commanded_position(&self) -> f64;
    /// Converts an MCU step position into the commanded frame.
    fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64;

    /// Current position with the commanded-frame offset removed.
    ///
    /// The offset is re-derived on every call, so a homing move that re-bases
    /// the commanded frame does not shift the result.
    fn read(&self) -> f64 {
        let mcu_position_offset = -self.mcu_to_commanded_position(0);
        self.get_commanded_position() + mcu_position_offset
    }
}

pub trait AxisPrerequisiteCheck {
    /// Lower-case letters of the axes that are currently homed.
    fn homed_axes(&self) -> HashSet<char>;
}

pub trait StepperLookup {
    fn get_steppers(&self) -> Vec<Arc<dyn PositionReader>>;

    fn lookup_stepper(&self, name: &str) -> Option<Arc<dyn PositionReader>> {
        self.get_steppers().into_iter().find(|s| s.get_name() == name)
    }
}

/// Everything the extra needs from the motion system.
pub trait Kinematics: AxisPrerequisiteCheck + StepperLookup + Send + Sync {}

impl<T: AxisPrerequisiteCheck + StepperLookup + Send + Sync> Kinematics for T {}

// Lets a shared `Arc<dyn Kinematics>` be handed out as either half.
impl<T: AxisPrerequisiteCheck + ?Sized> AxisPrerequisiteCheck for Arc<T> {
    fn homed_axes(&self) -> HashSet<char> {
        (**self).homed_axes()
    }
}

impl<T: StepperLookup + ?Sized> StepperLookup for Arc<T> {
    fn get_steppers(&self) -> Vec<Arc<dyn PositionReader>> {
        (**self).get_steppers()
    }
}

/// Receives a status line after every attempt. Must not affect control flow.
pub trait ProgressSink {
    fn report(&self, attempt: u32, position: f64, spread: Option<f64>);
}
