// src/lib.rs

// Host-side support for repeated Z homing until the Z stepper position
// stabilizes.

pub mod configfile;
pub mod convergence;
pub mod core_traits;
pub mod endstop;
pub mod gcode;
pub mod kinematics;
pub mod stepper;
pub mod toolhead;

pub mod extras;

pub use convergence::ConvergenceWindow;
pub use extras::stable_z_home::{
    AbortReason, Collaborators, Outcome, StabilizationConfig, StabilizationController, StableZHome,
};
