// src/kinematics/mod.rs
// Kinematics types.

pub mod cartesian;

pub const AXIS_NAMES: [char; 3] = ['x', 'y', 'z'];

/// Index of an axis letter (either case) in `AXIS_NAMES`.
pub fn axis_index(axis: char) -> Option<usize> {
    AXIS_NAMES.iter().position(|a| *a == axis.to_ascii_lowercase())
}
