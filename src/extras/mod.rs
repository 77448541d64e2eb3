// src/extras/mod.rs
// Optional printer modules loaded from their config sections.

pub mod stable_z_home;
