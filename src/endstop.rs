// src/endstop.rs
// Simulated mechanical endstop with a compressible stop.

use crate::configfile::{ConfigError, Configfile};

// Golden angle; spreads successive jitter samples evenly.
const JITTER_PHASE_STEP: f64 = 2.399_963_229_728_653;

/// Trigger point of a homing move against a stop that is still settling.
///
/// Each hit triggers at `position + compression + jitter`, after which the
/// remaining compression is multiplied by `settle_rate`. Jitter is a
/// deterministic bounded wobble of amplitude `jitter`.
#[derive(Debug, Clone)]
pub struct SimulatedEndstop {
    position: f64,
    compression: f64,
    settle_rate: f64,
    jitter: f64,
    hits: u32,
}

impl SimulatedEndstop {
    pub fn new(position: f64, compression: f64, settle_rate: f64, jitter: f64) -> Self {
        SimulatedEndstop { position, compression, settle_rate, jitter, hits: 0 }
    }

    /// Reads `endstop_*` options from a stepper section; the rest position
    /// is supplied by the rail.
    pub fn from_config(config: &Configfile, section: &str, position: f64) -> Result<Self, ConfigError> {
        let compression = config.getfloat(section, "endstop_compression", Some(0.0), Some(0.0), None)?;
        let settle_rate = config.getfloat(section, "endstop_settle_rate", Some(0.5), Some(0.0), None)?;
        if settle_rate >= 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "Option 'endstop_settle_rate' in section '[{}]' ({}) must be below 1", section, settle_rate
            )));
        }
        let jitter = config.getfloat(section, "endstop_jitter", Some(0.0), Some(0.0), None)?;
        Ok(SimulatedEndstop::new(position, compression, settle_rate, jitter))
    }

    pub fn trigger(&mut self) -> f64 {
        self.hits += 1;
        let wobble = self.jitter * (self.hits as f64 * JITTER_PHASE_STEP).sin();
        let triggered_at = self.position + self.compression + wobble;
        self.compression *= self.settle_rate;
        triggered_at
    }
}
