// src/convergence.rs
// Sliding window over the most recent homing readings.

use std::collections::VecDeque;

/// The last `window_size` readings, oldest first.
///
/// The spread is only defined once the window has filled, so two lucky
/// readings can never declare convergence on their own. A size of zero is
/// treated as one.
#[derive(Debug, Clone)]
pub struct ConvergenceWindow {
    window_size: usize,
    readings: VecDeque<f64>,
}

impl ConvergenceWindow {
    pub fn new(window_size: usize) -> Self {
        // Storage grows with the readings; `window_size` may be far larger
        // than the number of attempts a run will ever make.
        Self {
            window_size: window_size.max(1),
            readings: VecDeque::new(),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.readings.push_back(value);
        while self.readings.len() > self.window_size {
            self.readings.pop_front();
        }
    }

    /// `max - min` over the window, or `None` while it is not yet full.
    pub fn spread(&self) -> Option<f64> {
        if !self.is_full() {
            return None;
        }
        let (min, max) = self
            .readings
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Some(max - min)
    }

    pub fn is_full(&self) -> bool {
        self.readings.len() == self.window_size
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn readings(&self) -> impl Iterator<Item = f64> + '_ {
        self.readings.iter().copied()
    }
}
