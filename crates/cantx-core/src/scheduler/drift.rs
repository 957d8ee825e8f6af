//! Timer drift compensation
//!
//! The measured fire interval of a frame is collected in a sliding window.
//! Every time the window is full the mean is compared against the nominal
//! period, the error is integrated and the timer period is corrected by
//! `round(integral * integral_gain)`. The oldest sample is then evicted, so
//! after the first evaluation the controller runs on every tick.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Drift controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Apply the drift correction to running timers
    pub drift_correction: bool,
    /// Gain applied to the accumulated error
    pub integral_gain: f64,
    /// Gain applied to the instantaneous error (0 disables the term)
    pub proportional_gain: f64,
    /// Number of interval samples averaged per evaluation
    pub sample_window: usize,
    /// Floor for a corrected timer period in milliseconds
    pub min_corrected_period_ms: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            drift_correction: true,
            integral_gain: 0.002,
            proportional_gain: 0.0,
            sample_window: 10,
            min_corrected_period_ms: 5,
        }
    }
}

/// Per-frame controller state
#[derive(Debug, Clone, Default)]
pub struct DriftController {
    samples: VecDeque<f64>,
    running_sum: f64,
    integral: f64,
    /// Correction currently applied on top of the nominal period
    offset_ms: i64,
}

impl DriftController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one measured interval.
    ///
    /// Returns the new timer period when the corrected period changed and the
    /// timer has to be restarted.
    pub fn record(
        &mut self,
        interval_ms: f64,
        nominal_ms: u32,
        config: &SchedulerConfig,
    ) -> Option<u32> {
        let window = config.sample_window.max(1);

        self.samples.push_back(interval_ms);
        self.running_sum += interval_ms;
        // A shrunk window drops the surplus before evaluating
        while self.samples.len() > window {
            if let Some(old) = self.samples.pop_front() {
                self.running_sum -= old;
            }
        }
        if self.samples.len() < window {
            return None;
        }

        let mean = self.running_sum / window as f64;
        if let Some(old) = self.samples.pop_front() {
            self.running_sum -= old;
        }
        if !config.drift_correction {
            return None;
        }

        let error = nominal_ms as f64 - mean;
        self.integral += error;
        let correction =
            (error * config.proportional_gain + self.integral * config.integral_gain).round() as i64;
        let corrected = nominal_ms as i64 + correction;

        if corrected == nominal_ms as i64 + self.offset_ms {
            return None;
        }
        self.offset_ms = corrected - nominal_ms as i64;
        let period = corrected.max(config.min_corrected_period_ms as i64);

        tracing::debug!(
            integral = self.integral,
            correction = self.offset_ms,
            nominal = nominal_ms,
            new = period,
            "Drift correction updated period"
        );
        Some(period.clamp(1, u32::MAX as i64) as u32)
    }

    /// Cumulative correction in milliseconds
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn integral_error(&self) -> f64 {
        self.integral
    }

    /// Samples waiting in the window (never more than the window size)
    pub fn recent_intervals(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
