//! Baseline correction and windowing of raw detector traces.
//!
//! A raw trace arrives in seconds and volts with the signal pointing down. It
//! is converted to microseconds and inverted millivolts, then a line fitted
//! to a low-pass filtered copy of the voltage is subtracted from it to remove
//! slow baseline drift. Negative values left after the subtraction are noise
//! and are clamped to zero, and a fixed number of samples is kept starting at
//! the first sample where the corrected trace reaches its minimum.
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arrayops::{argmin, Trace, TraceError};
use crate::filter::{filtfilt, ConfigurationError};
use crate::least_squares::{polyfit, LeastSquaresError};

pub const SECONDS_TO_MICROSECONDS: f64 = 1e6;
/// Converts volts to millivolts and flips the signal upwards
pub const VOLTS_TO_INVERTED_MILLIVOLTS: f64 = -1e3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreprocessError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Window(#[from] TraceError),
    #[error("The trace holds no samples")]
    Empty,
    #[error("Failed to fit the baseline: {0}")]
    LeastSquares(#[from] LeastSquaresError),
}

/// Parameters of the baseline correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// The low-pass cutoff frequency, in the same units as `sampling_rate`
    pub cutoff: f64,
    pub sampling_rate: f64,
    /// The Butterworth filter order
    pub order: usize,
    /// The number of samples to keep
    pub window_length: usize,
    /// Keep a shorter window when the trace ends before `window_length`
    /// samples instead of failing
    pub allow_truncated_window: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            cutoff: 1000.0,
            sampling_rate: 10000.0,
            order: 5,
            window_length: 30000,
            allow_truncated_window: false,
        }
    }
}

impl PreprocessConfig {
    pub fn cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn sampling_rate(mut self, sampling_rate: f64) -> Self {
        self.sampling_rate = sampling_rate;
        self
    }

    pub fn order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    pub fn window_length(mut self, window_length: usize) -> Self {
        self.window_length = window_length;
        self
    }

    pub fn allow_truncated_window(mut self, allow_truncated_window: bool) -> Self {
        self.allow_truncated_window = allow_truncated_window;
        self
    }
}

/// A straight line baseline, `intercept + slope * t` with `t` in microseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub intercept: f64,
    pub slope: f64,
}

impl Baseline {
    /// Fit a line to `voltage` over `time`
    pub fn fit(time: &[f64], voltage: &[f64]) -> Result<Self, LeastSquaresError> {
        let coefficients = polyfit(time, voltage, 1)?;
        Ok(Self {
            intercept: coefficients[0],
            slope: coefficients[1],
        })
    }

    #[inline]
    pub fn at(&self, t: f64) -> f64 {
        self.intercept + self.slope * t
    }
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    pub config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Convert a raw trace to microseconds and inverted millivolts
    pub fn convert_units(trace: &Trace) -> (Vec<f64>, Vec<f64>) {
        let time = trace.x.iter().map(|t| t * SECONDS_TO_MICROSECONDS).collect();
        let voltage = trace
            .y
            .iter()
            .map(|v| v * VOLTS_TO_INVERTED_MILLIVOLTS)
            .collect();
        (time, voltage)
    }

    /// Subtract the baseline fitted to the low-pass filtered `voltage` from
    /// `voltage` itself and clamp the result at zero.
    pub fn correct_baseline(
        &self,
        time: &[f64],
        voltage: &[f64],
    ) -> Result<(Vec<f64>, Baseline), PreprocessError> {
        let filtered = filtfilt(
            voltage,
            self.config.cutoff,
            self.config.sampling_rate,
            self.config.order,
        )?;
        let baseline = Baseline::fit(time, &filtered)?;
        debug!(
            "Baseline slope {:e} mV/us, intercept {:e} mV",
            baseline.slope, baseline.intercept
        );
        let corrected = time
            .iter()
            .zip(voltage.iter())
            .map(|(t, v)| (v - baseline.at(*t)).max(0.0))
            .collect();
        Ok((corrected, baseline))
    }

    /// Run the full baseline correction on `trace` (seconds, volts), returning
    /// the windowed trace in microseconds and millivolts.
    pub fn process(&self, trace: &Trace) -> Result<Trace<'static>, PreprocessError> {
        if trace.is_empty() {
            return Err(PreprocessError::Empty);
        }
        let (time, voltage) = Self::convert_units(trace);
        let (corrected, _) = self.correct_baseline(&time, &voltage)?;
        let start = argmin(&corrected).ok_or(PreprocessError::Empty)?;
        info!(
            "Windowing {} samples from index {start} ({:.4} us)",
            self.config.window_length, time[start]
        );
        let corrected = Trace::from_vecs(time, corrected)?;
        let window = corrected.window(
            start,
            self.config.window_length,
            self.config.allow_truncated_window,
        )?;
        Ok(window.into_owned())
    }
}
