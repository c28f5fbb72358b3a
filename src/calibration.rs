//! Time-of-flight to mass calibration.
//!
//! Ions accelerated through the same potential reach the detector after a
//! time proportional to the square root of their mass to charge ratio, so
//! `mass = a * (t - b)^2` where `b` absorbs the trigger offset. The two
//! constants are fitted to calibrant peaks of known mass by non-linear least
//! squares.
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arrayops::{Trace, TraceError};
use crate::least_squares::{LeastSquaresError, LeastSquaresProblem, LevenbergMarquardt, Termination};

pub const MICROSECONDS_TO_SECONDS: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("At least 2 calibrant peaks are required, received {0}")]
    TooFewCalibrants(usize),
    #[error("Received {0} calibrant masses but {1} flight times")]
    LengthMismatch(usize, usize),
    #[error("Calibrant masses and flight times must be finite")]
    NonFiniteInput,
    #[error("The calibration fit did not converge ({0:?})")]
    DidNotConverge(Termination),
    #[error("The calibration fit failed: {0}")]
    LeastSquares(#[from] LeastSquaresError),
    #[error(transparent)]
    Window(#[from] TraceError),
    #[error("The trace holds no samples")]
    EmptyTrace,
}

/// Known calibrant masses and where they were observed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Calibrant masses in amu/q
    pub masses: Vec<f64>,
    /// Calibrant flight times in seconds, paired with `masses` by position
    pub times: Vec<f64>,
    /// The `(a, b)` the fit starts from
    pub initial_guess: (f64, f64),
    /// The number of samples to keep after calibration
    pub window_length: usize,
    pub allow_truncated_window: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            masses: Vec::new(),
            times: Vec::new(),
            initial_guess: (1e12, 1e-5),
            window_length: 30000,
            allow_truncated_window: false,
        }
    }
}

impl CalibrationConfig {
    pub fn new(masses: Vec<f64>, times: Vec<f64>) -> Self {
        Self {
            masses,
            times,
            ..Default::default()
        }
    }

    pub fn initial_guess(mut self, a: f64, b: f64) -> Self {
        self.initial_guess = (a, b);
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

struct QuadraticFlightTime<'a> {
    masses: &'a [f64],
    times: &'a [f64],
}

impl LeastSquaresProblem for QuadraticFlightTime<'_> {
    fn observation_count(&self) -> usize {
        self.masses.len()
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let (a, b) = (params[0], params[1]);
        DVector::from_iterator(
            self.masses.len(),
            self.times
                .iter()
                .zip(self.masses.iter())
                .map(|(t, m)| a * (t - b).powi(2) - m),
        )
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let (a, b) = (params[0], params[1]);
        DMatrix::from_fn(self.times.len(), 2, |i, j| {
            let dt = self.times[i] - b;
            if j == 0 {
                dt * dt
            } else {
                -2.0 * a * dt
            }
        })
    }
}

/// The fitted relation `mass = a * (t - b)^2`, `t` in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassCalibration {
    pub a: f64,
    pub b: f64,
    /// Half the sum of squared mass residuals at the calibrants
    pub cost: f64,
    pub iterations: usize,
}

impl MassCalibration {
    /// Build a calibration from known constants
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            a,
            b,
            cost: 0.0,
            iterations: 0,
        }
    }

    /// Fit `a` and `b` to calibrant `masses` observed at flight `times` (seconds),
    /// starting from the default initial guess
    pub fn fit(masses: &[f64], times: &[f64]) -> Result<Self, CalibrationError> {
        let (a, b) = CalibrationConfig::default().initial_guess;
        Self::fit_from(masses, times, (a, b))
    }

    /// Fit `a` and `b` starting from `initial`
    pub fn fit_from(
        masses: &[f64],
        times: &[f64],
        initial: (f64, f64),
    ) -> Result<Self, CalibrationError> {
        if masses.len() != times.len() {
            return Err(CalibrationError::LengthMismatch(masses.len(), times.len()));
        }
        if masses.len() < 2 {
            return Err(CalibrationError::TooFewCalibrants(masses.len()));
        }
        if !masses
            .iter()
            .chain(times.iter())
            .chain([initial.0, initial.1].iter())
            .all(|v| v.is_finite())
        {
            return Err(CalibrationError::NonFiniteInput);
        }

        let problem = QuadraticFlightTime { masses, times };
        let fit = LevenbergMarquardt::default()
            .minimize(&problem, DVector::from_vec(vec![initial.0, initial.1]))?;
        if !fit.converged() {
            warn!(
                "Calibration stopped after {} iterations at a={:e}, b={:e}",
                fit.iterations, fit.params[0], fit.params[1]
            );
            return Err(CalibrationError::DidNotConverge(fit.termination));
        }
        let calibration = Self {
            a: fit.params[0],
            b: fit.params[1],
            cost: fit.cost,
            iterations: fit.iterations,
        };
        info!(
            "Calibrated a={:e}, b={:e} in {} iterations ({:?})",
            calibration.a, calibration.b, calibration.iterations, fit.termination
        );
        Ok(calibration)
    }

    /// The mass of an ion arriving at `t` seconds
    #[inline]
    pub fn mass_at(&self, t: f64) -> f64 {
        self.a * (t - self.b).powi(2)
    }

    /// Convert a trace in microseconds to mass, keeping its amplitudes
    pub fn apply(&self, trace: &Trace) -> Trace<'static> {
        let mass: Vec<f64> = trace
            .x
            .iter()
            .map(|t| self.mass_at(t * MICROSECONDS_TO_SECONDS))
            .collect();
        Trace {
            x: mass.into(),
            y: trace.y.to_vec().into(),
        }
    }
}

/// Fits a [`MassCalibration`] from its configuration and applies it to
/// preprocessed traces
#[derive(Debug, Clone, Default)]
pub struct Calibrator {
    pub config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn fit(&self) -> Result<MassCalibration, CalibrationError> {
        MassCalibration::fit_from(
            &self.config.masses,
            &self.config.times,
            self.config.initial_guess,
        )
    }

    /// Fit the calibration and convert `trace` (microseconds) to mass, windowed
    /// from the sample with the smallest mass.
    pub fn calibrate(
        &self,
        trace: &Trace,
    ) -> Result<(MassCalibration, Trace<'static>), CalibrationError> {
        let calibration = self.fit()?;
        let calibrated = self.calibrate_with(trace, &calibration)?;
        Ok((calibration, calibrated))
    }

    /// Convert `trace` with an existing `calibration`
    pub fn calibrate_with(
        &self,
        trace: &Trace,
        calibration: &MassCalibration,
    ) -> Result<Trace<'static>, CalibrationError> {
        let converted = calibration.apply(trace);
        let start = converted.argmin_x().ok_or(CalibrationError::EmptyTrace)?;
        debug!(
            "Windowing calibrated trace from index {start} ({:.6} amu/q)",
            converted.x[start]
        );
        let window = converted.window(
            start,
            self.config.window_length,
            self.config.allow_truncated_window,
        )?;
        Ok(window.into_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data::{true_mass, true_scale, TRUE_OFFSET};
    use rstest::rstest;

    #[rstest]
    #[case(vec![26e-6, 34e-6])]
    #[case(vec![25.5e-6, 28e-6, 30e-6, 33.5e-6])]
    fn test_fit_recovers_constants(#[case] times: Vec<f64>) {
        let masses: Vec<f64> = times.iter().map(|t| true_mass(*t)).collect();
        let calibration = MassCalibration::fit(&masses, &times).unwrap();
        assert!(
            ((calibration.a - true_scale()) / true_scale()).abs() < 1e-6,
            "{calibration:?}"
        );
        assert!((calibration.b - TRUE_OFFSET).abs() < 1e-11, "{calibration:?}");
        for (t, m) in times.iter().zip(masses.iter()) {
            assert!((calibration.mass_at(*t) - m).abs() / m < 1e-6);
        }
    }

    #[test]
    fn test_fit_errors() {
        assert_eq!(
            MassCalibration::fit(&[100.0], &[30e-6]),
            Err(CalibrationError::TooFewCalibrants(1))
        );
        assert_eq!(
            MassCalibration::fit(&[100.0, 120.0], &[30e-6]),
            Err(CalibrationError::LengthMismatch(2, 1))
        );
        assert_eq!(
            MassCalibration::fit(&[100.0, f64::NAN], &[30e-6, 33e-6]),
            Err(CalibrationError::NonFiniteInput)
        );
    }

    #[test]
    fn test_apply_and_window() {
        let calibration = MassCalibration::new(true_scale(), TRUE_OFFSET);
        let trace: Trace = (0..100)
            .map(|i| (25.0 + i as f64 * 0.1, i as f64))
            .collect::<Vec<_>>()
            .into();
        let calibrated = calibration.apply(&trace);
        assert_eq!(calibrated.len(), 100);
        assert_eq!(calibrated.y, trace.y);
        assert!((calibrated.x[50] - 100.0).abs() < 1e-9);

        let calibrator = Calibrator::new(CalibrationConfig::default().window_length(60));
        let windowed = calibrator.calibrate_with(&trace, &calibration).unwrap();
        assert_eq!(windowed.len(), 60);
        assert_eq!(windowed.y[0], 0.0);

        let calibrator = Calibrator::new(CalibrationConfig::default());
        assert!(matches!(
            calibrator.calibrate_with(&trace, &calibration),
            Err(CalibrationError::Window(TraceError::WindowOutOfBounds { .. }))
        ));
    }

    #[test]
    fn test_calibrate() {
        let times = vec![26e-6, 34e-6];
        let masses = times.iter().map(|t| true_mass(*t)).collect();
        let calibrator =
            Calibrator::new(CalibrationConfig::new(masses, times).window_length(10));
        let trace: Trace = (0..20)
            .map(|i| (29.0 + i as f64 * 0.1, 1.0))
            .collect::<Vec<_>>()
            .into();
        let (calibration, calibrated) = calibrator.calibrate(&trace).unwrap();
        assert!(calibration.iterations > 0);
        assert_eq!(calibrated.len(), 10);
        assert!((calibrated.x[10 - 1] - true_mass(29.9e-6)).abs() < 1e-3);
    }
}
