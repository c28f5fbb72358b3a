//! Synthetic spectra and traces for tests.
use std::cell::Cell;

use crate::analysis::{DetectionParams, EngineError, PeakFitEngine};
use crate::arrayops::Trace;
use crate::peak::{DetectedPeak, PeakList};
use crate::shape::{FitReport, PeakModel, ShapeCalibration};

pub fn gaussian(x: f64, mu: f64, sigma: f64, amplitude: f64) -> f64 {
    let u = (x - mu) / sigma;
    amplitude * (-0.5 * u * u).exp()
}

/// A noise-free spectrum of Gaussian `(centre, height)` peaks sharing `sigma`,
/// sampled every `step` from `lo` to `hi`
pub fn synthetic_spectrum(
    peaks: &[(f64, f64)],
    sigma: f64,
    lo: f64,
    hi: f64,
    step: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n = ((hi - lo) / step).round() as usize + 1;
    let x: Vec<f64> = (0..n).map(|i| lo + i as f64 * step).collect();
    let y = x
        .iter()
        .map(|xi| peaks.iter().map(|(mu, h)| gaussian(*xi, *mu, sigma, *h)).sum())
        .collect();
    (x, y)
}

/// A small deterministic zero-mean disturbance
pub fn jitter(i: usize, amplitude: f64) -> f64 {
    let i = i as f64;
    amplitude * (1.7 * i).sin() * (0.37 * i).cos()
}

pub const RAW_START: f64 = 25e-6;
pub const RAW_STEP: f64 = 0.5e-9;
pub const RAW_LENGTH: usize = 20000;

/// Time offset of the calibration the raw trace is generated with
pub const TRUE_OFFSET: f64 = -0.5e-6;
/// The flight time of the mass 100 peak in the raw trace
pub const PEAK_TIME: f64 = 30e-6;

pub fn true_scale() -> f64 {
    100.0 / (PEAK_TIME - TRUE_OFFSET).powi(2)
}

pub fn true_mass(t: f64) -> f64 {
    true_scale() * (t - TRUE_OFFSET).powi(2)
}

/// A raw detector trace in seconds and volts: an inverted, drifting, wavy
/// baseline with a little noise and one sharp peak at [`PEAK_TIME`]
pub fn raw_trace() -> Trace<'static> {
    let (t, v): (Vec<f64>, Vec<f64>) = (0..RAW_LENGTH)
        .map(|i| {
            let t = RAW_START + i as f64 * RAW_STEP;
            let t_us = t * 1e6;
            let signal = 5.0 + 0.5 * (t_us - 25.0)
                - 0.2 * (std::f64::consts::PI * (t_us - 25.0)).sin()
                + jitter(i, 0.01)
                + gaussian(t_us, PEAK_TIME * 1e6, 0.003, 50.0);
            (t, -signal / 1000.0)
        })
        .unzip();
    Trace::from_vecs(t, v).unwrap()
}

/// [`raw_trace`] in the comma separated input format
pub fn raw_csv() -> String {
    raw_trace()
        .iter()
        .map(|(t, v)| format!("{t:e},{v:e}\n"))
        .collect()
}

/// A [`PeakFitEngine`] that reports a fixed list of peaks and counts how
/// often detection runs
pub struct FixedEngine {
    pub masses: Vec<f64>,
    pub detections: Cell<usize>,
    pub fail_fit: bool,
}

impl FixedEngine {
    pub fn new(masses: &[f64]) -> Self {
        Self {
            masses: masses.to_vec(),
            detections: Cell::new(0),
            fail_fit: false,
        }
    }
}

impl PeakFitEngine for FixedEngine {
    fn detect_peaks(
        &self,
        _spectrum: &Trace,
        params: &DetectionParams,
    ) -> Result<PeakList, EngineError> {
        assert_eq!(params.smoothing_length, 9);
        self.detections.set(self.detections.get() + 1);
        Ok(PeakList::new(
            self.masses
                .iter()
                .map(|mz| DetectedPeak::new(*mz, 1.0, 0, params.threshold, 0.01))
                .collect(),
        ))
    }

    fn determine_peak_shape(
        &self,
        _spectrum: &Trace,
        peaks: &PeakList,
        shape_calibrant: usize,
        _fit_range: f64,
    ) -> Result<ShapeCalibration, EngineError> {
        let mz = peaks[shape_calibrant].mz;
        Ok(ShapeCalibration {
            model: PeakModel::gaussian(0.01),
            calibrant_mz: mz,
            fitted_centre: mz,
            fitted_area: 1.0,
            fwhm: 0.0235,
            reduced_chi_square: 0.0,
            converged: true,
        })
    }

    fn fit_peaks(
        &self,
        _spectrum: &Trace,
        _peaks: &PeakList,
        shape: &ShapeCalibration,
        _mass_calibrant: usize,
        _fit_range: f64,
        calibrant_mass: f64,
    ) -> Result<FitReport, EngineError> {
        if self.fail_fit {
            return Err(EngineError::Other("fit exploded".to_string()));
        }
        Ok(FitReport {
            shape: shape.clone(),
            calibrant_mass,
            recalibration_factor: calibrant_mass / shape.fitted_centre,
            peaks: Vec::new(),
            reduced_chi_square: 0.0,
            iterations: 1,
            converged: true,
        })
    }
}
