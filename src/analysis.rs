//! Peak detection and fitting around a target mass.
//!
//! The [`Analyzer`] cuts a window out of a calibrated spectrum, asks a
//! [`PeakFitEngine`] for the peaks in it, and fits the peak shape and
//! positions for every detected peak close enough to the target.
use std::fmt;

use log::{debug, info};
use mzpeaks::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arrayops::Trace;
use crate::peak::{DetectedPeak, PeakList};
use crate::peak_picker::{PeakPicker, PeakPickerError};
use crate::shape::{self, FitReport, PeakShapeKind, ShapeCalibration, ShapeFitError};
use crate::smooth::WindowKind;

/// Failures raised by a [`PeakFitEngine`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Peak detection failed: {0}")]
    Detection(#[from] PeakPickerError),
    #[error("Peak fitting failed: {0}")]
    Fit(#[from] ShapeFitError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("No peak found within {precision} of {peak} among {detected} detected peaks")]
    NoPeakFound {
        peak: f64,
        precision: f64,
        detected: usize,
    },
    #[error("The window of width {window_size} around {peak} holds no samples")]
    EmptyWindow { peak: f64, window_size: f64 },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Which detected peaks an [`AnalysisResult`] reports
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportedPeaks {
    /// Every peak found in the analysis window
    #[default]
    AllDetected,
    /// Only the peaks within the precision tolerance of the target
    WithinTolerance,
}

impl fmt::Display for ReportedPeaks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllDetected => f.write_str("all-detected"),
            Self::WithinTolerance => f.write_str("within-tolerance"),
        }
    }
}

/// Parameters passed to [`PeakFitEngine::detect_peaks`]
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionParams {
    pub threshold: f64,
    pub min_width: f64,
    pub smoothing_window: WindowKind,
    pub smoothing_length: usize,
}

/// The peak detection and fitting collaborator of an [`Analyzer`]
pub trait PeakFitEngine {
    /// Find the peaks in `spectrum`, sorted by mass
    fn detect_peaks(
        &self,
        spectrum: &Trace,
        params: &DetectionParams,
    ) -> Result<PeakList, EngineError>;

    /// Learn the peak shape from the peak at position `shape_calibrant` of `peaks`
    fn determine_peak_shape(
        &self,
        spectrum: &Trace,
        peaks: &PeakList,
        shape_calibrant: usize,
        fit_range: f64,
    ) -> Result<ShapeCalibration, EngineError>;

    /// Fit the peaks around the peak at position `mass_calibrant` of `peaks`
    /// with the learned `shape`, assigning it `calibrant_mass`
    fn fit_peaks(
        &self,
        spectrum: &Trace,
        peaks: &PeakList,
        shape: &ShapeCalibration,
        mass_calibrant: usize,
        fit_range: f64,
        calibrant_mass: f64,
    ) -> Result<FitReport, EngineError>;
}

/// A [`PeakFitEngine`] built on [`PeakPicker`] and the fits in [`crate::shape`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeFitEngine {
    pub shape: PeakShapeKind,
    pub resolving_power: f64,
}

impl Default for ShapeFitEngine {
    fn default() -> Self {
        Self {
            shape: PeakShapeKind::Gaussian,
            resolving_power: 1e4,
        }
    }
}

impl PeakFitEngine for ShapeFitEngine {
    fn detect_peaks(
        &self,
        spectrum: &Trace,
        params: &DetectionParams,
    ) -> Result<PeakList, EngineError> {
        let picker = PeakPicker::new(
            params.threshold,
            params.min_width,
            params.smoothing_window,
            params.smoothing_length,
        );
        Ok(picker.pick(&spectrum.x, &spectrum.y)?)
    }

    fn determine_peak_shape(
        &self,
        spectrum: &Trace,
        peaks: &PeakList,
        shape_calibrant: usize,
        fit_range: f64,
    ) -> Result<ShapeCalibration, EngineError> {
        Ok(shape::determine_peak_shape(
            &spectrum.x,
            &spectrum.y,
            peaks,
            shape_calibrant,
            fit_range,
            self.shape,
            self.resolving_power,
        )?)
    }

    fn fit_peaks(
        &self,
        spectrum: &Trace,
        peaks: &PeakList,
        shape: &ShapeCalibration,
        mass_calibrant: usize,
        fit_range: f64,
        calibrant_mass: f64,
    ) -> Result<FitReport, EngineError> {
        Ok(shape::fit_peaks(
            &spectrum.x,
            &spectrum.y,
            peaks,
            shape,
            mass_calibrant,
            fit_range,
            calibrant_mass,
        )?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// The largest distance from the target a candidate peak may have
    pub precision: f64,
    pub smoothing_window: WindowKind,
    pub smoothing_length: usize,
    /// The narrowest accepted curvature peak, in mass units
    pub min_width: f64,
    /// How far around a calibrant the shape and mass fits reach
    pub fit_range: f64,
    /// Used to guess peak widths that cannot be measured
    pub resolving_power: f64,
    pub shape: PeakShapeKind,
    pub reported_peaks: ReportedPeaks,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            precision: 1.0,
            smoothing_window: WindowKind::Bartlett,
            smoothing_length: 9,
            min_width: 1e-4,
            fit_range: 1.5,
            resolving_power: 1e4,
            shape: PeakShapeKind::Gaussian,
            reported_peaks: ReportedPeaks::AllDetected,
        }
    }
}

impl AnalysisConfig {
    pub fn precision(mut self, precision: f64) -> Self {
        self.precision = precision;
        self
    }

    pub fn fit_range(mut self, fit_range: f64) -> Self {
        self.fit_range = fit_range;
        self
    }

    pub fn shape(mut self, shape: PeakShapeKind) -> Self {
        self.shape = shape;
        self
    }

    pub fn reported_peaks(mut self, reported_peaks: ReportedPeaks) -> Self {
        self.reported_peaks = reported_peaks;
        self
    }

    pub fn engine(&self) -> ShapeFitEngine {
        ShapeFitEngine {
            shape: self.shape,
            resolving_power: self.resolving_power,
        }
    }
}

/// The target of one analysis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisRequest {
    /// The expected mass of the peak
    pub peak: f64,
    /// The width of the mass window centred on `peak`
    pub window_size: f64,
    /// The minimum scaled curvature of a detected peak
    pub threshold: f64,
}

impl AnalysisRequest {
    pub fn new(peak: f64, window_size: f64) -> Self {
        Self {
            peak,
            window_size,
            threshold: 8e-3,
        }
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    /// The masses of the reported peaks, see [`ReportedPeaks`]
    pub peaks: Vec<f64>,
    /// The detected peaks within tolerance of the target
    pub candidates: Vec<DetectedPeak>,
    /// The number of `candidates`
    pub count: usize,
    /// One fit per candidate, in the same order
    pub reports: Vec<FitReport>,
}

/// Runs detection and fitting around a target mass
#[derive(Debug, Clone)]
pub struct Analyzer<E: PeakFitEngine = ShapeFitEngine> {
    pub config: AnalysisConfig,
    pub engine: E,
}

impl Analyzer<ShapeFitEngine> {
    pub fn new(config: AnalysisConfig) -> Self {
        let engine = config.engine();
        Self { config, engine }
    }
}

impl Default for Analyzer<ShapeFitEngine> {
    fn default() -> Self {
        Self::new(AnalysisConfig::default())
    }
}

impl<E: PeakFitEngine> Analyzer<E> {
    pub fn with_engine(config: AnalysisConfig, engine: E) -> Self {
        Self { config, engine }
    }

    fn detection_params(&self, request: &AnalysisRequest) -> DetectionParams {
        DetectionParams {
            threshold: request.threshold,
            min_width: self.config.min_width,
            smoothing_window: self.config.smoothing_window,
            smoothing_length: self.config.smoothing_length,
        }
    }

    /// Detect the peaks of the calibrated `spectrum` near `request.peak` and fit
    /// every candidate within tolerance.
    pub fn analyze(
        &self,
        spectrum: &Trace,
        request: &AnalysisRequest,
    ) -> Result<AnalysisResult, AnalysisError> {
        let half_width = request.window_size / 2.0;
        let sub_spectrum = spectrum.between(request.peak - half_width, request.peak + half_width);
        if sub_spectrum.is_empty() {
            return Err(AnalysisError::EmptyWindow {
                peak: request.peak,
                window_size: request.window_size,
            });
        }
        debug!(
            "Analyzing {} samples around {} amu/q",
            sub_spectrum.len(),
            request.peak
        );

        let params = self.detection_params(request);
        let peaks = self.engine.detect_peaks(&sub_spectrum, &params)?;
        let precision = self.config.precision;
        let candidates: Vec<DetectedPeak> = peaks
            .iter()
            .filter(|p| (p.mz() - request.peak).abs() < precision)
            .copied()
            .collect();
        info!(
            "Detected {} peaks, {} within {precision} of {}",
            peaks.len(),
            candidates.len(),
            request.peak
        );
        if candidates.is_empty() {
            return Err(AnalysisError::NoPeakFound {
                peak: request.peak,
                precision,
                detected: peaks.len(),
            });
        }

        let mut reports = Vec::with_capacity(candidates.len());
        for candidate in candidates.iter() {
            let peaks = self.engine.detect_peaks(&sub_spectrum, &params)?;
            let position = candidate.get_index() as usize;
            let shape = self.engine.determine_peak_shape(
                &sub_spectrum,
                &peaks,
                position,
                self.config.fit_range,
            )?;
            let report = self.engine.fit_peaks(
                &sub_spectrum,
                &peaks,
                &shape,
                position,
                self.config.fit_range,
                request.peak,
            )?;
            debug!(
                "Candidate {} fitted with recalibration factor {:.9}",
                candidate, report.recalibration_factor
            );
            reports.push(report);
        }

        let reported = match self.config.reported_peaks {
            ReportedPeaks::AllDetected => peaks.iter().map(|p| p.mz()).collect(),
            ReportedPeaks::WithinTolerance => candidates.iter().map(|p| p.mz()).collect(),
        };
        Ok(AnalysisResult {
            peaks: reported,
            count: candidates.len(),
            candidates,
            reports,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_data::{synthetic_spectrum, FixedEngine};

    fn spectrum(peaks: &[(f64, f64)]) -> Trace<'static> {
        let (x, y) = synthetic_spectrum(peaks, 0.01, 99.0, 101.0, 0.002);
        Trace::from_vecs(x, y).unwrap()
    }

    #[test_log::test]
    fn test_single_peak() {
        let data = spectrum(&[(100.0, 40.0)]);
        let analyzer = Analyzer::new(AnalysisConfig::default());
        let result = analyzer
            .analyze(&data, &AnalysisRequest::new(100.0, 1.0))
            .unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.peaks.len(), 1);
        assert!((result.peaks[0] - 100.0).abs() < 1e-3);
        assert_eq!(result.reports.len(), 1);
        let report = &result.reports[0];
        assert!(report.converged, "{report:?}");
        assert!((report.shape.model.sigma - 0.01).abs() < 1e-5);
        assert!((report.recalibration_factor - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_no_peak_found() {
        let data = spectrum(&[(100.0, 40.0)]);
        let analyzer = Analyzer::new(AnalysisConfig::default().precision(0.1));
        let err = analyzer
            .analyze(&data, &AnalysisRequest::new(100.3, 1.0))
            .unwrap_err();
        assert_eq!(
            err,
            AnalysisError::NoPeakFound {
                peak: 100.3,
                precision: 0.1,
                detected: 1
            }
        );
    }

    #[test]
    fn test_empty_window() {
        let data = spectrum(&[(100.0, 40.0)]);
        let err = Analyzer::new(AnalysisConfig::default())
            .analyze(&data, &AnalysisRequest::new(200.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyWindow { .. }));
    }

    #[test_log::test]
    fn test_precision_controls_candidates() {
        let data = spectrum(&[(100.0, 40.0), (100.3, 25.0)]);
        let request = AnalysisRequest::new(100.0, 1.0);

        let narrow = Analyzer::new(AnalysisConfig::default().precision(0.2))
            .analyze(&data, &request)
            .unwrap();
        assert_eq!(narrow.count, 1);
        assert_eq!(narrow.peaks.len(), 2);
        assert_eq!(narrow.reports.len(), 1);

        let wide = Analyzer::new(AnalysisConfig::default()).analyze(&data, &request).unwrap();
        assert_eq!(wide.count, 2);
        assert_eq!(wide.reports.len(), 2);
        let factor = wide.reports[1].recalibration_factor;
        assert!((factor - 100.0 / 100.3).abs() < 1e-6, "{factor}");

        let within = Analyzer::new(
            AnalysisConfig::default()
                .precision(0.2)
                .reported_peaks(ReportedPeaks::WithinTolerance),
        )
        .analyze(&data, &request)
        .unwrap();
        assert_eq!(within.peaks.len(), 1);
        assert!((within.peaks[0] - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_injected_engine() {
        let data = spectrum(&[]);
        let engine = FixedEngine::new(&[99.6, 99.95, 100.05, 100.4]);
        let analyzer = Analyzer::with_engine(AnalysisConfig::default().precision(0.1), engine);
        let result = analyzer
            .analyze(&data, &AnalysisRequest::new(100.0, 1.0))
            .unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.peaks, vec![99.6, 99.95, 100.05, 100.4]);
        assert_eq!(result.candidates[0].mz, 99.95);
        assert_eq!(result.candidates[1].mz, 100.05);
        assert_eq!(analyzer.engine.detections.get(), 3);
        assert!((result.reports[1].recalibration_factor - 100.0 / 100.05).abs() < 1e-12);

        let analyzer = Analyzer::with_engine(
            AnalysisConfig::default()
                .precision(0.1)
                .reported_peaks(ReportedPeaks::WithinTolerance),
            FixedEngine::new(&[99.6, 99.95, 100.05, 100.4]),
        );
        let result = analyzer
            .analyze(&data, &AnalysisRequest::new(100.0, 1.0))
            .unwrap();
        assert_eq!(result.peaks, vec![99.95, 100.05]);
    }

    #[test]
    fn test_engine_errors_propagate() {
        let data = spectrum(&[]);
        let mut engine = FixedEngine::new(&[100.0]);
        engine.fail_fit = true;
        let analyzer = Analyzer::with_engine(AnalysisConfig::default(), engine);
        let err = analyzer
            .analyze(&data, &AnalysisRequest::new(100.0, 1.0))
            .unwrap_err();
        assert_eq!(
            err,
            AnalysisError::Engine(EngineError::Other("fit exploded".to_string()))
        );
    }

    #[test]
    fn test_reported_peaks_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            reported_peaks: ReportedPeaks,
        }
        let parsed: Wrapper = toml::from_str("reported_peaks = \"within-tolerance\"").unwrap();
        assert_eq!(parsed.reported_peaks, ReportedPeaks::WithinTolerance);
        assert_eq!(ReportedPeaks::default().to_string(), "all-detected");
    }
}
