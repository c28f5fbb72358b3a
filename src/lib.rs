//! `tofsignal` turns raw time-of-flight detector traces into calibrated mass
//! spectra and fits the peaks found around a target mass.
//!
//! A run is a fixed chain of stages, each of which can also be used alone:
//!
//! 1. [`text::load_trace`] reads a comma separated `time,volts` trace.
//! 2. [`Preprocessor`] converts units, removes a linear baseline, applies a
//!    zero-phase [`filter::Butterworth`] low-pass filter and windows the trace
//!    from its minimum.
//! 3. [`Calibrator`] fits `mass = a * (t - b)^2` to calibrant peaks and converts
//!    the time axis to mass.
//! 4. [`Analyzer`] detects peaks near a target mass with the curvature based
//!    [`PeakPicker`], determines the peak shape on each candidate and fits
//!    every neighbouring peak with it.
//! 5. [`text::write_fit_report`] and [`text::save_analysis`] write the results.
//!
//! [`Pipeline`] strings these together, configured by a [`PipelineConfig`]
//! which is usually read from TOML.
//!
//! # Usage
//! ```
//! use tofsignal::PeakPicker;
//!
//! let x: Vec<f64> = (0..1001).map(|i| 99.0 + i as f64 * 0.002).collect();
//! let y: Vec<f64> = x
//!     .iter()
//!     .map(|x| 40.0 * (-0.5 * ((x - 100.0) / 0.01).powi(2)).exp())
//!     .collect();
//!
//! let picker = PeakPicker::default();
//! let mut acc = Vec::new();
//! let peak_count = picker.discover_peaks(&x, &y, &mut acc).unwrap();
//! assert_eq!(peak_count, 1);
//! for peak in acc.iter() {
//!     println!("{}", peak);
//! }
//! ```
pub mod arrayops;
pub mod least_squares;
pub mod search;

pub mod filter;
pub mod smooth;

pub mod peak;
pub mod peak_picker;
pub mod peak_statistics;
pub mod shape;

pub mod analysis;
pub mod calibration;
pub mod preprocess;

pub mod config;
pub mod pipeline;
pub mod text;

pub mod prelude;

#[cfg(test)]
mod test_data;

pub use crate::analysis::{AnalysisError, AnalysisRequest, AnalysisResult, Analyzer};
pub use crate::arrayops::Trace;
pub use crate::calibration::{CalibrationError, Calibrator, MassCalibration};
pub use crate::config::PipelineConfig;
pub use crate::peak::{DetectedPeak, PeakList};
pub use crate::peak_picker::{pick_peaks, PeakPicker, PeakPickerError};
pub use crate::pipeline::{Pipeline, PipelineError, Stage};
pub use crate::preprocess::{PreprocessError, Preprocessor};
pub use crate::shape::{FitReport, PeakModel, PeakShapeKind};
