//! Algorithm for finding peaks in a densely sampled spectrum by their curvature.
//!
//! The spectrum is smoothed, then each sample is scored by the negative second
//! derivative of the smoothed signal, scaled down by the local signal level.
//! Local maxima of that score which are tall and wide enough are peaks, so
//! shoulders and partially resolved neighbours are found even when the signal
//! itself has no local maximum between them.
use log::{debug, trace};

use thiserror::Error;

use crate::arrayops::{is_increasing, mean_spacing};
use crate::peak::{DetectedPeak, PeakList};
use crate::peak_statistics::{peak_width, quadratic_fit};
use crate::smooth::{smooth, SmoothingError, WindowKind};

/// Added to the smoothed signal when scaling the curvature, so that empty
/// baseline regions are not amplified.
pub const CURVATURE_OFFSET: f64 = 10.0;

/// All the ways peak picking can fail
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeakPickerError {
    #[error("The mass and intensity arrays do not match in length ({0} != {1})")]
    LengthMismatch(usize, usize),
    #[error("The mass array is not sorted")]
    NotSorted,
    #[error("At least 3 points are required to detect peaks, received {0}")]
    TooFewPoints(usize),
    #[error("Failed to smooth the spectrum: {0}")]
    Smoothing(#[from] SmoothingError),
}

/// A curvature peak picker for mass spectra
#[derive(Debug, Clone, PartialEq)]
pub struct PeakPicker {
    /// The minimum height of the scaled curvature at a peak apex
    pub threshold: f64,
    /// The minimum curvature peak width in mass units
    pub min_width: f64,
    pub smoothing_window: WindowKind,
    /// The number of points in the smoothing kernel, an odd number
    pub smoothing_length: usize,
}

impl Default for PeakPicker {
    fn default() -> Self {
        Self {
            threshold: 8e-3,
            min_width: 1e-4,
            smoothing_window: WindowKind::Bartlett,
            smoothing_length: 9,
        }
    }
}

/// A builder for configuring [`PeakPicker`]
#[derive(Debug, Clone, Default)]
pub struct PeakPickerBuilder {
    picker: PeakPicker,
}

impl PeakPickerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threshold(&mut self, threshold: f64) -> &mut Self {
        self.picker.threshold = threshold;
        self
    }

    pub fn min_width(&mut self, min_width: f64) -> &mut Self {
        self.picker.min_width = min_width;
        self
    }

    pub fn smoothing_window(&mut self, smoothing_window: WindowKind) -> &mut Self {
        self.picker.smoothing_window = smoothing_window;
        self
    }

    pub fn smoothing_length(&mut self, smoothing_length: usize) -> &mut Self {
        self.picker.smoothing_length = smoothing_length;
        self
    }

    pub fn build(&self) -> PeakPicker {
        self.picker.clone()
    }
}

impl From<PeakPickerBuilder> for PeakPicker {
    fn from(value: PeakPickerBuilder) -> Self {
        value.picker
    }
}

/// Score every sample by `-s''(x) / (s(x) + CURVATURE_OFFSET)`. The end points
/// have no neighbours and score zero.
pub fn scaled_curvature(smoothed: &[f64]) -> Vec<f64> {
    let n = smoothed.len();
    let mut curvature = vec![0.0; n];
    for i in 1..n.saturating_sub(1) {
        let second = smoothed[i + 1] - 2.0 * smoothed[i] + smoothed[i - 1];
        curvature[i] = -second / (smoothed[i] + CURVATURE_OFFSET);
    }
    curvature
}

/// Find the local maxima of `values`, taking the middle of flat tops
pub fn local_maxima(values: &[f64]) -> Vec<usize> {
    let mut maxima = Vec::new();
    let n = values.len();
    if n < 3 {
        return maxima;
    }
    let mut i = 1;
    while i < n - 1 {
        if values[i - 1] < values[i] {
            let mut ahead = i + 1;
            while ahead < n - 1 && values[ahead] == values[i] {
                ahead += 1;
            }
            if values[ahead] < values[i] {
                maxima.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    maxima
}

impl PeakPicker {
    pub fn new(
        threshold: f64,
        min_width: f64,
        smoothing_window: WindowKind,
        smoothing_length: usize,
    ) -> Self {
        Self {
            threshold,
            min_width,
            smoothing_window,
            smoothing_length,
        }
    }

    fn validate(&self, mz_array: &[f64], intensity_array: &[f64]) -> Result<(), PeakPickerError> {
        if mz_array.len() != intensity_array.len() {
            return Err(PeakPickerError::LengthMismatch(
                mz_array.len(),
                intensity_array.len(),
            ));
        }
        if mz_array.len() < 3 {
            return Err(PeakPickerError::TooFewPoints(mz_array.len()));
        }
        if !is_increasing(mz_array) {
            return Err(PeakPickerError::NotSorted);
        }
        Ok(())
    }

    /// Pick peaks from `mz_array` and `intensity_array`, pushing new peaks into `peak_accumulator`.
    ///
    /// Returns the number of peaks picked if successful.
    ///
    /// This is a thin wrapper around [`PeakPicker::discover_peaks_in_interval`].
    pub fn discover_peaks(
        &self,
        mz_array: &[f64],
        intensity_array: &[f64],
        peak_accumulator: &mut Vec<DetectedPeak>,
    ) -> Result<usize, PeakPickerError> {
        match (mz_array.first(), mz_array.last()) {
            (Some(start_mz), Some(stop_mz)) => self.discover_peaks_in_interval(
                mz_array,
                intensity_array,
                peak_accumulator,
                *start_mz,
                *stop_mz,
            ),
            _ => Err(PeakPickerError::TooFewPoints(0)),
        }
    }

    /// Pick peaks from `mz_array` and `intensity_array` whose apex lies between
    /// `start_mz` and `stop_mz`, pushing new peaks into `peak_accumulator`.
    ///
    /// The whole spectrum is smoothed so peaks near the interval edges see the
    /// same signal they would in a full scan.
    ///
    /// Returns the number of peaks picked if successful
    pub fn discover_peaks_in_interval(
        &self,
        mz_array: &[f64],
        intensity_array: &[f64],
        peak_accumulator: &mut Vec<DetectedPeak>,
        start_mz: f64,
        stop_mz: f64,
    ) -> Result<usize, PeakPickerError> {
        self.validate(mz_array, intensity_array)?;
        let n = mz_array.len();
        let m = peak_accumulator.len();

        let smoothed = smooth(intensity_array, self.smoothing_window, self.smoothing_length)?;
        let curvature = scaled_curvature(&smoothed);
        let bin_width = mean_spacing(mz_array).unwrap_or_default();
        let min_width_bins = if bin_width > 0.0 {
            self.min_width / bin_width
        } else {
            0.0
        };
        debug!(
            "Detecting peaks over {n} points with bin width {bin_width:e}, minimum width {min_width_bins:.3} bins"
        );

        for index in local_maxima(&curvature) {
            let height = curvature[index];
            let current_mz = mz_array[index];
            if current_mz < start_mz || current_mz > stop_mz {
                continue;
            }
            if height < self.threshold {
                continue;
            }
            let width = peak_width(&curvature, index, 0.5);
            if width < min_width_bins {
                trace!("Skipping curvature peak at {current_mz:.6} with width {width:.3} bins");
                continue;
            }
            let fitted_mz = quadratic_fit(mz_array, &curvature, index);
            peak_accumulator.push(DetectedPeak::new(
                fitted_mz,
                smoothed[index] as f32,
                index,
                height,
                width * bin_width,
            ));
        }
        Ok(peak_accumulator.len() - m)
    }

    /// Pick peaks from the whole spectrum, collected into a [`PeakList`]
    pub fn pick(
        &self,
        mz_array: &[f64],
        intensity_array: &[f64],
    ) -> Result<PeakList, PeakPickerError> {
        let mut acc = Vec::new();
        self.discover_peaks(mz_array, intensity_array, &mut acc)?;
        Ok(PeakList::new(acc))
    }
}

/// A convenience function that uses a default peak picking configuration with a custom
/// curvature `threshold` to pick peaks from paired mass and intensity arrays.
pub fn pick_peaks(
    mz_array: &[f64],
    intensity_array: &[f64],
    threshold: f64,
) -> Result<PeakList, PeakPickerError> {
    let picker = PeakPicker {
        threshold,
        ..PeakPicker::default()
    };
    picker.pick(mz_array, intensity_array)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::prelude::*;
    use crate::test_data::synthetic_spectrum;
    use rstest::rstest;

    #[test]
    fn test_local_maxima() {
        let values = [0.0, 1.0, 0.0, 2.0, 2.0, 2.0, 1.0, 3.0];
        assert_eq!(local_maxima(&values), vec![1, 4]);
    }

    #[test]
    fn test_curvature_of_parabola() {
        let s: Vec<f64> = (0..7).map(|i| -((i as f64 - 3.0).powi(2))).collect();
        let c = scaled_curvature(&s);
        assert_eq!(c[0], 0.0);
        assert!((c[3] - 2.0 / CURVATURE_OFFSET).abs() < 1e-12);
    }

    #[test_log::test]
    fn test_single_peak() {
        let (x, y) = synthetic_spectrum(&[(100.0, 40.0)], 0.01, 99.0, 101.0, 0.002);
        let mut acc = Vec::new();
        let count = PeakPicker::default().discover_peaks(&x, &y, &mut acc).unwrap();
        assert_eq!(count, 1, "{acc:?}");
        assert!((acc[0].mz - 100.0).abs() < 1e-3, "{}", acc[0]);
        assert!(acc[0].curvature > 8e-3);
        assert!(acc[0].width > 0.0);
    }

    #[test_log::test]
    fn test_two_separated_peaks() {
        let (x, y) = synthetic_spectrum(&[(100.0, 40.0), (100.3, 25.0)], 0.01, 99.0, 101.0, 0.002);
        let peaks = pick_peaks(&x, &y, 8e-3).unwrap();
        assert_eq!(peaks.len(), 2, "{peaks:?}");
        assert!((peaks[0].mz() - 100.0).abs() < 1e-3);
        assert!((peaks[1].mz() - 100.3).abs() < 1e-3);
        assert_eq!(peaks[1].get_index(), 1);
    }

    #[test]
    fn test_interval_restriction() {
        let (x, y) = synthetic_spectrum(&[(100.0, 40.0), (100.3, 25.0)], 0.01, 99.0, 101.0, 0.002);
        let mut acc = Vec::new();
        let count = PeakPicker::default()
            .discover_peaks_in_interval(&x, &y, &mut acc, 100.2, 100.4)
            .unwrap();
        assert_eq!(count, 1);
        assert!((acc[0].mz - 100.3).abs() < 1e-3);
    }

    #[rstest]
    #[case(1.0, 0)]
    #[case(8e-3, 1)]
    fn test_threshold(#[case] threshold: f64, #[case] expected: usize) {
        let (x, y) = synthetic_spectrum(&[(100.0, 40.0)], 0.01, 99.0, 101.0, 0.002);
        let mut builder = PeakPickerBuilder::new();
        builder.threshold(threshold);
        let peaks = builder.build().pick(&x, &y).unwrap();
        assert_eq!(peaks.len(), expected);
    }

    #[test]
    fn test_min_width() {
        let (x, y) = synthetic_spectrum(&[(100.0, 40.0)], 0.01, 99.0, 101.0, 0.002);
        let mut builder = PeakPickerBuilder::new();
        builder.min_width(1.0).smoothing_window(WindowKind::Hanning);
        let peaks = builder.build().pick(&x, &y).unwrap();
        assert!(peaks.is_empty());
    }

    #[test]
    fn test_errors() {
        let picker = PeakPicker::default();
        let mut acc = Vec::new();
        assert_eq!(
            picker.discover_peaks(&[1.0, 2.0, 3.0], &[1.0, 2.0], &mut acc),
            Err(PeakPickerError::LengthMismatch(3, 2))
        );
        assert_eq!(
            picker.discover_peaks(&[1.0, 2.0], &[1.0, 2.0], &mut acc),
            Err(PeakPickerError::TooFewPoints(2))
        );
        assert_eq!(
            picker.discover_peaks(&[3.0, 2.0, 1.0], &[1.0, 2.0, 1.0], &mut acc),
            Err(PeakPickerError::NotSorted)
        );
        assert_eq!(
            picker.discover_peaks(&[1.0, 2.0, 3.0, 4.0], &[1.0, 2.0, 1.0, 0.0], &mut acc),
            Err(PeakPickerError::Smoothing(SmoothingError::WindowLengthTooLong(9, 4)))
        );
    }
}
