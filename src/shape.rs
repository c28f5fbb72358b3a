//! Peak shape models and least squares fits of detected peaks.
//!
//! Two stages are run per candidate peak. [`determine_peak_shape`] learns the
//! shape parameters from a shape calibrant, fitting every detected peak within
//! the fit range with one shared shape. [`fit_peaks`] then freezes that shape
//! and fits only centres and areas, so the positions of neighbouring peaks
//! are pinned down by a well constrained model. The fitted centre of the mass
//! calibrant gives a recalibration factor that is applied to every peak.
use std::f64::consts::{PI, SQRT_2};
use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use mzpeaks::prelude::*;
use mzpeaks::Tolerance;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arrayops::{argmax, trapz};
use crate::least_squares::{LeastSquaresError, LeastSquaresProblem, LevenbergMarquardt};
use crate::peak::{DetectedPeak, PeakList};
use crate::peak_statistics::full_width_at_half_max;
use crate::search::{find_between, nearest};

/// Conversion factor between the FWHM and standard deviation of a Gaussian
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949;

const ERFCX_ASYMPTOTIC_LIMIT: f64 = 5.0;

/// The functional form fitted to each peak
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakShapeKind {
    #[default]
    Gaussian,
    /// An exponentially modified Gaussian with a tail towards high mass
    Emg,
}

impl PeakShapeKind {
    /// The number of free shape parameters
    pub fn shape_parameters(&self) -> usize {
        match self {
            Self::Gaussian => 1,
            Self::Emg => 2,
        }
    }
}

impl fmt::Display for PeakShapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gaussian => f.write_str("gaussian"),
            Self::Emg => f.write_str("emg"),
        }
    }
}

impl FromStr for PeakShapeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" | "gauss" => Ok(Self::Gaussian),
            "emg" => Ok(Self::Emg),
            _ => Err(format!("Unknown peak shape {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeFitError {
    #[error("{points} points cannot constrain {parameters} parameters")]
    TooFewPoints { points: usize, parameters: usize },
    #[error("There is no detected peak at position {0}")]
    UnknownPeak(usize),
    #[error("The fit produced non-finite parameters")]
    NonFinite,
    #[error("The fitted calibrant centre {0} cannot be used for recalibration")]
    InvalidCalibrant(f64),
    #[error(transparent)]
    LeastSquares(#[from] LeastSquaresError),
}

/// Asymptotic expansion of the scaled complementary error function
/// `exp(z^2) * erfc(z)` for large `z`
fn erfcx_asymptotic(z: f64) -> f64 {
    let z2 = z * z;
    (1.0 - 1.0 / (2.0 * z2) + 3.0 / (4.0 * z2 * z2)) / (z * PI.sqrt())
}

/// A peak shape with unit area
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakModel {
    pub kind: PeakShapeKind,
    pub sigma: f64,
    /// The exponential decay constant, zero for a Gaussian
    pub tau: f64,
}

impl PeakModel {
    pub fn gaussian(sigma: f64) -> Self {
        Self {
            kind: PeakShapeKind::Gaussian,
            sigma,
            tau: 0.0,
        }
    }

    pub fn emg(sigma: f64, tau: f64) -> Self {
        Self {
            kind: PeakShapeKind::Emg,
            sigma,
            tau,
        }
    }

    /// The probability density at `x` of a peak centred at `mu`
    pub fn density(&self, x: f64, mu: f64) -> f64 {
        let sigma = self.sigma;
        let u = (x - mu) / sigma;
        match self.kind {
            PeakShapeKind::Gaussian => (-0.5 * u * u).exp() / (sigma * (2.0 * PI).sqrt()),
            PeakShapeKind::Emg => {
                let tau = self.tau;
                let z = (sigma / tau - u) / SQRT_2;
                if z < ERFCX_ASYMPTOTIC_LIMIT {
                    let exponent = sigma * sigma / (2.0 * tau * tau) - (x - mu) / tau;
                    exponent.exp() * libm::erfc(z) / (2.0 * tau)
                } else {
                    (-0.5 * u * u).exp() * erfcx_asymptotic(z) / (2.0 * tau)
                }
            }
        }
    }

    /// The signal at `x` of a peak of `area` centred at `mu`
    #[inline]
    pub fn evaluate(&self, x: f64, mu: f64, area: f64) -> f64 {
        area * self.density(x, mu)
    }

    /// The full width at half maximum and the peak height of a unit area peak
    pub fn profile(&self) -> (f64, f64) {
        match self.kind {
            PeakShapeKind::Gaussian => (
                FWHM_PER_SIGMA * self.sigma,
                1.0 / (self.sigma * (2.0 * PI).sqrt()),
            ),
            PeakShapeKind::Emg => {
                let lo = -6.0 * self.sigma;
                let hi = 6.0 * self.sigma + 20.0 * self.tau;
                let n = 4001;
                let step = (hi - lo) / (n - 1) as f64;
                let grid: Vec<f64> = (0..n).map(|i| lo + i as f64 * step).collect();
                let density: Vec<f64> = grid.iter().map(|x| self.density(*x, 0.0)).collect();
                let apex = argmax(&density).unwrap_or_default();
                let width = full_width_at_half_max(&grid, &density, apex);
                (width.full_width_at_half_max, density[apex])
            }
        }
    }
}

/// Shape parameters learned from the shape calibrant
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeCalibration {
    pub model: PeakModel,
    /// The mass of the shape calibrant peak as detected
    pub calibrant_mz: f64,
    pub fitted_centre: f64,
    pub fitted_area: f64,
    pub fwhm: f64,
    pub reduced_chi_square: f64,
    pub converged: bool,
}

/// One fitted peak from [`fit_peaks`]
#[derive(Debug, Clone, PartialEq)]
pub struct PeakFitRecord {
    /// The fitted centre before recalibration
    pub mz: f64,
    pub recalibrated_mz: f64,
    pub area: f64,
    pub height: f64,
    pub fwhm: f64,
    pub resolving_power: f64,
    pub is_calibrant: bool,
}

/// The outcome of the shape and mass fits for one candidate peak
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub shape: ShapeCalibration,
    /// The mass the calibrant peak is assigned
    pub calibrant_mass: f64,
    /// `calibrant_mass` divided by the fitted calibrant centre
    pub recalibration_factor: f64,
    pub peaks: Vec<PeakFitRecord>,
    pub reduced_chi_square: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl FitReport {
    pub fn calibrant(&self) -> Option<&PeakFitRecord> {
        self.peaks.iter().find(|p| p.is_calibrant)
    }
}

/// Several peaks sharing one free shape
struct SharedShapeProblem<'a> {
    x: &'a [f64],
    y: &'a [f64],
    kind: PeakShapeKind,
    n_peaks: usize,
}

impl SharedShapeProblem<'_> {
    fn model(&self, params: &DVector<f64>) -> PeakModel {
        let sigma = params[0].exp();
        match self.kind {
            PeakShapeKind::Gaussian => PeakModel::gaussian(sigma),
            PeakShapeKind::Emg => PeakModel::emg(sigma, params[1].exp()),
        }
    }
}

impl LeastSquaresProblem for SharedShapeProblem<'_> {
    fn observation_count(&self) -> usize {
        self.x.len()
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let model = self.model(params);
        let offset = self.kind.shape_parameters();
        let peaks = &params.as_slice()[offset..offset + 2 * self.n_peaks];
        multi_peak_residuals(self.x, self.y, &model, peaks)
    }
}

/// Several peaks with a fixed shape
struct FixedShapeProblem<'a> {
    x: &'a [f64],
    y: &'a [f64],
    model: PeakModel,
}

impl LeastSquaresProblem for FixedShapeProblem<'_> {
    fn observation_count(&self) -> usize {
        self.x.len()
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        multi_peak_residuals(self.x, self.y, &self.model, params.as_slice())
    }
}

/// `peaks` holds `(centre, area)` pairs laid out flat
fn multi_peak_residuals(x: &[f64], y: &[f64], model: &PeakModel, peaks: &[f64]) -> DVector<f64> {
    DVector::from_iterator(
        x.len(),
        x.iter().zip(y.iter()).map(|(xi, yi)| {
            let fitted: f64 = peaks
                .chunks_exact(2)
                .map(|p| model.evaluate(*xi, p[0], p[1]))
                .sum();
            fitted - yi
        }),
    )
}

fn reduced_chi_square(cost: f64, points: usize, parameters: usize) -> f64 {
    let dof = points.saturating_sub(parameters).max(1);
    2.0 * cost / dof as f64
}

/// Collect the detected peaks within `fit_range` of `centre`, returning them
/// with the position of the peak with list index `calibrant` among them.
fn peaks_in_range(
    peaks: &PeakList,
    calibrant: &DetectedPeak,
    fit_range: f64,
) -> (Vec<DetectedPeak>, usize) {
    let neighbours: Vec<DetectedPeak> = peaks
        .all_peaks_for(calibrant.mz, Tolerance::Da(fit_range))
        .to_vec();
    let position = neighbours
        .iter()
        .position(|p| p.index == calibrant.index)
        .unwrap_or_default();
    (neighbours, position)
}

fn lookup(peaks: &PeakList, index: usize) -> Result<DetectedPeak, ShapeFitError> {
    if index < peaks.len() {
        Ok(peaks[index])
    } else {
        Err(ShapeFitError::UnknownPeak(index))
    }
}

/// The starting `(centre, area)` for a peak of the given shape, scaled to the
/// observed signal nearest the peak
fn initial_peak(x: &[f64], y: &[f64], peak: &DetectedPeak, model: &PeakModel) -> (f64, f64) {
    let height = nearest(x, peak.mz).map(|i| y[i]).unwrap_or(0.0).max(0.0);
    let (_, unit_height) = model.profile();
    (peak.mz, height / unit_height)
}

/// Estimate the Gaussian width of `peak` from the half-height width of the
/// signal, falling back to the width implied by `resolving_power`.
fn initial_sigma(
    x: &[f64],
    y: &[f64],
    peak: &DetectedPeak,
    fit_range: f64,
    resolving_power: f64,
) -> f64 {
    let fallback = peak.mz / resolving_power / FWHM_PER_SIGMA;
    let Some(apex) = nearest(x, peak.mz) else {
        return fallback;
    };
    let fwhm = full_width_at_half_max(x, y, apex).full_width_at_half_max;
    if fwhm.is_finite() && fwhm > 0.0 && fwhm < fit_range {
        fwhm / FWHM_PER_SIGMA
    } else {
        debug!("Using resolving power to estimate width of peak at {:.6}", peak.mz);
        fallback
    }
}

/// Learn the peak shape from the peak at position `shape_calibrant` of `peaks`.
///
/// All detected peaks within `fit_range` of the calibrant are fitted together,
/// sharing the shape parameters. The calibrant fit is reported.
pub fn determine_peak_shape(
    x: &[f64],
    y: &[f64],
    peaks: &PeakList,
    shape_calibrant: usize,
    fit_range: f64,
    kind: PeakShapeKind,
    resolving_power: f64,
) -> Result<ShapeCalibration, ShapeFitError> {
    let calibrant = lookup(peaks, shape_calibrant)?;
    let (neighbours, position) = peaks_in_range(peaks, &calibrant, fit_range);
    let range = find_between(x, calibrant.mz - fit_range, calibrant.mz + fit_range);
    let (xs, ys) = (&x[range.clone()], &y[range]);

    let n_shape = kind.shape_parameters();
    let n_params = n_shape + 2 * neighbours.len();
    if xs.len() <= n_params {
        return Err(ShapeFitError::TooFewPoints {
            points: xs.len(),
            parameters: n_params,
        });
    }

    let sigma = initial_sigma(x, y, &calibrant, fit_range, resolving_power);
    let start_model = match kind {
        PeakShapeKind::Gaussian => PeakModel::gaussian(sigma),
        PeakShapeKind::Emg => PeakModel::emg(sigma * 0.8, sigma * 0.5),
    };
    let mut initial = vec![start_model.sigma.ln()];
    if kind == PeakShapeKind::Emg {
        initial.push(start_model.tau.ln());
    }
    for peak in neighbours.iter() {
        let (mu, area) = initial_peak(x, y, peak, &start_model);
        initial.push(mu);
        initial.push(area);
    }
    debug!(
        "Fitting {kind} shape to {} peaks around {:.6} from sigma {sigma:e}",
        neighbours.len(),
        calibrant.mz
    );

    let problem = SharedShapeProblem {
        x: xs,
        y: ys,
        kind,
        n_peaks: neighbours.len(),
    };
    let fit = LevenbergMarquardt::default().minimize(&problem, DVector::from_vec(initial))?;
    if !fit.params.iter().all(|p| p.is_finite()) {
        return Err(ShapeFitError::NonFinite);
    }
    if !fit.converged() {
        warn!(
            "Shape fit around {:.6} did not converge ({:?})",
            calibrant.mz, fit.termination
        );
    }
    let model = problem.model(&fit.params);
    let (fwhm, _) = model.profile();
    let offset = n_shape + 2 * position;
    Ok(ShapeCalibration {
        model,
        calibrant_mz: calibrant.mz,
        fitted_centre: fit.params[offset],
        fitted_area: fit.params[offset + 1],
        fwhm,
        reduced_chi_square: reduced_chi_square(fit.cost, xs.len(), n_params),
        converged: fit.converged(),
    })
}

/// Fit the centres and areas of the peaks within `fit_range` of the peak at
/// position `mass_calibrant` of `peaks`, holding the peak shape fixed.
///
/// The calibrant is assigned `calibrant_mass`, and the ratio of that to its
/// fitted centre rescales every fitted centre.
pub fn fit_peaks(
    x: &[f64],
    y: &[f64],
    peaks: &PeakList,
    shape: &ShapeCalibration,
    mass_calibrant: usize,
    fit_range: f64,
    calibrant_mass: f64,
) -> Result<FitReport, ShapeFitError> {
    let calibrant = lookup(peaks, mass_calibrant)?;
    let (neighbours, position) = peaks_in_range(peaks, &calibrant, fit_range);
    let range = find_between(x, calibrant.mz - fit_range, calibrant.mz + fit_range);
    let (xs, ys) = (&x[range.clone()], &y[range]);

    let n_params = 2 * neighbours.len();
    if xs.len() <= n_params {
        return Err(ShapeFitError::TooFewPoints {
            points: xs.len(),
            parameters: n_params,
        });
    }

    let model = shape.model;
    let initial: Vec<f64> = neighbours
        .iter()
        .flat_map(|peak| {
            let (mu, area) = initial_peak(x, y, peak, &model);
            [mu, area]
        })
        .collect();

    let problem = FixedShapeProblem { x: xs, y: ys, model };
    let fit = LevenbergMarquardt::default().minimize(&problem, DVector::from_vec(initial))?;
    if !fit.params.iter().all(|p| p.is_finite()) {
        return Err(ShapeFitError::NonFinite);
    }

    let calibrant_centre = fit.params[2 * position];
    if calibrant_centre <= 0.0 {
        return Err(ShapeFitError::InvalidCalibrant(calibrant_centre));
    }
    let recalibration_factor = calibrant_mass / calibrant_centre;
    let (fwhm, unit_height) = model.profile();

    let records = fit
        .params
        .as_slice()
        .chunks_exact(2)
        .enumerate()
        .map(|(i, p)| {
            let recalibrated_mz = p[0] * recalibration_factor;
            PeakFitRecord {
                mz: p[0],
                recalibrated_mz,
                area: p[1],
                height: p[1] * unit_height,
                fwhm,
                resolving_power: recalibrated_mz / fwhm,
                is_calibrant: i == position,
            }
        })
        .collect();

    if !fit.converged() {
        warn!(
            "Mass fit around {:.6} did not converge ({:?})",
            calibrant.mz, fit.termination
        );
    }
    debug!(
        "Calibrant at {calibrant_centre:.6} assigned {calibrant_mass:.6}, recalibration factor {recalibration_factor:.9}"
    );

    Ok(FitReport {
        shape: shape.clone(),
        calibrant_mass,
        recalibration_factor,
        peaks: records,
        reduced_chi_square: reduced_chi_square(fit.cost, xs.len(), n_params),
        iterations: fit.iterations,
        converged: fit.converged() && shape.converged,
    })
}

/// Integrate the model of a peak of `area` over `x`
pub fn integrate(model: &PeakModel, x: &[f64], mu: f64, area: f64) -> f64 {
    let y: Vec<f64> = x.iter().map(|xi| model.evaluate(*xi, mu, area)).collect();
    trapz(x, &y)
}
