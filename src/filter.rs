//! Digital Butterworth low-pass design and zero-phase filtering.
//!
//! The design follows the usual recipe for IIR filters: place the analog
//! prototype poles on the unit circle, pre-warp the cutoff, scale, and map to
//! the z-plane with the bilinear transform. [`filtfilt`] runs the filter
//! forwards then backwards so the output has no phase delay, which keeps
//! slow baseline trends aligned with the raw signal they are subtracted from.
use std::f64::consts::PI;

use log::debug;
use nalgebra::{Complex, DMatrix, DVector};
use thiserror::Error;

/// All the ways filter design or application can fail
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ConfigurationError {
    #[error(
        "The normalized cutoff {0} must lie strictly between 0 and 1, the sampling rate must exceed twice the cutoff frequency"
    )]
    InvalidCutoff(f64),
    #[error("The filter order must be at least 1, received {0}")]
    InvalidOrder(usize),
    #[error("The signal must be longer than the padding length {padding}, received {length} points")]
    SignalTooShort { length: usize, padding: usize },
    #[error("Failed to compute steady state filter conditions")]
    SingularSteadyState,
}

/// An IIR filter in transfer function form with `a[0] == 1`
#[derive(Debug, Clone, PartialEq)]
pub struct Butterworth {
    pub b: Vec<f64>,
    pub a: Vec<f64>,
}

/// Expand the monic polynomial with the given roots, highest power first
fn poly(roots: &[Complex<f64>]) -> Vec<Complex<f64>> {
    let mut coefs = vec![Complex::new(1.0, 0.0)];
    for root in roots {
        let mut next = vec![Complex::new(0.0, 0.0); coefs.len() + 1];
        for (i, c) in coefs.iter().enumerate() {
            next[i] += *c;
            next[i + 1] -= *c * *root;
        }
        coefs = next;
    }
    coefs
}

impl Butterworth {
    /// Design a low-pass filter of `order` with the cutoff given as a fraction
    /// of the Nyquist frequency.
    pub fn lowpass(order: usize, normalized_cutoff: f64) -> Result<Self, ConfigurationError> {
        if order == 0 {
            return Err(ConfigurationError::InvalidOrder(order));
        }
        if !(normalized_cutoff > 0.0 && normalized_cutoff < 1.0) {
            return Err(ConfigurationError::InvalidCutoff(normalized_cutoff));
        }
        // Digital design on a nominal sampling frequency of 2
        let fs = 2.0;
        let warped = 2.0 * fs * (PI * normalized_cutoff / fs).tan();
        let fs2 = 2.0 * fs;

        let n = order as i64;
        let poles: Vec<Complex<f64>> = (0..order as i64)
            .map(|k| {
                let m = (2 * k - n + 1) as f64;
                -Complex::from_polar(1.0, PI * m / (2.0 * order as f64)) * warped
            })
            .collect();
        let gain = warped.powi(order as i32);

        let digital_poles: Vec<Complex<f64>> =
            poles.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect();
        let denominator = poles
            .iter()
            .fold(Complex::new(1.0, 0.0), |acc, &p| acc * (fs2 - p));
        let digital_gain = gain / denominator.re;

        let zeros = vec![Complex::new(-1.0, 0.0); order];
        let b = poly(&zeros).into_iter().map(|c| c.re * digital_gain).collect();
        let a = poly(&digital_poles).into_iter().map(|c| c.re).collect();
        Ok(Self { b, a })
    }

    /// Design from frequencies in Hz, `cutoff / (0.5 * sampling_rate)`
    pub fn lowpass_hz(
        order: usize,
        cutoff: f64,
        sampling_rate: f64,
    ) -> Result<Self, ConfigurationError> {
        let nyquist = 0.5 * sampling_rate;
        Self::lowpass(order, cutoff / nyquist)
    }

    pub fn order(&self) -> usize {
        self.a.len().max(self.b.len()) - 1
    }

    /// Direct form II transposed filtering of `x`, starting from state `zi`
    pub fn lfilter(&self, x: &[f64], zi: &[f64]) -> Vec<f64> {
        let order = self.order();
        let b = &self.b;
        let a = &self.a;
        let mut state = zi.to_vec();
        state.resize(order, 0.0);
        let mut out = Vec::with_capacity(x.len());
        for xi in x.iter().copied() {
            let yi = b[0] * xi + state.first().copied().unwrap_or_default();
            for j in 0..order {
                let carry = if j + 1 < order { state[j + 1] } else { 0.0 };
                state[j] = b[j + 1] * xi + carry - a[j + 1] * yi;
            }
            out.push(yi);
        }
        out
    }

    /// The filter state for a unit step input at steady state
    pub fn lfilter_zi(&self) -> Result<Vec<f64>, ConfigurationError> {
        let order = self.order();
        let b = &self.b;
        let a = &self.a;
        // I - companion(a)^T
        let system = DMatrix::<f64>::from_fn(order, order, |i, j| {
            let companion_t = if j == 0 {
                -a[i + 1]
            } else if i + 1 == j {
                1.0
            } else {
                0.0
            };
            let identity = if i == j { 1.0 } else { 0.0 };
            identity - companion_t
        });
        let rhs = DVector::from_fn(order, |i, _| b[i + 1] - a[i + 1] * b[0]);
        system
            .lu()
            .solve(&rhs)
            .map(|zi| zi.data.into())
            .ok_or(ConfigurationError::SingularSteadyState)
    }

    /// Apply the filter forwards and backwards. See [`filtfilt`].
    pub fn filtfilt(&self, x: &[f64]) -> Result<Vec<f64>, ConfigurationError> {
        let padding = 3 * (self.order() + 1);
        let n = x.len();
        if n <= padding {
            return Err(ConfigurationError::SignalTooShort {
                length: n,
                padding,
            });
        }
        // Odd extension about both end points
        let mut extended = Vec::with_capacity(n + 2 * padding);
        extended.extend((1..=padding).rev().map(|i| 2.0 * x[0] - x[i]));
        extended.extend_from_slice(x);
        extended.extend((1..=padding).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));

        let zi = self.lfilter_zi()?;
        let x0 = extended[0];
        let forward = self.lfilter(
            &extended,
            &zi.iter().map(|z| z * x0).collect::<Vec<_>>(),
        );

        let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
        let y0 = reversed[0];
        reversed = self.lfilter(
            &reversed,
            &zi.iter().map(|z| z * y0).collect::<Vec<_>>(),
        );
        reversed.reverse();
        Ok(reversed[padding..padding + n].to_vec())
    }
}

/// A zero-phase low-pass Butterworth filter of `data`.
///
/// `cutoff` and `sampling_rate` are in the same frequency units, so the
/// normalized cutoff is `cutoff / (0.5 * sampling_rate)`.
pub fn filtfilt(
    data: &[f64],
    cutoff: f64,
    sampling_rate: f64,
    order: usize,
) -> Result<Vec<f64>, ConfigurationError> {
    let filter = Butterworth::lowpass_hz(order, cutoff, sampling_rate)?;
    debug!("Butterworth coefficients b={:?} a={:?}", filter.b, filter.a);
    filter.filtfilt(data)
}
