use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SmoothingError {
    #[error("The window length must be an odd number, received {0}")]
    WindowLengthNotOdd(usize),
    #[error(
        "The window length must be shorter than the data, received {0} window with {1} data points"
    )]
    WindowLengthTooLong(usize, usize),
}

/// The shape of the smoothing kernel
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// A plain moving average
    Flat,
    Hanning,
    Hamming,
    #[default]
    Bartlett,
    Blackman,
}

impl WindowKind {
    /// Build the un-normalized kernel of `length` points
    pub fn kernel(&self, length: usize) -> Vec<f64> {
        if length == 1 {
            return vec![1.0];
        }
        let m = (length - 1) as f64;
        (0..length)
            .map(|n| {
                let n = n as f64;
                match self {
                    Self::Flat => 1.0,
                    Self::Hanning => 0.5 - 0.5 * (2.0 * PI * n / m).cos(),
                    Self::Hamming => 0.54 - 0.46 * (2.0 * PI * n / m).cos(),
                    Self::Bartlett => 2.0 / m * (m / 2.0 - (n - m / 2.0).abs()),
                    Self::Blackman => {
                        0.42 - 0.5 * (2.0 * PI * n / m).cos() + 0.08 * (4.0 * PI * n / m).cos()
                    }
                }
            })
            .collect()
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flat => "flat",
            Self::Hanning => "hanning",
            Self::Hamming => "hamming",
            Self::Bartlett => "bartlett",
            Self::Blackman => "blackman",
        };
        f.write_str(name)
    }
}

impl FromStr for WindowKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "hanning" | "hann" => Ok(Self::Hanning),
            "hamming" => Ok(Self::Hamming),
            "bartlett" => Ok(Self::Bartlett),
            "blackman" => Ok(Self::Blackman),
            _ => Err(format!("Unknown smoothing window {s}")),
        }
    }
}

/// Smooth `data` by convolving it with a normalized `window` kernel of
/// `window_length` points.
///
/// The signal is reflected about both end points before convolution so the
/// output has the same length as the input. Windows shorter than three points
/// return the data unchanged.
pub fn smooth(
    data: &[f64],
    window: WindowKind,
    window_length: usize,
) -> Result<Vec<f64>, SmoothingError> {
    if window_length < 3 {
        return Ok(data.to_vec());
    }
    if window_length % 2 == 0 {
        return Err(SmoothingError::WindowLengthNotOdd(window_length));
    }
    let n = data.len();
    if window_length > n {
        return Err(SmoothingError::WindowLengthTooLong(window_length, n));
    }

    let kernel = window.kernel(window_length);
    let total: f64 = kernel.iter().sum();
    let kernel: Vec<f64> = kernel.into_iter().map(|k| k / total).collect();

    let half = window_length / 2;
    let mut padded = Vec::with_capacity(n + 2 * half);
    padded.extend((1..=half).rev().map(|i| data[i]));
    padded.extend_from_slice(data);
    padded.extend((1..=half).map(|i| data[n - 1 - i]));

    // Symmetric kernels make correlation and convolution the same thing
    let out = padded
        .windows(window_length)
        .map(|w| w.iter().zip(kernel.iter()).map(|(x, k)| x * k).sum())
        .collect();
    Ok(out)
}

/// A moving average of `data` over `window_length` points
pub fn moving_average(data: &[f64], window_length: usize) -> Result<Vec<f64>, SmoothingError> {
    smooth(data, WindowKind::Flat, window_length)
}
