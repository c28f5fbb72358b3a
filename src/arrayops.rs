//! Paired coordinate/amplitude arrays shared by every stage of the pipeline.
//!
//! A [`Trace`] is the in-memory form of a two-column table: time and voltage
//! on the way in, mass and voltage after calibration. The columns are
//! copy-on-write so stages can hand out cheap views over a window of a larger
//! trace and only allocate when they actually transform the values.
use std::borrow::Cow;
use std::ops::Range;

use log::warn;
use num_traits::Float;
use thiserror::Error;

use crate::search;

/// Find the position of the smallest value, taking the first one on ties.
///
/// `NaN` values are never selected.
pub fn argmin<T: Float>(values: &[T]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, T)>, (i, v)| match best {
            None if !v.is_nan() => Some((i, *v)),
            Some((_, b)) if *v < b => Some((i, *v)),
            other => other,
        })
        .map(|(i, _)| i)
}

/// Find the position of the largest value, taking the first one on ties.
pub fn argmax<T: Float>(values: &[T]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, T)>, (i, v)| match best {
            None if !v.is_nan() => Some((i, *v)),
            Some((_, b)) if *v > b => Some((i, *v)),
            other => other,
        })
        .map(|(i, _)| i)
}

/// Trapezoid rule integration of `y` over `x`
pub fn trapz<T: Float>(x: &[T], y: &[T]) -> T {
    let two = T::one() + T::one();
    x.windows(2)
        .zip(y.windows(2))
        .fold(T::zero(), |acc, (xs, ys)| {
            acc + (xs[1] - xs[0]) * (ys[0] + ys[1]) / two
        })
}

/// The mean spacing between consecutive values of a sorted axis
pub fn mean_spacing(x: &[f64]) -> Option<f64> {
    let n = x.len();
    if n < 2 {
        return None;
    }
    Some((x[n - 1] - x[0]) / (n - 1) as f64)
}

/// Check if the values in `it` are monotonically ascending or flat
pub fn is_increasing<F: Float>(it: &[F]) -> bool {
    it.windows(2).all(|w| w[0] <= w[1])
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum TraceError {
    #[error("The x and y columns do not match in length ({0} != {1})")]
    LengthMismatch(usize, usize),
    #[error(
        "A window of {length} samples starting at index {start} does not fit in a trace of \
         {available} samples"
    )]
    WindowOutOfBounds {
        start: usize,
        length: usize,
        available: usize,
    },
}

/// A two-column numeric table, `x` is the axis and `y` the amplitude.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace<'a> {
    pub x: Cow<'a, [f64]>,
    pub y: Cow<'a, [f64]>,
}

impl<'a> Trace<'a> {
    pub fn new(x: Cow<'a, [f64]>, y: Cow<'a, [f64]>) -> Result<Self, TraceError> {
        if x.len() != y.len() {
            return Err(TraceError::LengthMismatch(x.len(), y.len()));
        }
        Ok(Self { x, y })
    }

    pub fn from_vecs(x: Vec<f64>, y: Vec<f64>) -> Result<Trace<'static>, TraceError> {
        Trace::new(Cow::Owned(x), Cow::Owned(y))
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<(f64, f64)> {
        Some((*self.x.get(index)?, *self.y.get(index)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }

    pub fn into_owned(self) -> Trace<'static> {
        Trace {
            x: Cow::Owned(self.x.into_owned()),
            y: Cow::Owned(self.y.into_owned()),
        }
    }

    /// Borrow the samples in `range`. The range is clipped to the trace.
    pub fn slice(&self, range: Range<usize>) -> Trace<'_> {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Trace {
            x: Cow::Borrowed(&self.x[start..end]),
            y: Cow::Borrowed(&self.y[start..end]),
        }
    }

    /// Borrow the samples whose `x` lies in the closed interval `[lo, hi]`.
    ///
    /// Assumes `x` is sorted in ascending order.
    pub fn between(&self, lo: f64, hi: f64) -> Trace<'_> {
        self.slice(search::find_between(&self.x, lo, hi))
    }

    /// Borrow `length` consecutive samples starting at `start`.
    ///
    /// A window that runs past the end of the trace is an error unless
    /// `allow_truncated` is set, in which case the available samples are
    /// returned and a warning is logged.
    pub fn window(
        &self,
        start: usize,
        length: usize,
        allow_truncated: bool,
    ) -> Result<Trace<'_>, TraceError> {
        let available = self.len();
        let end = start.saturating_add(length);
        if end > available {
            if !allow_truncated || start >= available {
                return Err(TraceError::WindowOutOfBounds {
                    start,
                    length,
                    available,
                });
            }
            warn!(
                "Truncating window of {length} samples at {start} to {} samples",
                available - start
            );
        }
        Ok(self.slice(start..end))
    }

    pub fn argmin_x(&self) -> Option<usize> {
        argmin(&self.x)
    }

    pub fn argmax_y(&self) -> Option<usize> {
        argmax(&self.y)
    }
}

impl From<Vec<(f64, f64)>> for Trace<'static> {
    fn from(value: Vec<(f64, f64)>) -> Self {
        let (x, y): (Vec<f64>, Vec<f64>) = value.into_iter().unzip();
        Trace {
            x: Cow::Owned(x),
            y: Cow::Owned(y),
        }
    }
}
