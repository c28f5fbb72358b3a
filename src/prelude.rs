pub use crate::analysis::PeakFitEngine;
pub use crate::least_squares::LeastSquaresProblem;
pub use mzpeaks::prelude::*;
