//! Linear and non-linear least squares solvers.
//!
//! [`polyfit`] solves an ordinary polynomial regression through an SVD of the
//! Vandermonde system. [`LevenbergMarquardt`] minimizes the sum of squared
//! residuals of any [`LeastSquaresProblem`], using Marquardt's diagonal
//! scaling so parameters of wildly different magnitude (a ToF scale factor
//! near 1e12 next to a time offset near 1e-6) are handled evenly.
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use log::trace;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LeastSquaresError {
    #[error("{observations} observations cannot determine {parameters} parameters")]
    Underdetermined {
        observations: usize,
        parameters: usize,
    },
    #[error("The x and y arrays do not match in length ({0} != {1})")]
    LengthMismatch(usize, usize),
    #[error("Residuals are not finite at the initial parameters")]
    NonFiniteStart,
    #[error("Failed to solve for coefficients: {0}")]
    FailedToSolve(&'static str),
}

/// Fit a polynomial of degree `degree` to `(x, y)`.
///
/// Coefficients are returned in increasing order of power, so a line comes
/// back as `[intercept, slope]`.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Result<Vec<f64>, LeastSquaresError> {
    let nr = x.len();
    let nc = degree + 1;
    if nr != y.len() {
        return Err(LeastSquaresError::LengthMismatch(nr, y.len()));
    }
    if nr < nc {
        return Err(LeastSquaresError::Underdetermined {
            observations: nr,
            parameters: nc,
        });
    }

    // Center the axis so large offsets (microsecond time stamps) keep the
    // system well conditioned, then expand the shifted polynomial back.
    let shift = x.iter().sum::<f64>() / nr as f64;
    let system = DMatrix::<f64>::from_fn(nr, nc, |i, j| (x[i] - shift).powi(j as i32));
    let beta = DVector::from_column_slice(y);
    let decomp = nalgebra::linalg::SVD::new(system, true, true);
    let shifted: Vec<f64> = decomp
        .solve(&beta, 1e-18)
        .map_err(LeastSquaresError::FailedToSolve)?
        .data
        .into();

    // sum_j c_j (x - s)^j = sum_k x^k sum_{j>=k} c_j C(j, k) (-s)^(j-k)
    let mut coefficients = vec![0.0; nc];
    for (j, c) in shifted.iter().enumerate() {
        let mut binom = 1.0;
        for k in 0..=j {
            if k > 0 {
                binom = binom * (j - k + 1) as f64 / k as f64;
            }
            coefficients[k] += c * binom * (-shift).powi((j - k) as i32);
        }
    }
    Ok(coefficients)
}

/// Evaluate polynomial `coefficients` (increasing power order) at `x`
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// A sum-of-squares objective for [`LevenbergMarquardt`]
pub trait LeastSquaresProblem {
    /// The number of residuals produced per evaluation
    fn observation_count(&self) -> usize;

    /// Residual vector at `params`
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    /// Jacobian of [`LeastSquaresProblem::residuals`] w.r.t. `params`, one row per
    /// residual.
    ///
    /// The default uses forward differences.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let base = self.residuals(params);
        let mut jac = DMatrix::zeros(base.len(), params.len());
        let mut probe = params.clone();
        for j in 0..params.len() {
            let step = f64::EPSILON.sqrt() * params[j].abs().max(1e-8);
            probe[j] = params[j] + step;
            let shifted = self.residuals(&probe);
            jac.set_column(j, &((shifted - &base) / step));
            probe[j] = params[j];
        }
        jac
    }
}

/// Why a [`LevenbergMarquardt`] run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The residuals vanished
    ExactFit,
    /// The relative reduction of the cost fell below `ftol`
    CostConverged,
    /// The relative parameter step fell below `xtol`
    StepConverged,
    /// The damping grew without finding a better point
    Stalled,
    /// `max_iter` was reached
    MaxIterations,
}

impl Termination {
    pub fn converged(&self) -> bool {
        matches!(
            self,
            Self::ExactFit | Self::CostConverged | Self::StepConverged
        )
    }
}

/// The outcome of a [`LevenbergMarquardt`] run
#[derive(Debug, Clone)]
pub struct LeastSquaresFit {
    pub params: DVector<f64>,
    /// Half the sum of squared residuals at `params`
    pub cost: f64,
    pub iterations: usize,
    pub termination: Termination,
}

impl LeastSquaresFit {
    pub fn converged(&self) -> bool {
        self.termination.converged() && self.params.iter().all(|p| p.is_finite())
    }
}

/// A damped Gauss-Newton solver
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    pub max_iter: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub initial_damping: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iter: 600,
            ftol: 1.49012e-8,
            xtol: 1.49012e-8,
            initial_damping: 1e-3,
        }
    }
}

const MAX_DAMPING: f64 = 1e16;

impl LevenbergMarquardt {
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn ftol(mut self, ftol: f64) -> Self {
        self.ftol = ftol;
        self
    }

    pub fn xtol(mut self, xtol: f64) -> Self {
        self.xtol = xtol;
        self
    }

    fn cost(residuals: &DVector<f64>) -> f64 {
        0.5 * residuals.norm_squared()
    }

    /// Minimize `problem` starting from `initial`
    pub fn minimize<P: LeastSquaresProblem + ?Sized>(
        &self,
        problem: &P,
        initial: DVector<f64>,
    ) -> Result<LeastSquaresFit, LeastSquaresError> {
        let n_params = initial.len();
        let n_obs = problem.observation_count();
        if n_obs < n_params {
            return Err(LeastSquaresError::Underdetermined {
                observations: n_obs,
                parameters: n_params,
            });
        }

        let mut params = initial;
        let mut residuals = problem.residuals(&params);
        let mut cost = Self::cost(&residuals);
        if !cost.is_finite() {
            return Err(LeastSquaresError::NonFiniteStart);
        }

        let mut damping = self.initial_damping;
        let mut termination = Termination::MaxIterations;
        let mut iterations = 0;

        for it in 0..self.max_iter {
            iterations = it + 1;
            if cost == 0.0 {
                termination = Termination::ExactFit;
                break;
            }
            let jac = problem.jacobian(&params);
            let jt = jac.transpose();
            let hessian = &jt * &jac;
            let gradient = &jt * &residuals;

            // Scale to unit diagonal so the damping is invariant to parameter units
            let scale = DVector::from_fn(n_params, |i, _| {
                let d = hessian[(i, i)].sqrt();
                if d > 0.0 && d.is_finite() {
                    d
                } else {
                    1.0
                }
            });
            let scaled_hessian = DMatrix::from_fn(n_params, n_params, |i, j| {
                hessian[(i, j)] / (scale[i] * scale[j])
            });
            let scaled_gradient = gradient.component_div(&scale);

            let mut accepted = false;
            let mut negligible_step = false;
            while damping < MAX_DAMPING {
                let mut system = scaled_hessian.clone();
                for i in 0..n_params {
                    system[(i, i)] += damping;
                }
                let step = match system.clone().cholesky() {
                    Some(chol) => chol.solve(&(-&scaled_gradient)),
                    None => match system.lu().solve(&(-&scaled_gradient)) {
                        Some(step) => step,
                        None => {
                            damping *= 10.0;
                            continue;
                        }
                    },
                };
                let step = step.component_div(&scale);
                let candidate = &params + &step;
                let small_step = step
                    .iter()
                    .zip(candidate.iter())
                    .all(|(s, p)| s.abs() <= self.xtol * (p.abs() + self.xtol));
                let candidate_residuals = problem.residuals(&candidate);
                let candidate_cost = Self::cost(&candidate_residuals);

                if candidate_cost.is_finite() && candidate_cost < cost {
                    let reduction = cost - candidate_cost;
                    trace!("{it}: cost {cost:e} -> {candidate_cost:e}, damping {damping:e}");
                    params = candidate;
                    residuals = candidate_residuals;
                    cost = candidate_cost;
                    damping = (damping / 10.0).max(1e-12);
                    accepted = true;

                    if cost == 0.0 {
                        termination = Termination::ExactFit;
                    } else if reduction <= self.ftol * (cost + reduction) {
                        termination = Termination::CostConverged;
                    } else if small_step {
                        termination = Termination::StepConverged;
                    }
                    break;
                }
                // No better point within round-off of the current one
                if small_step {
                    negligible_step = true;
                    break;
                }
                damping *= 10.0;
            }

            if !accepted {
                termination = if negligible_step {
                    Termination::StepConverged
                } else {
                    Termination::Stalled
                };
                break;
            }
            if termination != Termination::MaxIterations {
                break;
            }
        }

        Ok(LeastSquaresFit {
            params,
            cost,
            iterations,
            termination,
        })
    }
}
