//! Local optimization module using gradient-based methods
//!
//! This module implements a BFGS quasi-Newton minimizer over the 7 pose
//! parameters. The caller supplies the objective and its analytic gradient; no
//! finite differences are taken.

use log::trace;
use nalgebra::SMatrix;

use crate::math::{PoseParams, POSE_DIM};
use crate::optimization::OptimizerState;

type InverseHessian = SMatrix<f64, POSE_DIM, POSE_DIM>;

/// Parameters for local optimization
#[derive(Debug, Clone)]
pub struct LocalOptimizerParams {
    /// Initial step size for line search (fraction of the quasi-Newton step)
    pub initial_step: f64,

    /// Longest parameter-space step tried by the line search
    pub max_step: f64,

    /// Convergence tolerance for the gradient norm
    pub stop_gradient: f64,

    /// Maximum number of BFGS iterations
    pub max_iterations: usize,

    /// Armijo parameter for line search (c1)
    pub armijo_c1: f64,

    /// Step reduction factor of the backtracking line search
    pub step_reduction: f64,

    /// Maximum number of backtracking steps
    pub max_line_search_steps: usize,
}

impl Default for LocalOptimizerParams {
    fn default() -> Self {
        Self {
            initial_step: 1.0,
            max_step: 0.5,
            stop_gradient: 0.01,
            max_iterations: 20,
            armijo_c1: 1e-4,
            step_reduction: 0.5,
            max_line_search_steps: 20,
        }
    }
}

/// Outcome of one local optimization run
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOptimum {
    /// Final pose parameters
    pub params: PoseParams,

    /// Objective value at `params`
    pub value: f64,

    /// Gradient norm at `params`
    pub gradient_norm: f64,

    /// Number of accepted or reset iterations
    pub iterations: usize,

    /// Terminal state, `Converged` only when the gradient rule was met
    pub state: OptimizerState,
}

impl LocalOptimum {
    /// Whether the gradient-norm stopping rule was satisfied
    pub fn converged(&self) -> bool {
        self.state == OptimizerState::Converged
    }
}

/// BFGS minimizer owning its workspace, reused across runs
#[derive(Debug, Clone)]
pub struct LocalOptimizer {
    pub params: LocalOptimizerParams,
    state: OptimizerState,
    inv_hessian: InverseHessian,
    fresh_hessian: bool,
    x: PoseParams,
    gradient: PoseParams,
    value: f64,
    iterations: usize,
}

impl Default for LocalOptimizer {
    fn default() -> Self {
        Self::with_params(LocalOptimizerParams::default())
    }
}

impl LocalOptimizer {
    /// Create a new local optimizer with default parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new local optimizer with custom parameters
    pub fn with_params(params: LocalOptimizerParams) -> Self {
        Self {
            params,
            state: OptimizerState::Ready,
            inv_hessian: InverseHessian::identity(),
            fresh_hessian: true,
            x: PoseParams::zeros(),
            gradient: PoseParams::zeros(),
            value: 0.0,
            iterations: 0,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> OptimizerState {
        self.state
    }

    /// Reset the workspace and evaluate the objective at `x0`
    ///
    /// The objective returns its value and, when asked, writes its gradient into
    /// the second argument.
    pub fn setup<F>(&mut self, x0: PoseParams, objective: &mut F)
    where
        F: FnMut(&PoseParams, Option<&mut PoseParams>) -> f64,
    {
        self.x = x0;
        self.value = objective(&self.x, Some(&mut self.gradient));
        self.inv_hessian = InverseHessian::identity();
        self.fresh_hessian = true;
        self.iterations = 0;
        self.state = OptimizerState::Ready;
    }

    /// Take one quasi-Newton step and return the resulting state
    pub fn iterate<F>(&mut self, objective: &mut F) -> OptimizerState
    where
        F: FnMut(&PoseParams, Option<&mut PoseParams>) -> f64,
    {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.gradient.norm() < self.params.stop_gradient {
            self.state = OptimizerState::Converged;
            return self.state;
        }
        if self.iterations >= self.params.max_iterations {
            self.state = OptimizerState::MaxIterationsReached;
            return self.state;
        }
        self.state = OptimizerState::Iterating;

        let mut direction = -(self.inv_hessian * self.gradient);
        if self.gradient.dot(&direction) >= 0.0 {
            // Not a descent direction, fall back to steepest descent
            self.reset_hessian();
            direction = -self.gradient;
        }
        let length = direction.norm();
        if length > self.params.max_step {
            direction *= self.params.max_step / length;
        }

        let Some(step) = self.line_search(objective, &direction) else {
            if self.fresh_hessian {
                // Even steepest descent cannot improve, but the gradient rule is unmet
                trace!(
                    "BFGS stalled after {} iterations, gradient norm {:.3e}",
                    self.iterations,
                    self.gradient.norm()
                );
                self.state = OptimizerState::MaxIterationsReached;
            } else {
                self.reset_hessian();
                self.iterations += 1;
            }
            return self.finish_iteration();
        };

        let new_x = self.x + direction * step;
        let mut new_gradient = PoseParams::zeros();
        let new_value = objective(&new_x, Some(&mut new_gradient));

        let s = new_x - self.x;
        let y = new_gradient - self.gradient;
        let sy = s.dot(&y);
        if sy > 1e-10 {
            if self.fresh_hessian {
                // Scale the initial approximation to the observed curvature
                self.inv_hessian *= sy / y.dot(&y);
                self.fresh_hessian = false;
            }
            let rho = 1.0 / sy;
            let identity = InverseHessian::identity();
            let left = identity - s * y.transpose() * rho;
            let right = identity - y * s.transpose() * rho;
            self.inv_hessian = left * self.inv_hessian * right + s * s.transpose() * rho;
        }

        trace!(
            "BFGS iteration {}: value {:.6} -> {:.6}, step {:.3e}",
            self.iterations,
            self.value,
            new_value,
            step
        );

        self.x = new_x;
        self.value = new_value;
        self.gradient = new_gradient;
        self.iterations += 1;

        self.finish_iteration()
    }

    /// Run to a terminal state from `x0`
    pub fn minimize<F>(&mut self, x0: PoseParams, mut objective: F) -> LocalOptimum
    where
        F: FnMut(&PoseParams, Option<&mut PoseParams>) -> f64,
    {
        self.setup(x0, &mut objective);
        while !self.iterate(&mut objective).is_terminal() {}
        self.optimum()
    }

    /// Snapshot of the current point
    pub fn optimum(&self) -> LocalOptimum {
        LocalOptimum {
            params: self.x,
            value: self.value,
            gradient_norm: self.gradient.norm(),
            iterations: self.iterations,
            state: self.state,
        }
    }

    fn reset_hessian(&mut self) {
        self.inv_hessian = InverseHessian::identity();
        self.fresh_hessian = true;
    }

    fn finish_iteration(&mut self) -> OptimizerState {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.gradient.norm() < self.params.stop_gradient {
            self.state = OptimizerState::Converged;
        } else if self.iterations >= self.params.max_iterations {
            self.state = OptimizerState::MaxIterationsReached;
        }
        self.state
    }

    /// Backtracking line search with Armijo condition; returns the accepted step
    fn line_search<F>(&self, objective: &mut F, direction: &PoseParams) -> Option<f64>
    where
        F: FnMut(&PoseParams, Option<&mut PoseParams>) -> f64,
    {
        let directional_derivative = self.gradient.dot(direction);
        if directional_derivative >= 0.0 {
            return None;
        }

        let mut step = self.params.initial_step;
        for _ in 0..self.params.max_line_search_steps {
            let candidate = self.x + direction * step;
            let value = objective(&candidate, None);

            if value <= self.value + self.params.armijo_c1 * step * directional_derivative {
                return Some(step);
            }

            step *= self.params.step_reduction;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// Shifted, anisotropic quadratic bowl with minimum at `center`
    fn bowl(center: PoseParams) -> impl FnMut(&PoseParams, Option<&mut PoseParams>) -> f64 {
        let scales = PoseParams::from([1.0, 2.0, 3.0, 0.5, 1.5, 4.0, 2.5]);
        move |x, grad| {
            let d = x - center;
            if let Some(g) = grad {
                *g = d.component_mul(&scales) * 2.0;
            }
            d.component_mul(&d).dot(&scales)
        }
    }

    #[test]
    fn test_minimizes_quadratic() {
        let center = PoseParams::from([0.5, -1.0, 0.2, 0.0, 1.0, 2.0, -0.5]);
        let mut optimizer = LocalOptimizer::with_params(LocalOptimizerParams {
            max_iterations: 200,
            stop_gradient: 1e-6,
            ..LocalOptimizerParams::default()
        });

        let result = optimizer.minimize(PoseParams::zeros(), bowl(center));
        assert!(result.converged());
        assert_eq!(optimizer.state(), OptimizerState::Converged);
        assert!(result.gradient_norm < 1e-6);
        for i in 0..POSE_DIM {
            assert_approx_eq!(result.params[i], center[i], 1e-5);
        }
    }

    #[test]
    fn test_iteration_cap_reports_state() {
        let center = PoseParams::from([5.0, -5.0, 5.0, 5.0, -5.0, 5.0, 5.0]);
        let mut optimizer = LocalOptimizer::with_params(LocalOptimizerParams {
            max_iterations: 2,
            stop_gradient: 1e-12,
            ..LocalOptimizerParams::default()
        });

        let result = optimizer.minimize(PoseParams::zeros(), bowl(center));
        assert_eq!(result.state, OptimizerState::MaxIterationsReached);
        assert_eq!(result.iterations, 2);
        // The point still improved on the start
        let mut start = bowl(center);
        assert!(result.value < start(&PoseParams::zeros(), None));
    }

    #[test]
    fn test_start_at_minimum_converges_immediately() {
        let center = PoseParams::from([1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let mut optimizer = LocalOptimizer::new();
        let mut objective = bowl(center);

        optimizer.setup(center, &mut objective);
        assert_eq!(optimizer.state(), OptimizerState::Ready);
        assert_eq!(optimizer.iterate(&mut objective), OptimizerState::Converged);
        assert_eq!(optimizer.optimum().iterations, 0);
    }

    #[test]
    fn test_stalled_line_search_is_not_converged() {
        // The reported gradient promises descent the values never deliver
        let objective = |_x: &PoseParams, grad: Option<&mut PoseParams>| {
            if let Some(g) = grad {
                *g = PoseParams::from_element(1.0);
            }
            0.0
        };
        let mut optimizer = LocalOptimizer::new();
        let result = optimizer.minimize(PoseParams::zeros(), objective);

        assert_eq!(result.state, OptimizerState::MaxIterationsReached);
        assert!(!result.converged());
        assert!(result.gradient_norm >= optimizer.params.stop_gradient);
        assert_eq!(result.params, PoseParams::zeros());
    }

    #[test]
    fn test_zero_iterations_budget() {
        let center = PoseParams::from([1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let mut optimizer = LocalOptimizer::with_params(LocalOptimizerParams {
            max_iterations: 0,
            ..LocalOptimizerParams::default()
        });
        let result = optimizer.minimize(PoseParams::zeros(), bowl(center));
        assert_eq!(result.state, OptimizerState::MaxIterationsReached);
        assert_eq!(result.params, PoseParams::zeros());
    }
}
