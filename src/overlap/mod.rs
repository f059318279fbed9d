//! Closed-form Gaussian overlap volumes and their analytic pose gradient
//!
//! For two Gaussians with weights `w_i, w_j` and exponents `a_i, a_j` at distance
//! `d` the overlap integral is
//!
//! ```text
//! w_i w_j (pi / (a_i + a_j))^(3/2) * exp(-a_i a_j d^2 / (a_i + a_j))
//! ```
//!
//! The total overlap sums this over all element pairs, color elements included.
//! The color overlap is the part of that sum contributed by pairs of color
//! elements sharing the same nonzero color id, so it never exceeds the total.
//! Pairs whose exponential factor falls below `OverlapParams::epsilon` are
//! skipped.

use nalgebra::{Vector3, Vector4};
use std::f64::consts::PI;

use crate::math::{project_quaternion_gradient, rotation_jacobian, Pose, PoseParams};
use crate::shape::prepare::{PreparedElement, PreparedShape};

/// Tunables of the overlap sums
#[derive(Debug, Clone)]
pub struct OverlapParams {
    /// Pairs whose exponential factor is below this value are not summed
    pub epsilon: f64,
}

impl Default for OverlapParams {
    fn default() -> Self {
        Self { epsilon: 1e-9 }
    }
}

/// Overlap volumes of two shapes at one pose
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OverlapValues {
    pub overlap: f64,
    pub color_overlap: f64,
}

/// Gradients of the overlap volumes with respect to `[qw, qx, qy, qz, tx, ty, tz]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapGradient {
    pub overlap: PoseParams,
    pub color_overlap: PoseParams,
}

impl Default for OverlapGradient {
    fn default() -> Self {
        Self {
            overlap: PoseParams::zeros(),
            color_overlap: PoseParams::zeros(),
        }
    }
}

/// Evaluates overlaps; owns the scratch arrays reused between calls
#[derive(Debug, Clone, Default)]
pub struct OverlapEvaluator {
    pub params: OverlapParams,
    /// Transformed centers of the moving shape
    moved: Vec<Vector3<f64>>,
    /// d(overlap)/d(moved center), one entry per moving element
    forces: Vec<Vector3<f64>>,
}

impl OverlapEvaluator {
    pub fn new(params: OverlapParams) -> Self {
        Self {
            params,
            moved: Vec::new(),
            forces: Vec::new(),
        }
    }

    /// Drop the contents of the scratch arrays, keeping their capacity
    pub fn reset(&mut self) {
        self.moved.clear();
        self.forces.clear();
    }

    /// Overlap of `reference` with `aligned` moved by `pose`
    ///
    /// The color overlap is only summed when `want_color` is set. When `gradient`
    /// is given it receives the derivatives of both overlap terms with respect to
    /// the pose parameters (the quaternion derivative already accounts for its
    /// normalization).
    pub fn evaluate(
        &mut self,
        reference: &PreparedShape,
        aligned: &PreparedShape,
        pose: &Pose,
        want_color: bool,
        mut gradient: Option<&mut OverlapGradient>,
    ) -> OverlapValues {
        let max_exponent = -self.params.epsilon.ln();
        let unit = pose.unit_rotation();
        let rotation = unit.to_rotation_matrix();

        self.moved.clear();
        self.moved.extend(
            aligned
                .elements()
                .iter()
                .map(|e| rotation * e.center + pose.translation),
        );

        let mut values = OverlapValues::default();
        let split = aligned.color_start();

        values.overlap = self.sum_pairs(
            reference.elements(),
            aligned.elements(),
            0,
            max_exponent,
            gradient.is_some(),
            |_, _| true,
        );
        if let Some(grad) = gradient.as_deref_mut() {
            grad.overlap =
                self.pose_gradient(aligned.elements(), 0, aligned.elements().len(), pose, &unit);
        }

        if want_color {
            values.color_overlap = self.sum_pairs(
                reference.color_elements(),
                &aligned.elements()[split..],
                split,
                max_exponent,
                gradient.is_some(),
                |a, b| a.color == b.color,
            );
            if let Some(grad) = gradient.as_deref_mut() {
                grad.color_overlap =
                    self.pose_gradient(aligned.elements(), split, aligned.elements().len(), pose, &unit);
            }
        } else if let Some(grad) = gradient.as_deref_mut() {
            grad.color_overlap = PoseParams::zeros();
        }

        values
    }

    /// Sum pair overlaps; `offset` maps `moving` back into `self.moved`
    fn sum_pairs<F>(
        &mut self,
        fixed: &[PreparedElement],
        moving: &[PreparedElement],
        offset: usize,
        max_exponent: f64,
        with_forces: bool,
        interacts: F,
    ) -> f64
    where
        F: Fn(&PreparedElement, &PreparedElement) -> bool,
    {
        if with_forces {
            self.forces.clear();
            self.forces.resize(moving.len(), Vector3::zeros());
        }

        let mut total = 0.0;
        for a in fixed {
            for (j, b) in moving.iter().enumerate() {
                if !interacts(a, b) {
                    continue;
                }
                let delta = a.center - self.moved[offset + j];
                let sum = a.hardness + b.hardness;
                let k = a.hardness * b.hardness / sum;
                let exponent = k * delta.norm_squared();
                if exponent > max_exponent {
                    continue;
                }

                let coefficient = a.weight * b.weight * (PI / sum).powf(1.5);
                let pair = coefficient * (-exponent).exp();
                total += pair;

                if with_forces {
                    self.forces[j] += delta * (2.0 * k * pair);
                }
            }
        }
        total
    }

    /// Chain the per-element forces of `elements[start..end]` into a pose gradient
    fn pose_gradient(
        &self,
        elements: &[PreparedElement],
        start: usize,
        end: usize,
        pose: &Pose,
        unit: &nalgebra::UnitQuaternion<f64>,
    ) -> PoseParams {
        let mut grad_u = Vector4::zeros();
        let mut grad_t = Vector3::zeros();

        for (force, element) in self.forces.iter().zip(&elements[start..end]) {
            grad_t += force;
            let jac = rotation_jacobian(unit, &element.center);
            for m in 0..4 {
                grad_u[m] += force.dot(&jac[m]);
            }
        }

        let grad_q = project_quaternion_gradient(&pose.rotation, &grad_u);
        PoseParams::from([
            grad_q[0], grad_q[1], grad_q[2], grad_q[3], grad_t.x, grad_t.y, grad_t.z,
        ])
    }
}

/// Convenience wrapper allocating a fresh evaluator
pub fn overlap(
    reference: &PreparedShape,
    aligned: &PreparedShape,
    pose: &Pose,
    want_color: bool,
) -> OverlapValues {
    OverlapEvaluator::default().evaluate(reference, aligned, pose, want_color, None)
}
