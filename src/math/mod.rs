//! Rigid-body poses and the quaternion calculus used by the overlap gradient

use nalgebra::{
    Isometry3, Matrix3, Matrix4, Quaternion, Rotation3, SVector, Translation3, UnitQuaternion,
    Vector3, Vector4,
};
use serde::{Deserialize, Serialize};

/// Number of pose parameters: four quaternion components followed by three translation components
pub const POSE_DIM: usize = 7;

/// Flat pose parameter vector `[qw, qx, qy, qz, tx, ty, tz]`
pub type PoseParams = SVector<f64, POSE_DIM>;

/// Quaternions shorter than this are treated as the identity rotation
const MIN_QUATERNION_NORM: f64 = 1e-12;

/// A rigid motion `x' = R(q) x + t`
///
/// The quaternion is stored as given and normalized every time it is read, so
/// an optimizer may move it freely in R^4.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Rotation part (not necessarily unit length)
    pub rotation: Quaternion<f64>,

    /// Translation applied after the rotation
    pub translation: Vector3<f64>,
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    /// Create a pose from a rotation quaternion and a translation
    pub fn new(rotation: Quaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// The identity motion
    pub fn identity() -> Self {
        Self {
            rotation: Quaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build a pose from a (proper, orthonormal) rotation matrix and a translation
    pub fn from_rotation_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix_unchecked(*rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot).into_inner(),
            translation,
        }
    }

    /// Decode a parameter vector `[qw, qx, qy, qz, tx, ty, tz]`
    pub fn from_params(params: &PoseParams) -> Self {
        Self {
            rotation: Quaternion::new(params[0], params[1], params[2], params[3]),
            translation: Vector3::new(params[4], params[5], params[6]),
        }
    }

    /// Encode as a parameter vector `[qw, qx, qy, qz, tx, ty, tz]`
    pub fn to_params(&self) -> PoseParams {
        let q = &self.rotation;
        let t = &self.translation;
        PoseParams::from([q.w, q.i, q.j, q.k, t.x, t.y, t.z])
    }

    /// Normalized rotation
    pub fn unit_rotation(&self) -> UnitQuaternion<f64> {
        if self.rotation.norm() < MIN_QUATERNION_NORM {
            UnitQuaternion::identity()
        } else {
            UnitQuaternion::from_quaternion(self.rotation)
        }
    }

    /// Copy of this pose with a unit-length quaternion
    pub fn normalized(&self) -> Self {
        Self {
            rotation: self.unit_rotation().into_inner(),
            translation: self.translation,
        }
    }

    /// Apply the motion to a point
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.unit_rotation().transform_vector(point) + self.translation
    }

    /// The inverse motion, so that `p.inverse().transform_point(&p.transform_point(x)) == x`
    pub fn inverse(&self) -> Self {
        let inv = self.unit_rotation().inverse();
        Self {
            rotation: inv.into_inner(),
            translation: -inv.transform_vector(&self.translation),
        }
    }

    /// 4x4 homogeneous matrix of this motion
    pub fn to_matrix(&self) -> Matrix4<f64> {
        Isometry3::from_parts(Translation3::from(self.translation), self.unit_rotation())
            .to_homogeneous()
    }

    /// Recover a pose from a 4x4 homogeneous rigid-motion matrix
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Self {
        let rotation: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let translation: Vector3<f64> = matrix.fixed_view::<3, 1>(0, 3).into_owned();
        Self::from_rotation_matrix(&rotation, translation)
    }
}

/// Partial derivatives of `R(u) b` with respect to the unit quaternion components `(w, x, y, z)`
///
/// `R(u)` is the standard quadratic rotation matrix of a unit quaternion, so each
/// derivative is linear in `b`.
pub fn rotation_jacobian(u: &UnitQuaternion<f64>, b: &Vector3<f64>) -> [Vector3<f64>; 4] {
    let (w, x, y, z) = (u.w, u.i, u.j, u.k);
    let v = Vector3::new(x, y, z);
    let vb = v.dot(b);

    let d_w = (w * b + v.cross(b)) * 2.0;
    let d_x = Vector3::new(vb, y * b.x - x * b.y - w * b.z, z * b.x + w * b.y - x * b.z) * 2.0;
    let d_y = Vector3::new(-y * b.x + x * b.y + w * b.z, vb, -w * b.x + z * b.y - y * b.z) * 2.0;
    let d_z = Vector3::new(-z * b.x - w * b.y + x * b.z, w * b.x - z * b.y + y * b.z, vb) * 2.0;

    [d_w, d_x, d_y, d_z]
}

/// Chain a gradient taken with respect to a unit quaternion back through the
/// normalization `u = q / |q|`.
///
/// Both gradients are ordered `(w, x, y, z)`.
pub fn project_quaternion_gradient(q: &Quaternion<f64>, grad_u: &Vector4<f64>) -> Vector4<f64> {
    let norm = q.norm();
    if norm < MIN_QUATERNION_NORM {
        return *grad_u;
    }
    let u = Vector4::new(q.w, q.i, q.j, q.k) / norm;
    (grad_u - u * u.dot(grad_u)) / norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Unit;
    use serde_json;

    fn sample_pose() -> Pose {
        let axis = Unit::new_normalize(Vector3::new(1.0, -2.0, 0.5));
        let rotation = UnitQuaternion::from_axis_angle(&axis, 0.7);
        Pose::new(rotation.into_inner() * 2.0, Vector3::new(1.0, 2.0, -3.0))
    }

    #[test]
    fn test_pose_serialization() {
        let pose = sample_pose();
        let json = serde_json::to_string(&pose).unwrap();
        let back: Pose = serde_json::from_str(&json).unwrap();
        assert_eq!(pose, back);
    }

    #[test]
    fn test_identity_matrix() {
        assert_eq!(Pose::identity().to_matrix(), Matrix4::identity());
    }

    #[test]
    fn test_matrix_conversion_preserves_motion() {
        let pose = sample_pose();
        let back = Pose::from_matrix(&pose.to_matrix());
        let point = Vector3::new(0.3, -1.2, 4.0);
        let a = pose.transform_point(&point);
        let b = back.transform_point(&point);
        assert!((a - b).norm() < 1e-10);
    }

    #[test]
    fn test_inverse_undoes_motion() {
        let pose = sample_pose();
        let point = Vector3::new(-2.0, 0.5, 1.5);
        let round_trip = pose.inverse().transform_point(&pose.transform_point(&point));
        assert!((round_trip - point).norm() < 1e-10);
    }

    #[test]
    fn test_params_layout() {
        let pose = sample_pose();
        let params = pose.to_params();
        assert_eq!(params[0], pose.rotation.w);
        assert_eq!(params[4], pose.translation.x);
        assert_eq!(Pose::from_params(&params), pose);
    }

    #[test]
    fn test_rotation_jacobian_matches_finite_differences() {
        let pose = sample_pose().normalized();
        let u = pose.unit_rotation();
        let b = Vector3::new(0.4, -1.1, 2.3);
        let analytic = rotation_jacobian(&u, &b);

        let h = 1e-6;
        let base = Vector4::new(u.w, u.i, u.j, u.k);
        for m in 0..4 {
            let mut plus = base;
            let mut minus = base;
            plus[m] += h;
            minus[m] -= h;
            // Evaluate the quadratic form of R directly (no renormalization)
            let rot = |c: Vector4<f64>| {
                let q = Quaternion::new(c[0], c[1], c[2], c[3]);
                let v = Quaternion::from_imag(b);
                (q * v * q.conjugate()).imag()
            };
            let numeric = (rot(plus) - rot(minus)) / (2.0 * h);
            for k in 0..3 {
                assert_approx_eq!(analytic[m][k], numeric[k], 1e-6);
            }
        }
    }

    #[test]
    fn test_projected_gradient_is_orthogonal_to_quaternion() {
        let q = Quaternion::new(0.9, 0.3, -0.2, 0.1);
        let g = Vector4::new(1.0, 2.0, 3.0, 4.0);
        let projected = project_quaternion_gradient(&q, &g);
        let qv = Vector4::new(q.w, q.i, q.j, q.k);
        assert_approx_eq!(projected.dot(&qv), 0.0, 1e-12);
    }
}
