//! Starting pose enumeration for shape alignment
//!
//! Candidate poses superimpose the principal axes of the two shapes at a set of
//! anchor points (shape centroids, element centers, random offsets). Axis flips
//! are added according to the rotational symmetry of the smaller shape, and
//! poses that coincide after rounding are dropped.

use bitflags::bitflags;
use nalgebra::{Matrix3, Vector3};
use rand::prelude::*;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::math::Pose;
use crate::shape::prepare::{PreparedElement, PreparedShape, SymmetryClass};

bitflags! {
    /// Bit set selecting the starting pose families
    ///
    /// Serialized as the raw integer; unknown bits are dropped when reading.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(from = "u32", into = "u32")]
    pub struct AlignmentMode: u32 {
        /// Superimpose the shape centroids
        const SHAPE_CENTROID = 0x1;
        /// Put the smaller shape's centroid on each volume element of the larger one
        const ATOM_CENTERS = 0x2;
        /// Put the smaller shape's centroid on each color element of the larger one
        const COLOR_FEATURE_CENTERS = 0x4;
        /// Randomly displaced centroid superpositions
        const RANDOM = 0x8;
    }
}

impl Default for AlignmentMode {
    fn default() -> Self {
        AlignmentMode::SHAPE_CENTROID
    }
}

impl From<u32> for AlignmentMode {
    fn from(bits: u32) -> Self {
        Self::from_bits_truncate(bits)
    }
}

impl From<AlignmentMode> for u32 {
    fn from(mode: AlignmentMode) -> Self {
        mode.bits()
    }
}

/// Parameters for starting pose generation
#[derive(Debug, Clone)]
pub struct StartPoseParams {
    /// Enabled pose families
    pub mode: AlignmentMode,

    /// Number of random translations drawn when `RANDOM` is enabled
    pub num_random_starts: usize,

    /// Maximum random displacement per axis (in Angstroms)
    pub max_random_translation: f64,
}

impl Default for StartPoseParams {
    fn default() -> Self {
        Self {
            mode: AlignmentMode::default(),
            num_random_starts: 4,
            max_random_translation: 2.0,
        }
    }
}

/// Pose signature used for duplicate detection
type PoseSignature = [i64; 7];

/// Generates deduplicated starting poses; owns the seeded random engine
#[derive(Debug, Clone)]
pub struct StartPoseGenerator {
    pub params: StartPoseParams,
    rng: StdRng,
    seen: HashSet<PoseSignature>,
    poses: Vec<Pose>,
}

impl StartPoseGenerator {
    /// Create a generator whose random family is driven by `seed`
    pub fn new(params: StartPoseParams, seed: u64) -> Self {
        Self {
            params,
            rng: StdRng::seed_from_u64(seed),
            seen: HashSet::new(),
            poses: Vec::new(),
        }
    }

    /// Restart the random stream
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Starting poses moving `candidate` onto `reference`
    ///
    /// Returns an empty slice when either shape is degenerate.
    pub fn generate(&mut self, reference: &PreparedShape, candidate: &PreparedShape) -> &[Pose] {
        self.poses.clear();
        self.seen.clear();

        if reference.is_degenerate() || candidate.is_degenerate() {
            return &self.poses;
        }

        let smaller_class = if candidate.self_overlap() <= reference.self_overlap() {
            candidate.symmetry_class()
        } else {
            reference.symmetry_class()
        };
        let rotations: Vec<Matrix3<f64>> = symmetry_rotations(smaller_class)
            .into_iter()
            .map(|flip| reference.principal_axes() * flip * candidate.principal_axes().transpose())
            .collect();

        let mode = self.params.mode;
        let mut anchors: Vec<(Vector3<f64>, Vector3<f64>)> = Vec::new();

        if mode.contains(AlignmentMode::SHAPE_CENTROID) {
            anchors.push((*reference.centroid(), *candidate.centroid()));
        }
        if mode.contains(AlignmentMode::ATOM_CENTERS) {
            center_anchors(
                reference,
                candidate,
                reference.shape_elements(),
                candidate.shape_elements(),
                &mut anchors,
            );
        }
        if mode.contains(AlignmentMode::COLOR_FEATURE_CENTERS) {
            center_anchors(
                reference,
                candidate,
                reference.color_elements(),
                candidate.color_elements(),
                &mut anchors,
            );
        }

        for (target, source) in &anchors {
            for rotation in &rotations {
                self.push_unique(rotation, target, source);
            }
        }

        if mode.contains(AlignmentMode::RANDOM) {
            for _ in 0..self.params.num_random_starts {
                let offset = self.random_translation();
                let target = reference.centroid() + offset;
                for rotation in &rotations {
                    self.push_unique(rotation, &target, candidate.centroid());
                }
            }
        }

        &self.poses
    }

    /// Poses produced by the last call to [`Self::generate`]
    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    /// Generate a random translation within the displacement box
    fn random_translation(&mut self) -> Vector3<f64> {
        let max = self.params.max_random_translation.abs();
        let dx = (self.rng.gen::<f64>() - 0.5) * 2.0 * max;
        let dy = (self.rng.gen::<f64>() - 0.5) * 2.0 * max;
        let dz = (self.rng.gen::<f64>() - 0.5) * 2.0 * max;

        Vector3::new(dx, dy, dz)
    }

    /// Add the pose rotating `source` by `rotation` onto `target` unless an equivalent one exists
    fn push_unique(&mut self, rotation: &Matrix3<f64>, target: &Vector3<f64>, source: &Vector3<f64>) {
        let pose = Pose::from_rotation_matrix(rotation, target - rotation * source);
        if self.seen.insert(signature(&pose)) {
            self.poses.push(pose);
        }
    }
}

/// Proper axis flips that give distinct poses for a shape of the given symmetry
fn symmetry_rotations(class: SymmetryClass) -> Vec<Matrix3<f64>> {
    let flip = |axis: usize| {
        let mut diagonal = Vector3::from_element(-1.0);
        diagonal[axis] = 1.0;
        Matrix3::from_diagonal(&diagonal)
    };

    match class {
        SymmetryClass::Asymmetric => vec![Matrix3::identity(), flip(0), flip(1), flip(2)],
        // Rotations about the unique axis are equivalent, only flipping it matters
        SymmetryClass::SymmetricTop { unique_axis } => {
            vec![Matrix3::identity(), flip((unique_axis + 1) % 3)]
        }
        SymmetryClass::Spherical => vec![Matrix3::identity()],
    }
}

/// Anchor the smaller shape's centroid on each element center of the larger one
fn center_anchors(
    reference: &PreparedShape,
    candidate: &PreparedShape,
    reference_elements: &[PreparedElement],
    candidate_elements: &[PreparedElement],
    anchors: &mut Vec<(Vector3<f64>, Vector3<f64>)>,
) {
    if reference.self_overlap() >= candidate.self_overlap() {
        anchors.extend(
            reference_elements
                .iter()
                .map(|e| (e.center, *candidate.centroid())),
        );
    } else {
        anchors.extend(
            candidate_elements
                .iter()
                .map(|e| (*reference.centroid(), e.center)),
        );
    }
}

/// Rounded pose with a sign-canonical quaternion
fn signature(pose: &Pose) -> PoseSignature {
    let q = pose.unit_rotation().into_inner();
    let sign = if q.w < 0.0 || (q.w == 0.0 && (q.i, q.j, q.k) < (0.0, 0.0, 0.0)) {
        -1.0
    } else {
        1.0
    };
    let round = |v: f64, scale: f64| (v * scale).round() as i64;
    let t = &pose.translation;

    [
        round(sign * q.w, 1e4),
        round(sign * q.i, 1e4),
        round(sign * q.j, 1e4),
        round(sign * q.k, 1e4),
        round(t.x, 1e3),
        round(t.y, 1e3),
        round(t.z, 1e3),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlap::OverlapEvaluator;
    use crate::shape::prepare::{ShapePreprocessor, ShapeRole};
    use crate::shape::{ShapeElement, ShapeModel};

    fn prepared(points: &[[f64; 3]]) -> PreparedShape {
        let shape: ShapeModel = points
            .iter()
            .map(|p| ShapeElement::new(Vector3::new(p[0], p[1], p[2]), 1.7, 2.7).unwrap())
            .collect();
        let mut evaluator = OverlapEvaluator::default();
        ShapePreprocessor::default().prepare(&shape, ShapeRole::Reference, 0, 0, &mut evaluator)
    }

    fn asymmetric(shift: [f64; 3]) -> PreparedShape {
        let base = [
            [-2.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [0.0, -1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, -0.3],
            [0.0, 0.0, 0.3],
        ];
        let points: Vec<[f64; 3]> = base
            .iter()
            .map(|p| [p[0] + shift[0], p[1] + shift[1], p[2] + shift[2]])
            .collect();
        prepared(&points)
    }

    #[test]
    fn test_mode_bits() {
        let mut mode = AlignmentMode::SHAPE_CENTROID | AlignmentMode::RANDOM;
        assert!(mode.contains(AlignmentMode::RANDOM));
        assert!(!mode.contains(AlignmentMode::ATOM_CENTERS));
        mode.remove(AlignmentMode::RANDOM);
        assert_eq!(mode, AlignmentMode::SHAPE_CENTROID);
        assert_eq!(AlignmentMode::from_bits_truncate(0xFF), AlignmentMode::all());
    }

    #[test]
    fn test_mode_serializes_as_integer() {
        let mode = AlignmentMode::ATOM_CENTERS | AlignmentMode::RANDOM;
        assert_eq!(serde_json::to_string(&mode).unwrap(), "10");

        let parsed: AlignmentMode = serde_json::from_str("37").unwrap();
        assert_eq!(parsed, AlignmentMode::SHAPE_CENTROID | AlignmentMode::COLOR_FEATURE_CENTERS);
        assert_eq!(AlignmentMode::default(), AlignmentMode::SHAPE_CENTROID);
    }

    #[test]
    fn test_degenerate_shape_yields_no_poses() {
        let mut generator = StartPoseGenerator::new(StartPoseParams::default(), 1);
        let reference = asymmetric([0.0; 3]);
        let empty = prepared(&[]);
        assert!(generator.generate(&reference, &empty).is_empty());
        assert!(generator.generate(&empty, &reference).is_empty());
    }

    #[test]
    fn test_asymmetric_centroid_poses() {
        let mut generator = StartPoseGenerator::new(StartPoseParams::default(), 1);
        let reference = asymmetric([0.0; 3]);
        let candidate = asymmetric([3.0, -1.0, 2.0]);
        let poses = generator.generate(&reference, &candidate).to_vec();
        assert_eq!(poses.len(), 4);
        for pose in &poses {
            let moved = pose.transform_point(candidate.centroid());
            assert!((moved - reference.centroid()).norm() < 1e-9);
        }
    }

    #[test]
    fn test_spherical_shape_single_rotation() {
        let mut generator = StartPoseGenerator::new(
            StartPoseParams {
                mode: AlignmentMode::SHAPE_CENTROID | AlignmentMode::ATOM_CENTERS,
                ..StartPoseParams::default()
            },
            1,
        );
        let reference = prepared(&[[0.0, 0.0, 0.0]]);
        let candidate = prepared(&[[1.0, 2.0, 3.0]]);
        // Centroid and atom-center anchors coincide, so only one pose survives
        assert_eq!(generator.generate(&reference, &candidate).len(), 1);
    }

    #[test]
    fn test_symmetric_top_uses_two_rotations() {
        let mut generator = StartPoseGenerator::new(StartPoseParams::default(), 1);
        let reference = asymmetric([0.0; 3]);
        let candidate = prepared(&[[-0.7, 0.0, 0.0], [0.7, 0.0, 0.0]]);
        assert_eq!(
            candidate.symmetry_class(),
            SymmetryClass::SymmetricTop { unique_axis: 0 }
        );
        assert_eq!(generator.generate(&reference, &candidate).len(), 2);
    }

    #[test]
    fn test_random_family_is_reproducible() {
        let params = StartPoseParams {
            mode: AlignmentMode::RANDOM,
            num_random_starts: 3,
            max_random_translation: 1.5,
        };
        let reference = asymmetric([0.0; 3]);
        let candidate = asymmetric([1.0, 1.0, 1.0]);

        let mut first = StartPoseGenerator::new(params.clone(), 42);
        let mut second = StartPoseGenerator::new(params, 42);
        let a = first.generate(&reference, &candidate).to_vec();
        let b = second.generate(&reference, &candidate).to_vec();
        assert_eq!(a.len(), 12);
        assert_eq!(a, b);
        for pose in &a {
            let offset = pose.transform_point(candidate.centroid()) - reference.centroid();
            assert!(offset.amax() <= 1.5 + 1e-9);
        }
    }

    #[test]
    fn test_more_families_extend_pose_list() {
        let reference = asymmetric([0.0; 3]);
        let candidate = asymmetric([0.5, 0.0, 0.0]);
        let mut narrow = StartPoseGenerator::new(StartPoseParams::default(), 7);
        let mut wide = StartPoseGenerator::new(
            StartPoseParams {
                mode: AlignmentMode::SHAPE_CENTROID | AlignmentMode::ATOM_CENTERS,
                ..StartPoseParams::default()
            },
            7,
        );
        let few = narrow.generate(&reference, &candidate).to_vec();
        let many = wide.generate(&reference, &candidate).to_vec();
        assert!(many.len() > few.len());
        assert_eq!(&many[..few.len()], &few[..]);
    }
}
