//! Shape preprocessing: working arrays, self-overlaps and rotational symmetry

use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use crate::math::Pose;
use crate::overlap::OverlapEvaluator;
use crate::shape::ShapeModel;

/// Role a shape plays in an alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeRole {
    /// Fixed shape the others are aligned onto
    Reference,
    /// Moving shape whose pose is optimized
    Aligned,
}

/// Coarse rotational symmetry of a shape, derived from its principal moments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymmetryClass {
    /// Three distinct principal moments
    Asymmetric,
    /// Two equal moments; `unique_axis` is the index of the distinct one
    SymmetricTop { unique_axis: usize },
    /// All three moments equal
    Spherical,
}

impl SymmetryClass {
    /// Classify sorted principal moments; two moments are equal when they differ
    /// by at most `threshold` relative to the larger magnitude
    pub fn classify(moments: &Vector3<f64>, threshold: f64) -> Self {
        let equal = |a: f64, b: f64| (a - b).abs() <= threshold * a.abs().max(b.abs());
        let low_pair = equal(moments[0], moments[1]);
        let high_pair = equal(moments[1], moments[2]);

        match (low_pair, high_pair) {
            (true, true) => SymmetryClass::Spherical,
            (true, false) => SymmetryClass::SymmetricTop { unique_axis: 2 },
            (false, true) => SymmetryClass::SymmetricTop { unique_axis: 0 },
            (false, false) => SymmetryClass::Asymmetric,
        }
    }
}

/// Element data in the layout the overlap sums consume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedElement {
    pub center: Vector3<f64>,
    pub hardness: f64,
    pub weight: f64,
    /// Zero for volume elements
    pub color: u32,
}

/// A shape expanded into working arrays, owned and rebuilt by the alignment engine
#[derive(Debug, Clone)]
pub struct PreparedShape {
    /// Volume elements first, color elements from `color_start` on
    elements: Vec<PreparedElement>,
    color_start: usize,
    self_overlap: f64,
    color_self_overlap: f64,
    symmetry_class: SymmetryClass,
    centroid: Vector3<f64>,
    principal_axes: Matrix3<f64>,
    moments: Vector3<f64>,
    role: ShapeRole,
    owner_set_index: usize,
    owner_index: usize,
}

impl PreparedShape {
    /// An empty working shape, ready to be filled by [`ShapePreprocessor::prepare_into`]
    pub fn empty(role: ShapeRole) -> Self {
        Self {
            elements: Vec::new(),
            color_start: 0,
            self_overlap: 0.0,
            color_self_overlap: 0.0,
            symmetry_class: SymmetryClass::Spherical,
            centroid: Vector3::zeros(),
            principal_axes: Matrix3::identity(),
            moments: Vector3::zeros(),
            role,
            owner_set_index: 0,
            owner_index: 0,
        }
    }

    pub fn elements(&self) -> &[PreparedElement] {
        &self.elements
    }

    /// Volume elements
    pub fn shape_elements(&self) -> &[PreparedElement] {
        &self.elements[..self.color_start]
    }

    /// Color (feature) elements
    pub fn color_elements(&self) -> &[PreparedElement] {
        &self.elements[self.color_start..]
    }

    /// Index of the first color element
    pub fn color_start(&self) -> usize {
        self.color_start
    }

    pub fn self_overlap(&self) -> f64 {
        self.self_overlap
    }

    pub fn color_self_overlap(&self) -> f64 {
        self.color_self_overlap
    }

    pub fn symmetry_class(&self) -> SymmetryClass {
        self.symmetry_class
    }

    /// Volume-weighted centroid of the volume elements
    pub fn centroid(&self) -> &Vector3<f64> {
        &self.centroid
    }

    /// Right-handed principal axes as matrix columns, sorted by ascending moment
    pub fn principal_axes(&self) -> &Matrix3<f64> {
        &self.principal_axes
    }

    /// Principal moments matching the columns of [`Self::principal_axes`]
    pub fn moments(&self) -> &Vector3<f64> {
        &self.moments
    }

    pub fn role(&self) -> ShapeRole {
        self.role
    }

    pub fn owner_set_index(&self) -> usize {
        self.owner_set_index
    }

    pub fn owner_index(&self) -> usize {
        self.owner_index
    }

    /// A zero self-overlap marks an empty or zero-weight shape that cannot be aligned
    pub fn is_degenerate(&self) -> bool {
        self.self_overlap <= 0.0
    }

    /// Clear all working data while keeping the allocation
    pub fn reset(&mut self) {
        self.elements.clear();
        self.color_start = 0;
        self.self_overlap = 0.0;
        self.color_self_overlap = 0.0;
        self.symmetry_class = SymmetryClass::Spherical;
        self.centroid = Vector3::zeros();
        self.principal_axes = Matrix3::identity();
        self.moments = Vector3::zeros();
    }
}

/// Builds [`PreparedShape`]s from caller-owned [`ShapeModel`]s
#[derive(Debug, Clone)]
pub struct ShapePreprocessor {
    pub symmetry_threshold: f64,
}

impl Default for ShapePreprocessor {
    fn default() -> Self {
        Self {
            symmetry_threshold: 0.15,
        }
    }
}

impl ShapePreprocessor {
    pub fn new(symmetry_threshold: f64) -> Self {
        Self { symmetry_threshold }
    }

    /// Prepare a new working shape
    pub fn prepare(
        &self,
        shape: &ShapeModel,
        role: ShapeRole,
        owner_set_index: usize,
        owner_index: usize,
        evaluator: &mut OverlapEvaluator,
    ) -> PreparedShape {
        let mut prepared = PreparedShape::empty(role);
        self.prepare_into(shape, owner_set_index, owner_index, evaluator, &mut prepared);
        prepared
    }

    /// Refill `target` from `shape`, reusing its buffers; the role of `target` is kept
    pub fn prepare_into(
        &self,
        shape: &ShapeModel,
        owner_set_index: usize,
        owner_index: usize,
        evaluator: &mut OverlapEvaluator,
        target: &mut PreparedShape,
    ) {
        target.reset();
        target.owner_set_index = owner_set_index;
        target.owner_index = owner_index;

        let to_prepared = |e: &crate::shape::ShapeElement| PreparedElement {
            center: *e.center(),
            hardness: e.hardness(),
            weight: e.weight_factor(),
            color: e.color_id().unwrap_or(0),
        };
        target.elements.extend(shape.shape_elements().map(to_prepared));
        target.color_start = target.elements.len();
        target.elements.extend(shape.color_elements().map(to_prepared));

        let values = evaluator.evaluate(&*target, &*target, &Pose::identity(), true, None);
        target.self_overlap = values.overlap;
        target.color_self_overlap = values.color_overlap;

        if let Some(centroid) = shape.centroid() {
            let (axes, moments) = principal_axes(shape, &centroid);
            target.centroid = centroid;
            target.principal_axes = axes;
            target.moments = moments;
            target.symmetry_class = SymmetryClass::classify(&moments, self.symmetry_threshold);
        }
    }

    /// Recompute the setting-dependent fields of an already prepared shape
    pub fn refresh(&self, target: &mut PreparedShape, evaluator: &mut OverlapEvaluator) {
        let values = evaluator.evaluate(&*target, &*target, &Pose::identity(), true, None);
        target.self_overlap = values.overlap;
        target.color_self_overlap = values.color_overlap;
        target.symmetry_class = SymmetryClass::classify(&target.moments, self.symmetry_threshold);
    }
}

/// Volume-weighted inertia tensor eigen-decomposition of the volume elements
fn principal_axes(shape: &ShapeModel, centroid: &Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let tensor = shape.shape_elements().fold(Matrix3::zeros(), |acc, e| {
        let x = e.center() - centroid;
        acc + (Matrix3::identity() * x.norm_squared() - x * x.transpose()) * e.derived_volume()
    });

    let eigen = SymmetricEigen::new(tensor);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let mut axes = Matrix3::zeros();
    let mut moments = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        axes.set_column(dst, &eigen.eigenvectors.column(src));
        moments[dst] = eigen.eigenvalues[src];
    }

    if axes.determinant() < 0.0 {
        let flipped = -axes.column(2);
        axes.set_column(2, &flipped);
    }

    (axes, moments)
}
