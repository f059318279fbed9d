//! Gaussian shape representation
//!
//! A shape is an ordered list of weighted Gaussian spheres. Elements without a
//! color id describe the molecular volume; elements carrying a nonzero color id
//! describe pharmacophore features and only interact with equally colored
//! elements of another shape.

pub mod prepare;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

use crate::math::Pose;

pub use prepare::{PreparedShape, ShapeRole, SymmetryClass};

/// Errors raised when a shape violates its construction preconditions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("Element radius must be positive and finite, got {0}")]
    InvalidRadius(f64),

    #[error("Element weight factor must be positive and finite, got {0}")]
    InvalidWeight(f64),

    #[error("Element center is not finite: {0:?}")]
    NonFiniteCenter(Vector3<f64>),

    #[error("Length mismatch for {what}: expected {expected}, found {found}")]
    MismatchedLengths {
        what: &'static str,
        expected: usize,
        found: usize,
    },
}

/// A single Gaussian sphere
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeElement {
    center: Vector3<f64>,
    radius: f64,
    weight_factor: f64,
    color_id: Option<u32>,
    hardness: f64,
    derived_volume: f64,
}

impl ShapeElement {
    /// Create an uncolored (volume) element
    pub fn new(center: Vector3<f64>, radius: f64, weight_factor: f64) -> Result<Self, ShapeError> {
        Self::with_color(center, radius, weight_factor, None)
    }

    /// Create an element with an optional color id; a color id of zero means "no color"
    pub fn with_color(
        center: Vector3<f64>,
        radius: f64,
        weight_factor: f64,
        color_id: Option<u32>,
    ) -> Result<Self, ShapeError> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(ShapeError::InvalidRadius(radius));
        }
        if !(weight_factor.is_finite() && weight_factor > 0.0) {
            return Err(ShapeError::InvalidWeight(weight_factor));
        }
        if !center.iter().all(|c| c.is_finite()) {
            return Err(ShapeError::NonFiniteCenter(center));
        }

        // Gaussian exponent chosen so the Gaussian integrates to the hard-sphere volume
        let hardness = PI * (3.0 * weight_factor / (4.0 * PI * radius.powi(3))).powf(2.0 / 3.0);
        let derived_volume = weight_factor * (PI / hardness).powf(1.5);

        Ok(Self {
            center,
            radius,
            weight_factor,
            color_id: color_id.filter(|&c| c != 0),
            hardness,
            derived_volume,
        })
    }

    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn weight_factor(&self) -> f64 {
        self.weight_factor
    }

    pub fn color_id(&self) -> Option<u32> {
        self.color_id
    }

    pub fn is_colored(&self) -> bool {
        self.color_id.is_some()
    }

    /// Gaussian exponent `alpha` of this element
    pub fn hardness(&self) -> f64 {
        self.hardness
    }

    /// Integral of the element's Gaussian density (equals the hard-sphere volume)
    pub fn derived_volume(&self) -> f64 {
        self.derived_volume
    }

    /// Same element moved by a rigid motion
    pub fn transformed(&self, pose: &Pose) -> Self {
        Self {
            center: pose.transform_point(&self.center),
            ..self.clone()
        }
    }
}

/// An immutable, ordered collection of Gaussian elements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeModel {
    elements: Vec<ShapeElement>,
}

impl ShapeModel {
    /// Create an empty shape
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shape from already validated elements
    pub fn from_elements(elements: Vec<ShapeElement>) -> Self {
        Self { elements }
    }

    /// Build a shape from parallel arrays; `colors` may be empty for an uncolored shape
    pub fn from_arrays(
        centers: &[Vector3<f64>],
        radii: &[f64],
        weights: &[f64],
        colors: &[u32],
    ) -> Result<Self, ShapeError> {
        let n = centers.len();
        if radii.len() != n {
            return Err(ShapeError::MismatchedLengths {
                what: "radii",
                expected: n,
                found: radii.len(),
            });
        }
        if weights.len() != n {
            return Err(ShapeError::MismatchedLengths {
                what: "weights",
                expected: n,
                found: weights.len(),
            });
        }
        if !colors.is_empty() && colors.len() != n {
            return Err(ShapeError::MismatchedLengths {
                what: "colors",
                expected: n,
                found: colors.len(),
            });
        }

        let elements = (0..n)
            .map(|i| {
                let color = colors.get(i).copied();
                ShapeElement::with_color(centers[i], radii[i], weights[i], color)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { elements })
    }

    /// Append an element
    pub fn push(&mut self, element: ShapeElement) {
        self.elements.push(element);
    }

    pub fn elements(&self) -> &[ShapeElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Elements describing the molecular volume
    pub fn shape_elements(&self) -> impl Iterator<Item = &ShapeElement> {
        self.elements.iter().filter(|e| !e.is_colored())
    }

    /// Elements describing pharmacophore features
    pub fn color_elements(&self) -> impl Iterator<Item = &ShapeElement> {
        self.elements.iter().filter(|e| e.is_colored())
    }

    /// Volume-weighted centroid of the uncolored elements
    pub fn centroid(&self) -> Option<Vector3<f64>> {
        let (sum, total) = self
            .shape_elements()
            .fold((Vector3::zeros(), 0.0), |(sum, total), e| {
                (sum + e.center * e.derived_volume, total + e.derived_volume)
            });

        if total > 0.0 {
            Some(sum / total)
        } else {
            None
        }
    }

    /// Copy of the shape moved by a rigid motion
    pub fn transformed(&self, pose: &Pose) -> Self {
        Self {
            elements: self.elements.iter().map(|e| e.transformed(pose)).collect(),
        }
    }
}

impl FromIterator<ShapeElement> for ShapeModel {
    fn from_iter<I: IntoIterator<Item = ShapeElement>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_derived_volume_is_sphere_volume() {
        let e = ShapeElement::new(Vector3::zeros(), 1.7, 2.7).unwrap();
        assert_approx_eq!(e.derived_volume(), 4.0 / 3.0 * PI * 1.7f64.powi(3), 1e-9);
    }

    #[test]
    fn test_invalid_elements_rejected() {
        assert_eq!(
            ShapeElement::new(Vector3::zeros(), 0.0, 1.0),
            Err(ShapeError::InvalidRadius(0.0))
        );
        assert_eq!(
            ShapeElement::new(Vector3::zeros(), 1.0, -2.0),
            Err(ShapeError::InvalidWeight(-2.0))
        );
        assert!(matches!(
            ShapeElement::new(Vector3::new(f64::NAN, 0.0, 0.0), 1.0, 1.0),
            Err(ShapeError::NonFiniteCenter(_))
        ));
    }

    #[test]
    fn test_zero_color_means_uncolored() {
        let e = ShapeElement::with_color(Vector3::zeros(), 1.0, 1.0, Some(0)).unwrap();
        assert!(!e.is_colored());
        let c = ShapeElement::with_color(Vector3::zeros(), 1.0, 1.0, Some(3)).unwrap();
        assert_eq!(c.color_id(), Some(3));
    }

    #[test]
    fn test_from_arrays_checks_lengths() {
        let centers = [Vector3::zeros(), Vector3::x()];
        let err = ShapeModel::from_arrays(&centers, &[1.0], &[1.0, 1.0], &[]).unwrap_err();
        assert_eq!(
            err,
            ShapeError::MismatchedLengths {
                what: "radii",
                expected: 2,
                found: 1
            }
        );

        let shape = ShapeModel::from_arrays(&centers, &[1.0, 1.0], &[1.0, 1.0], &[0, 2]).unwrap();
        assert_eq!(shape.shape_elements().count(), 1);
        assert_eq!(shape.color_elements().count(), 1);
    }

    #[test]
    fn test_centroid_ignores_color_elements() {
        let shape = ShapeModel::from_arrays(
            &[Vector3::new(-1.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0), Vector3::new(9.0, 9.0, 9.0)],
            &[1.0, 1.0, 1.0],
            &[1.0, 1.0, 1.0],
            &[0, 0, 5],
        )
        .unwrap();
        let c = shape.centroid().unwrap();
        assert!(c.norm() < 1e-12);
        assert!(ShapeModel::new().centroid().is_none());
    }
}
