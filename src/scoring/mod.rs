//! Overlap-ratio scoring functions
//!
//! A scorer turns the overlap volumes recorded in an [`AlignmentResult`] into a
//! single similarity value. Scorers are pure: they only read the result.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentResult;

/// Fills [`AlignmentResult::score`]
pub trait Scorer: Send + Sync {
    fn score(&self, result: &AlignmentResult) -> f64;
}

impl<F> Scorer for F
where
    F: Fn(&AlignmentResult) -> f64 + Send + Sync,
{
    fn score(&self, result: &AlignmentResult) -> f64 {
        self(result)
    }
}

/// `overlap / (a + b - overlap)`, zero when undefined
pub fn tanimoto(overlap: f64, self_a: f64, self_b: f64) -> f64 {
    let denominator = self_a + self_b - overlap;
    if denominator > 0.0 {
        overlap / denominator
    } else {
        0.0
    }
}

/// `overlap / (alpha (a - overlap) + beta (b - overlap) + overlap)`, zero when undefined
pub fn tversky(overlap: f64, self_a: f64, self_b: f64, alpha: f64, beta: f64) -> f64 {
    let denominator = alpha * (self_a - overlap) + beta * (self_b - overlap) + overlap;
    if denominator > 0.0 {
        overlap / denominator
    } else {
        0.0
    }
}

/// Tanimoto of the summed shape and color overlaps
#[derive(Debug, Clone, Copy, Default)]
pub struct TotalOverlapTanimoto;

impl Scorer for TotalOverlapTanimoto {
    fn score(&self, r: &AlignmentResult) -> f64 {
        tanimoto(
            r.overlap + r.color_overlap,
            r.reference_self_overlap + r.reference_color_self_overlap,
            r.aligned_self_overlap + r.aligned_color_self_overlap,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeTanimoto;

impl Scorer for ShapeTanimoto {
    fn score(&self, r: &AlignmentResult) -> f64 {
        tanimoto(r.overlap, r.reference_self_overlap, r.aligned_self_overlap)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ColorTanimoto;

impl Scorer for ColorTanimoto {
    fn score(&self, r: &AlignmentResult) -> f64 {
        tanimoto(
            r.color_overlap,
            r.reference_color_self_overlap,
            r.aligned_color_self_overlap,
        )
    }
}

/// Shape Tanimoto plus color Tanimoto, ranging from 0 to 2
#[derive(Debug, Clone, Copy, Default)]
pub struct TanimotoCombo;

impl Scorer for TanimotoCombo {
    fn score(&self, r: &AlignmentResult) -> f64 {
        ShapeTanimoto.score(r) + ColorTanimoto.score(r)
    }
}

/// Weights of the two unmatched volumes in a Tversky ratio
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TverskyWeights {
    /// Weight of the reference volume outside the overlap
    pub alpha: f64,
    /// Weight of the aligned volume outside the overlap
    pub beta: f64,
}

impl TverskyWeights {
    /// Emphasizes how much of the reference is covered
    pub const REFERENCE: Self = Self {
        alpha: 0.95,
        beta: 0.05,
    };

    /// Emphasizes how much of the aligned shape is covered
    pub const ALIGNED: Self = Self {
        alpha: 0.05,
        beta: 0.95,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapeTversky(pub TverskyWeights);

impl ShapeTversky {
    pub fn reference_weighted() -> Self {
        Self(TverskyWeights::REFERENCE)
    }

    pub fn aligned_weighted() -> Self {
        Self(TverskyWeights::ALIGNED)
    }
}

impl Scorer for ShapeTversky {
    fn score(&self, r: &AlignmentResult) -> f64 {
        tversky(
            r.overlap,
            r.reference_self_overlap,
            r.aligned_self_overlap,
            self.0.alpha,
            self.0.beta,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorTversky(pub TverskyWeights);

impl ColorTversky {
    pub fn reference_weighted() -> Self {
        Self(TverskyWeights::REFERENCE)
    }

    pub fn aligned_weighted() -> Self {
        Self(TverskyWeights::ALIGNED)
    }
}

impl Scorer for ColorTversky {
    fn score(&self, r: &AlignmentResult) -> f64 {
        tversky(
            r.color_overlap,
            r.reference_color_self_overlap,
            r.aligned_color_self_overlap,
            self.0.alpha,
            self.0.beta,
        )
    }
}

/// Shape Tversky plus color Tversky with shared weights
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TverskyCombo(pub TverskyWeights);

impl TverskyCombo {
    pub fn reference_weighted() -> Self {
        Self(TverskyWeights::REFERENCE)
    }

    pub fn aligned_weighted() -> Self {
        Self(TverskyWeights::ALIGNED)
    }
}

impl Scorer for TverskyCombo {
    fn score(&self, r: &AlignmentResult) -> f64 {
        ShapeTversky(self.0).score(r) + ColorTversky(self.0).score(r)
    }
}

/// Built-in scorers selectable by name from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScoringFunction {
    TotalOverlapTanimoto,
    ShapeTanimoto,
    ColorTanimoto,
    #[default]
    TanimotoCombo,
    ReferenceShapeTversky,
    AlignedShapeTversky,
    ReferenceTverskyCombo,
    AlignedTverskyCombo,
}

impl ScoringFunction {
    pub fn name(&self) -> &'static str {
        match self {
            ScoringFunction::TotalOverlapTanimoto => "total_overlap_tanimoto",
            ScoringFunction::ShapeTanimoto => "shape_tanimoto",
            ScoringFunction::ColorTanimoto => "color_tanimoto",
            ScoringFunction::TanimotoCombo => "tanimoto_combo",
            ScoringFunction::ReferenceShapeTversky => "reference_shape_tversky",
            ScoringFunction::AlignedShapeTversky => "aligned_shape_tversky",
            ScoringFunction::ReferenceTverskyCombo => "reference_tversky_combo",
            ScoringFunction::AlignedTverskyCombo => "aligned_tversky_combo",
        }
    }

    /// Parse a scorer name; unknown names fall back to Tanimoto combo
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "total_overlap_tanimoto" => ScoringFunction::TotalOverlapTanimoto,
            "shape_tanimoto" => ScoringFunction::ShapeTanimoto,
            "color_tanimoto" => ScoringFunction::ColorTanimoto,
            "tanimoto_combo" => ScoringFunction::TanimotoCombo,
            "reference_shape_tversky" => ScoringFunction::ReferenceShapeTversky,
            "aligned_shape_tversky" => ScoringFunction::AlignedShapeTversky,
            "reference_tversky_combo" => ScoringFunction::ReferenceTverskyCombo,
            "aligned_tversky_combo" => ScoringFunction::AlignedTverskyCombo,
            _ => {
                let fallback = ScoringFunction::default();
                warn!(
                    "Unknown scoring function: {}. Using {} instead.",
                    name,
                    fallback.name()
                );
                fallback
            }
        }
    }
}

impl From<String> for ScoringFunction {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<ScoringFunction> for String {
    fn from(function: ScoringFunction) -> Self {
        function.name().to_string()
    }
}

impl Scorer for ScoringFunction {
    fn score(&self, r: &AlignmentResult) -> f64 {
        match self {
            ScoringFunction::TotalOverlapTanimoto => TotalOverlapTanimoto.score(r),
            ScoringFunction::ShapeTanimoto => ShapeTanimoto.score(r),
            ScoringFunction::ColorTanimoto => ColorTanimoto.score(r),
            ScoringFunction::TanimotoCombo => TanimotoCombo.score(r),
            ScoringFunction::ReferenceShapeTversky => ShapeTversky::reference_weighted().score(r),
            ScoringFunction::AlignedShapeTversky => ShapeTversky::aligned_weighted().score(r),
            ScoringFunction::ReferenceTverskyCombo => TverskyCombo::reference_weighted().score(r),
            ScoringFunction::AlignedTverskyCombo => TverskyCombo::aligned_weighted().score(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn result(overlap: f64, color: f64) -> AlignmentResult {
        AlignmentResult {
            overlap,
            color_overlap: color,
            reference_self_overlap: 10.0,
            aligned_self_overlap: 6.0,
            reference_color_self_overlap: 2.0,
            aligned_color_self_overlap: 1.0,
            ..AlignmentResult::default()
        }
    }

    #[test]
    fn test_identical_shapes_score_one() {
        let r = AlignmentResult {
            overlap: 5.0,
            color_overlap: 1.0,
            reference_self_overlap: 5.0,
            aligned_self_overlap: 5.0,
            reference_color_self_overlap: 1.0,
            aligned_color_self_overlap: 1.0,
            ..AlignmentResult::default()
        };
        assert_approx_eq!(ShapeTanimoto.score(&r), 1.0, 1e-12);
        assert_approx_eq!(TanimotoCombo.score(&r), 2.0, 1e-12);
        assert_approx_eq!(TverskyCombo::reference_weighted().score(&r), 2.0, 1e-12);
    }

    #[test]
    fn test_tanimoto_values() {
        let r = result(4.0, 0.5);
        assert_approx_eq!(ShapeTanimoto.score(&r), 4.0 / 12.0, 1e-12);
        assert_approx_eq!(ColorTanimoto.score(&r), 0.5 / 2.5, 1e-12);
        assert_approx_eq!(TotalOverlapTanimoto.score(&r), 4.5 / 14.5, 1e-12);
    }

    #[test]
    fn test_tversky_weighting() {
        // The aligned shape is smaller, so weighting its coverage scores higher
        let r = result(5.0, 0.0);
        let reference = ShapeTversky::reference_weighted().score(&r);
        let aligned = ShapeTversky::aligned_weighted().score(&r);
        assert_approx_eq!(reference, 5.0 / (0.95 * 5.0 + 0.05 * 1.0 + 5.0), 1e-12);
        assert!(aligned > reference);
    }

    #[test]
    fn test_no_color_scores_zero() {
        let r = AlignmentResult {
            overlap: 1.0,
            reference_self_overlap: 1.0,
            aligned_self_overlap: 1.0,
            ..AlignmentResult::default()
        };
        assert_eq!(ColorTanimoto.score(&r), 0.0);
        assert_eq!(ColorTversky::reference_weighted().score(&r), 0.0);
    }

    #[test]
    fn test_scoring_function_names() {
        let f: ScoringFunction = serde_json::from_str("\"shape_tanimoto\"").unwrap();
        assert_eq!(f, ScoringFunction::ShapeTanimoto);
        assert_eq!(
            ScoringFunction::from_name("no_such_score"),
            ScoringFunction::TanimotoCombo
        );
        assert_eq!(
            serde_json::to_string(&ScoringFunction::AlignedTverskyCombo).unwrap(),
            "\"aligned_tversky_combo\""
        );
    }

    #[test]
    fn test_closure_scorer() {
        let doubled = |r: &AlignmentResult| 2.0 * r.overlap;
        assert_eq!(doubled.score(&result(3.0, 0.0)), 6.0);
    }
}
