//! RustShape: Gaussian shape overlay and shape-based screening
//!
//! This library aligns molecular shapes, represented as sums of weighted
//! Gaussian spheres, by maximizing their overlap volume, and screens candidate
//! structures against query shapes using overlap-ratio scores.

pub mod alignment;
pub mod math;
pub mod optimization;
pub mod overlap;
pub mod scoring;
pub mod screening;
pub mod shape;

// Re-export commonly used types and functions
pub use alignment::{
    AlignmentEngine, AlignmentError, AlignmentOptions, AlignmentResult, ResultSelectionMode,
};
pub use math::Pose;
pub use optimization::{AlignmentMode, OptimizerState};
pub use scoring::{Scorer, ScoringFunction};
pub use screening::{
    HitSink, ScreeningError, ScreeningMode, ScreeningProcessor, ScreeningSettings, ShapeGenerator,
};
pub use shape::{ShapeElement, ShapeError, ShapeModel};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error type of caller-supplied capabilities such as shape generators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
