//! Gaussian shape alignment engine
//!
//! The engine holds a list of reference shapes (grouped into sets) and aligns
//! candidate shapes onto each of them: starting poses are enumerated, every
//! pose is refined by BFGS on the overlap volume, and the resulting optima are
//! scored and collected.

pub mod results;

use log::debug;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::{Pose, PoseParams};
use crate::optimization::{
    AlignmentMode, LocalOptimizer, LocalOptimizerParams, LocalOptimum, OptimizerState,
    StartPoseGenerator, StartPoseParams,
};
use crate::overlap::{OverlapEvaluator, OverlapGradient, OverlapParams};
use crate::scoring::{Scorer, ScoringFunction};
use crate::shape::prepare::{PreparedShape, ShapePreprocessor, ShapeRole};
use crate::shape::ShapeModel;

pub use results::{select_results, Comparator, HigherScore, ResultCollector, ResultSelectionMode};

/// Errors that can occur during alignment
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentError {
    #[error("No reference shapes have been added")]
    NoReferenceShapes,

    #[error("Reference shape index {index} out of range (have {count})")]
    ReferenceIndexOutOfRange { index: usize, count: usize },
}

/// Settings of an [`AlignmentEngine`]
#[derive(Debug, Clone)]
pub struct AlignmentOptions {
    /// Enabled starting pose families
    pub alignment_mode: AlignmentMode,

    /// Refine starting poses; when off, starting poses are reported as they are
    pub perform_optimization: bool,

    /// Iteration cap of a single local optimization
    pub max_num_optimization_iterations: usize,

    /// Gradient norm below which an optimization counts as converged
    pub optimization_stop_gradient: f64,

    /// Stop after the first starting pose whose optimum beats every starting pose
    pub greedy_optimization: bool,

    /// Random translations drawn per shape pair when `RANDOM` starts are enabled
    pub num_random_starts: usize,

    /// Maximum random displacement per axis (in Angstroms)
    pub max_random_translation: f64,

    /// Seed of the random starting pose stream, restarted for every `align` call
    pub random_seed: u64,

    /// Relative tolerance for equal principal moments
    pub symmetry_threshold: f64,

    /// Weight of the color overlap in the objective; zero optimizes shape only
    pub color_weight: f64,

    /// Pair overlaps whose exponential factor is smaller than this are skipped
    pub overlap_epsilon: f64,

    /// Which results `results()` reports
    pub result_selection_mode: ResultSelectionMode,
}

impl Default for AlignmentOptions {
    fn default() -> Self {
        Self {
            alignment_mode: AlignmentMode::default(),
            perform_optimization: true,
            max_num_optimization_iterations: 20,
            optimization_stop_gradient: 0.01,
            greedy_optimization: false,
            num_random_starts: 4,
            max_random_translation: 2.0,
            random_seed: 0x5eed,
            symmetry_threshold: 0.15,
            color_weight: 1.0,
            overlap_epsilon: 1e-9,
            result_selection_mode: ResultSelectionMode::default(),
        }
    }
}

/// One retained local optimum of a (reference shape, aligned shape) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    /// Homogeneous transform moving the aligned shape onto the reference
    pub transform: Matrix4<f64>,

    /// Value of the configured scoring function
    pub score: f64,

    pub overlap: f64,
    pub color_overlap: f64,
    pub reference_self_overlap: f64,
    pub reference_color_self_overlap: f64,
    pub aligned_self_overlap: f64,
    pub aligned_color_self_overlap: f64,

    pub reference_shape_set_index: usize,
    pub reference_shape_index: usize,
    pub aligned_shape_index: usize,

    /// Terminal state of the local optimization that produced this result
    pub optimizer_state: OptimizerState,

    /// Optimizer iterations spent
    pub iterations: usize,
}

impl Default for AlignmentResult {
    fn default() -> Self {
        Self {
            transform: Matrix4::identity(),
            score: 0.0,
            overlap: 0.0,
            color_overlap: 0.0,
            reference_self_overlap: 0.0,
            reference_color_self_overlap: 0.0,
            aligned_self_overlap: 0.0,
            aligned_color_self_overlap: 0.0,
            reference_shape_set_index: 0,
            reference_shape_index: 0,
            aligned_shape_index: 0,
            optimizer_state: OptimizerState::Converged,
            iterations: 0,
        }
    }
}

impl AlignmentResult {
    /// Identity key `(reference set, reference shape, aligned shape)`
    pub fn key(&self) -> (usize, usize, usize) {
        (
            self.reference_shape_set_index,
            self.reference_shape_index,
            self.aligned_shape_index,
        )
    }

    /// Whether the optimizer met its gradient-norm criterion
    pub fn converged(&self) -> bool {
        self.optimizer_state == OptimizerState::Converged
    }

    /// The transform as a pose
    pub fn pose(&self) -> Pose {
        Pose::from_matrix(&self.transform)
    }
}

/// Aligns candidate shapes onto a set of reference shapes
///
/// All working state (prepared shapes, optimizer workspace, random engine,
/// results) is owned by the engine; use one engine per thread. Every `align`
/// call clears the previous results and restarts the random stream, so results
/// only depend on the inputs and the options. [`AlignmentEngine::reset`] also
/// drops the scratch contents.
pub struct AlignmentEngine {
    options: AlignmentOptions,
    preprocessor: ShapePreprocessor,
    evaluator: OverlapEvaluator,
    optimizer: LocalOptimizer,
    starts: StartPoseGenerator,
    reference_shapes: Vec<PreparedShape>,
    num_reference_sets: usize,
    aligned: PreparedShape,
    collector: ResultCollector,
    selected: Vec<AlignmentResult>,
    scorer: Box<dyn Scorer>,
}

impl Default for AlignmentEngine {
    fn default() -> Self {
        Self::new(AlignmentOptions::default())
    }
}

impl AlignmentEngine {
    pub fn new(options: AlignmentOptions) -> Self {
        let mut engine = Self {
            options: options.clone(),
            preprocessor: ShapePreprocessor::default(),
            evaluator: OverlapEvaluator::default(),
            optimizer: LocalOptimizer::default(),
            starts: StartPoseGenerator::new(StartPoseParams::default(), options.random_seed),
            reference_shapes: Vec::new(),
            num_reference_sets: 0,
            aligned: PreparedShape::empty(ShapeRole::Aligned),
            collector: ResultCollector::default(),
            selected: Vec::new(),
            scorer: Box::new(ScoringFunction::default()),
        };
        engine.set_options(options);
        engine
    }

    pub fn options(&self) -> &AlignmentOptions {
        &self.options
    }

    /// Replace the options; reference shapes are kept but re-prepared
    pub fn set_options(&mut self, options: AlignmentOptions) {
        self.preprocessor = ShapePreprocessor::new(options.symmetry_threshold);
        self.evaluator = OverlapEvaluator::new(OverlapParams {
            epsilon: options.overlap_epsilon,
        });
        self.optimizer = LocalOptimizer::with_params(LocalOptimizerParams {
            max_iterations: if options.perform_optimization {
                options.max_num_optimization_iterations
            } else {
                0
            },
            stop_gradient: options.optimization_stop_gradient,
            ..LocalOptimizerParams::default()
        });
        self.starts = StartPoseGenerator::new(
            StartPoseParams {
                mode: options.alignment_mode,
                num_random_starts: options.num_random_starts,
                max_random_translation: options.max_random_translation,
            },
            options.random_seed,
        );
        self.collector
            .set_keep_all(options.result_selection_mode == ResultSelectionMode::All);
        self.options = options;

        // Self-overlaps and symmetry depend on the options
        for reference in &mut self.reference_shapes {
            self.preprocessor.refresh(reference, &mut self.evaluator);
        }
        self.selected = self.collector.select(self.options.result_selection_mode);
    }

    /// Strategy filling [`AlignmentResult::score`]
    pub fn set_scoring_function(&mut self, scorer: Box<dyn Scorer>) {
        self.scorer = scorer;
    }

    /// Strategy deciding which of two results is better
    pub fn set_result_comparator(&mut self, comparator: Box<dyn Comparator>) {
        self.collector.set_comparator(comparator);
        self.selected = self.collector.select(self.options.result_selection_mode);
    }

    /// Change which results are reported
    ///
    /// Switching to [`ResultSelectionMode::All`] clears the collected results,
    /// since the optima dropped by deduplication cannot be recovered; align again
    /// to fill them.
    pub fn set_result_selection_mode(&mut self, mode: ResultSelectionMode) {
        self.options.result_selection_mode = mode;
        self.collector.set_keep_all(mode == ResultSelectionMode::All);
        self.selected = self.collector.select(mode);
    }

    /// Add a reference shape, either to the current set or as the first shape of a new set
    ///
    /// Returns the index of the new reference shape.
    pub fn add_reference_shape(&mut self, shape: &ShapeModel, new_set: bool) -> usize {
        if new_set || self.num_reference_sets == 0 {
            self.num_reference_sets += 1;
        }
        let index = self.reference_shapes.len();
        let prepared = self.preprocessor.prepare(
            shape,
            ShapeRole::Reference,
            self.num_reference_sets - 1,
            index,
            &mut self.evaluator,
        );
        self.reference_shapes.push(prepared);
        index
    }

    pub fn clear_reference_shapes(&mut self) {
        self.reference_shapes.clear();
        self.num_reference_sets = 0;
    }

    pub fn num_reference_shapes(&self) -> usize {
        self.reference_shapes.len()
    }

    pub fn num_reference_sets(&self) -> usize {
        self.num_reference_sets
    }

    pub fn reference_shape(&self, index: usize) -> Option<&PreparedShape> {
        self.reference_shapes.get(index)
    }

    /// Align one shape onto all reference shapes
    ///
    /// Returns whether any result was produced; a degenerate shape yields none.
    pub fn align(&mut self, shape: &ShapeModel) -> Result<bool, AlignmentError> {
        self.align_set(std::slice::from_ref(shape))
    }

    /// Align the shapes of a set (e.g. conformers); each keeps its position as aligned index
    pub fn align_set(&mut self, shapes: &[ShapeModel]) -> Result<bool, AlignmentError> {
        if self.reference_shapes.is_empty() {
            return Err(AlignmentError::NoReferenceShapes);
        }
        self.clear_results();
        self.starts.reseed(self.options.random_seed);

        for (index, shape) in shapes.iter().enumerate() {
            self.align_shape(shape, index);
        }

        self.selected = self.collector.select(self.options.result_selection_mode);
        Ok(!self.selected.is_empty())
    }

    /// Refine a single caller-given starting pose of `shape` on one reference shape
    ///
    /// The result is scored but not collected.
    pub fn optimize_pose(
        &mut self,
        reference_index: usize,
        shape: &ShapeModel,
        start: &Pose,
    ) -> Result<AlignmentResult, AlignmentError> {
        let count = self.reference_shapes.len();
        let reference = self
            .reference_shapes
            .get(reference_index)
            .ok_or(AlignmentError::ReferenceIndexOutOfRange {
                index: reference_index,
                count,
            })?;

        self.preprocessor
            .prepare_into(shape, 0, 0, &mut self.evaluator, &mut self.aligned);
        let mut pair = PairOptimizer {
            evaluator: &mut self.evaluator,
            optimizer: &mut self.optimizer,
            reference,
            aligned: &self.aligned,
            color_weight: self.options.color_weight,
        };
        let optimum = pair.optimize(start);
        let mut result = pair.result(&optimum);
        result.score = self.scorer.score(&result);
        Ok(result)
    }

    /// Results under the configured selection mode
    pub fn results(&self) -> &[AlignmentResult] {
        &self.selected
    }

    pub fn result(&self, index: usize) -> Option<&AlignmentResult> {
        self.selected.get(index)
    }

    pub fn num_results(&self) -> usize {
        self.selected.len()
    }

    /// Results of the last run filtered by another mode
    pub fn select(&self, mode: ResultSelectionMode) -> Vec<AlignmentResult> {
        self.collector.select(mode)
    }

    pub fn clear_results(&mut self) {
        self.collector.clear();
        self.selected.clear();
    }

    /// Drop results and scratch contents and restart the random stream
    pub fn reset(&mut self) {
        self.clear_results();
        self.evaluator.reset();
        self.aligned.reset();
        self.starts.reseed(self.options.random_seed);
    }

    fn align_shape(&mut self, shape: &ShapeModel, aligned_index: usize) {
        self.preprocessor
            .prepare_into(shape, 0, aligned_index, &mut self.evaluator, &mut self.aligned);
        if self.aligned.is_degenerate() {
            debug!("Aligned shape {} is degenerate, skipping", aligned_index);
            return;
        }

        for reference in &self.reference_shapes {
            let poses = self.starts.generate(reference, &self.aligned);
            if poses.is_empty() {
                debug!(
                    "No starting poses for reference {} / aligned {}",
                    reference.owner_index(),
                    aligned_index
                );
                continue;
            }

            let mut pair = PairOptimizer {
                evaluator: &mut self.evaluator,
                optimizer: &mut self.optimizer,
                reference,
                aligned: &self.aligned,
                color_weight: self.options.color_weight,
            };

            let greedy_bar = if self.options.greedy_optimization {
                poses
                    .iter()
                    .map(|p| pair.objective_value(p))
                    .fold(f64::INFINITY, f64::min)
            } else {
                f64::NEG_INFINITY
            };

            let mut best_overlap = f64::NEG_INFINITY;
            for start in poses {
                let optimum = pair.optimize(start);
                let mut result = pair.result(&optimum);
                result.score = self.scorer.score(&result);
                best_overlap = best_overlap.max(result.overlap);
                self.collector.add(result);

                if optimum.converged() && optimum.value < greedy_bar {
                    break;
                }
            }

            debug!(
                "Reference {} / aligned {}: {} starting poses, best overlap {:.4}",
                reference.owner_index(),
                aligned_index,
                poses.len(),
                best_overlap
            );
        }
    }
}

/// Borrowed working set for optimizing one (reference, aligned) pair
struct PairOptimizer<'a> {
    evaluator: &'a mut OverlapEvaluator,
    optimizer: &'a mut LocalOptimizer,
    reference: &'a PreparedShape,
    aligned: &'a PreparedShape,
    color_weight: f64,
}

impl PairOptimizer<'_> {
    fn use_color(&self) -> bool {
        self.color_weight > 0.0
            && !self.reference.color_elements().is_empty()
            && !self.aligned.color_elements().is_empty()
    }

    /// Negated weighted overlap at `pose`
    fn objective_value(&mut self, pose: &Pose) -> f64 {
        let use_color = self.use_color();
        let values = self
            .evaluator
            .evaluate(self.reference, self.aligned, pose, use_color, None);
        -(values.overlap + self.color_weight * values.color_overlap)
    }

    fn optimize(&mut self, start: &Pose) -> LocalOptimum {
        let use_color = self.use_color();
        let color_weight = self.color_weight;
        let (reference, aligned) = (self.reference, self.aligned);
        let evaluator = &mut *self.evaluator;

        let objective = |x: &PoseParams, grad: Option<&mut PoseParams>| -> f64 {
            let pose = Pose::from_params(x);
            let values = match grad {
                Some(g) => {
                    let mut pose_grad = OverlapGradient::default();
                    let values =
                        evaluator.evaluate(reference, aligned, &pose, use_color, Some(&mut pose_grad));
                    *g = -(pose_grad.overlap + pose_grad.color_overlap * color_weight);
                    values
                }
                None => evaluator.evaluate(reference, aligned, &pose, use_color, None),
            };
            -(values.overlap + color_weight * values.color_overlap)
        };

        self.optimizer.minimize(start.normalized().to_params(), objective)
    }

    fn result(&mut self, optimum: &LocalOptimum) -> AlignmentResult {
        let pose = Pose::from_params(&optimum.params).normalized();
        let values = self
            .evaluator
            .evaluate(self.reference, self.aligned, &pose, true, None);

        AlignmentResult {
            transform: pose.to_matrix(),
            score: 0.0,
            overlap: values.overlap,
            color_overlap: values.color_overlap,
            reference_self_overlap: self.reference.self_overlap(),
            reference_color_self_overlap: self.reference.color_self_overlap(),
            aligned_self_overlap: self.aligned.self_overlap(),
            aligned_color_self_overlap: self.aligned.color_self_overlap(),
            reference_shape_set_index: self.reference.owner_set_index(),
            reference_shape_index: self.reference.owner_index(),
            aligned_shape_index: self.aligned.owner_index(),
            optimizer_state: optimum.state,
            iterations: optimum.iterations,
        }
    }
}
