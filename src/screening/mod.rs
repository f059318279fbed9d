//! Batch screening of candidate structures against a query set
//!
//! Structures are opaque to this module: an external [`ShapeGenerator`] turns
//! them into shape models, and hits are reported back together with the
//! originating structures through a [`HitSink`].

pub mod parallel;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::alignment::{
    AlignmentEngine, AlignmentError, AlignmentOptions, AlignmentResult, ResultSelectionMode,
};
use crate::optimization::AlignmentMode;
use crate::scoring::{Scorer, ScoringFunction};
use crate::shape::ShapeModel;
use crate::BoxError;

pub use parallel::{screen_parallel, SharedHitSink};

/// Errors that can occur during screening
#[derive(Error, Debug)]
pub enum ScreeningError {
    #[error("No query shapes have been added")]
    NoQueryShapes,

    #[error("Shape generation failed: {0}")]
    ShapeGeneration(BoxError),

    #[error("Alignment error: {0}")]
    Alignment(#[from] AlignmentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pharmacophore features added to generated shapes as color elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColorFeatureType {
    #[default]
    NoFeatures,
    PharmacophoreExplicitCharges,
    PharmacophoreImplicitCharges,
}

impl ColorFeatureType {
    pub fn name(&self) -> &'static str {
        match self {
            ColorFeatureType::NoFeatures => "none",
            ColorFeatureType::PharmacophoreExplicitCharges => "pharmacophore_explicit_charges",
            ColorFeatureType::PharmacophoreImplicitCharges => "pharmacophore_implicit_charges",
        }
    }

    /// Parse a feature type name; unknown names fall back to no features
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "none" | "no_features" => ColorFeatureType::NoFeatures,
            "pharmacophore_explicit_charges" => ColorFeatureType::PharmacophoreExplicitCharges,
            "pharmacophore_implicit_charges" => ColorFeatureType::PharmacophoreImplicitCharges,
            _ => {
                warn!("Unknown color feature type: {}. Using none instead.", name);
                ColorFeatureType::default()
            }
        }
    }
}

impl From<String> for ColorFeatureType {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<ColorFeatureType> for String {
    fn from(kind: ColorFeatureType) -> Self {
        kind.name().to_string()
    }
}

/// Which of a candidate's results are reported as hits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScreeningMode {
    /// At most one hit per candidate
    #[default]
    BestOverallMatch,
    /// At most one hit per query
    BestMatchPerQuery,
    /// At most one hit per query conformer
    BestMatchPerQueryConf,
}

impl ScreeningMode {
    pub fn name(&self) -> &'static str {
        match self {
            ScreeningMode::BestOverallMatch => "best_overall_match",
            ScreeningMode::BestMatchPerQuery => "best_match_per_query",
            ScreeningMode::BestMatchPerQueryConf => "best_match_per_query_conf",
        }
    }

    /// Parse a screening mode name; unknown names fall back to best overall match
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "best_overall_match" => ScreeningMode::BestOverallMatch,
            "best_match_per_query" => ScreeningMode::BestMatchPerQuery,
            "best_match_per_query_conf" => ScreeningMode::BestMatchPerQueryConf,
            _ => {
                let fallback = ScreeningMode::default();
                warn!(
                    "Unknown screening mode: {}. Using {} instead.",
                    name,
                    fallback.name()
                );
                fallback
            }
        }
    }

    /// Result selection giving one result per reported hit
    pub fn selection_mode(&self) -> ResultSelectionMode {
        match self {
            ScreeningMode::BestOverallMatch => ResultSelectionMode::BestOverall,
            ScreeningMode::BestMatchPerQuery => ResultSelectionMode::BestPerReferenceSet,
            ScreeningMode::BestMatchPerQueryConf => ResultSelectionMode::BestPerReferenceShape,
        }
    }
}

impl From<String> for ScreeningMode {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<ScreeningMode> for String {
    fn from(mode: ScreeningMode) -> Self {
        mode.name().to_string()
    }
}

/// Screening configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningSettings {
    pub color_features: ColorFeatureType,
    pub screening_mode: ScreeningMode,
    pub alignment_mode: AlignmentMode,
    /// Minimum score of a hit; `None` reports every selected result
    pub score_cutoff: Option<f64>,
    pub scoring_function: ScoringFunction,
    /// Only use the first shape the generator produces for a structure
    pub single_conformer_search: bool,
    pub max_num_optimization_iterations: usize,
    pub optimization_stop_gradient: f64,
    pub greedy_optimization: bool,
    pub num_random_starts: usize,
    pub max_random_translation: f64,
    pub random_seed: u64,
}

impl Default for ScreeningSettings {
    fn default() -> Self {
        let alignment = AlignmentOptions::default();
        Self {
            color_features: ColorFeatureType::default(),
            screening_mode: ScreeningMode::default(),
            alignment_mode: alignment.alignment_mode,
            score_cutoff: None,
            scoring_function: ScoringFunction::default(),
            single_conformer_search: false,
            max_num_optimization_iterations: alignment.max_num_optimization_iterations,
            optimization_stop_gradient: alignment.optimization_stop_gradient,
            greedy_optimization: alignment.greedy_optimization,
            num_random_starts: alignment.num_random_starts,
            max_random_translation: alignment.max_random_translation,
            random_seed: alignment.random_seed,
        }
    }
}

impl ScreeningSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ScreeningError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ScreeningError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Engine options implied by these settings
    pub fn alignment_options(&self) -> AlignmentOptions {
        AlignmentOptions {
            alignment_mode: self.alignment_mode,
            max_num_optimization_iterations: self.max_num_optimization_iterations,
            optimization_stop_gradient: self.optimization_stop_gradient,
            greedy_optimization: self.greedy_optimization,
            num_random_starts: self.num_random_starts,
            max_random_translation: self.max_random_translation,
            random_seed: self.random_seed,
            result_selection_mode: self.screening_mode.selection_mode(),
            ..AlignmentOptions::default()
        }
    }

    /// Options handed to the shape generator
    pub fn shape_generation_options(&self) -> ShapeGenerationOptions {
        ShapeGenerationOptions {
            color_features: self.color_features,
            single_conformer: self.single_conformer_search,
        }
    }

    fn passes_cutoff(&self, score: f64) -> bool {
        self.score_cutoff.map_or(true, |cutoff| score >= cutoff)
    }
}

/// What a shape generator is asked to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShapeGenerationOptions {
    pub color_features: ColorFeatureType,
    /// Produce a single shape even for multi-conformer structures
    pub single_conformer: bool,
}

/// Converts a structure into one shape per conformer
pub trait ShapeGenerator<S: ?Sized> {
    fn generate(
        &self,
        structure: &S,
        options: &ShapeGenerationOptions,
    ) -> Result<Vec<ShapeModel>, BoxError>;
}

impl<S: ?Sized, G: ShapeGenerator<S> + ?Sized> ShapeGenerator<S> for &G {
    fn generate(
        &self,
        structure: &S,
        options: &ShapeGenerationOptions,
    ) -> Result<Vec<ShapeModel>, BoxError> {
        (**self).generate(structure, options)
    }
}

/// Receives reported hits
pub trait HitSink<S> {
    fn on_hit(&mut self, query: &S, candidate: &S, result: &AlignmentResult);
}

impl<S, F> HitSink<S> for F
where
    F: FnMut(&S, &S, &AlignmentResult),
{
    fn on_hit(&mut self, query: &S, candidate: &S, result: &AlignmentResult) {
        self(query, candidate, result)
    }
}

/// Counters of a screening run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScreeningStats {
    /// Candidates handed to `process`
    pub processed: usize,
    /// Hit callbacks invoked
    pub hits: usize,
    /// Candidates skipped because they could not be processed
    pub failed: usize,
}

impl ScreeningStats {
    /// Account for the outcome of one candidate
    pub fn record<T>(&mut self, outcome: &Result<usize, T>) {
        self.processed += 1;
        match outcome {
            Ok(hits) => self.hits += hits,
            Err(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &ScreeningStats) {
        self.processed += other.processed;
        self.hits += other.hits;
        self.failed += other.failed;
    }
}

/// Screens candidate structures against the added queries
///
/// Every query with at least one shape becomes one reference set of the owned
/// [`AlignmentEngine`]; `set_queries` maps a result's reference set index back
/// to its query.
pub struct ScreeningProcessor<S, G> {
    settings: ScreeningSettings,
    generator: G,
    engine: AlignmentEngine,
    queries: Vec<S>,
    set_queries: Vec<usize>,
    hit_sink: Option<Box<dyn HitSink<S>>>,
    stats: ScreeningStats,
}

impl<S, G: ShapeGenerator<S>> ScreeningProcessor<S, G> {
    pub fn new(settings: ScreeningSettings, generator: G) -> Self {
        let mut engine = AlignmentEngine::new(settings.alignment_options());
        engine.set_scoring_function(Box::new(settings.scoring_function));
        Self {
            settings,
            generator,
            engine,
            queries: Vec::new(),
            set_queries: Vec::new(),
            hit_sink: None,
            stats: ScreeningStats::default(),
        }
    }

    pub fn settings(&self) -> &ScreeningSettings {
        &self.settings
    }

    /// Generate the shapes of `query` and add them as a new reference set
    pub fn add_query(&mut self, query: S) -> Result<usize, ScreeningError> {
        let shapes = self.generate_shapes(&query)?;
        Ok(self.add_query_shapes(query, &shapes))
    }

    /// Add a query whose shapes were generated elsewhere; returns the query index
    ///
    /// A query without shapes is kept but opens no reference set, so it can
    /// never be reported as a hit.
    pub fn add_query_shapes(&mut self, query: S, shapes: &[ShapeModel]) -> usize {
        let index = self.queries.len();
        self.queries.push(query);
        if shapes.is_empty() {
            warn!("Query {} has no shapes and will never match", index);
            return index;
        }

        for (conformer, shape) in shapes.iter().enumerate() {
            self.engine.add_reference_shape(shape, conformer == 0);
        }
        self.set_queries.push(index);
        debug!("Added query {} with {} shapes", index, shapes.len());
        index
    }

    pub fn num_queries(&self) -> usize {
        self.queries.len()
    }

    pub fn set_hit_callback(&mut self, sink: Box<dyn HitSink<S>>) {
        self.hit_sink = Some(sink);
    }

    /// Override the scorer named in the settings
    pub fn set_scoring_function(&mut self, scorer: Box<dyn Scorer>) {
        self.engine.set_scoring_function(scorer);
    }

    pub fn engine(&self) -> &AlignmentEngine {
        &self.engine
    }

    pub fn stats(&self) -> ScreeningStats {
        self.stats
    }

    /// Screen one candidate; returns whether a hit was reported
    ///
    /// A candidate that cannot be processed is logged and skipped.
    pub fn process(&mut self, candidate: &S) -> bool {
        let outcome = self.screen(candidate);
        self.stats.record(&outcome);
        match outcome {
            Ok(hits) => hits > 0,
            Err(e) => {
                warn!("Skipping candidate {}: {}", self.stats.processed - 1, e);
                false
            }
        }
    }

    /// Screen a sequence of candidates
    pub fn process_all<'c, I>(&mut self, candidates: I) -> ScreeningStats
    where
        I: IntoIterator<Item = &'c S>,
        S: 'c,
    {
        let before = self.stats;
        for candidate in candidates {
            self.process(candidate);
        }
        let run = ScreeningStats {
            processed: self.stats.processed - before.processed,
            hits: self.stats.hits - before.hits,
            failed: self.stats.failed - before.failed,
        };
        info!(
            "Screened {} candidates: {} hits, {} skipped",
            run.processed, run.hits, run.failed
        );
        run
    }

    /// Screen one candidate and report its hits; returns the number of hits
    pub fn screen(&mut self, candidate: &S) -> Result<usize, ScreeningError> {
        if self.set_queries.is_empty() {
            return Err(ScreeningError::NoQueryShapes);
        }

        let shapes = self.generate_shapes(candidate)?;
        if !self.engine.align_set(&shapes)? {
            return Ok(0);
        }

        let mut hits = 0;
        for result in self.engine.results() {
            if !self.settings.passes_cutoff(result.score) {
                continue;
            }
            let Some(query) = self
                .set_queries
                .get(result.reference_shape_set_index)
                .and_then(|&index| self.queries.get(index))
            else {
                continue;
            };
            if let Some(sink) = self.hit_sink.as_mut() {
                sink.on_hit(query, candidate, result);
            }
            hits += 1;
        }
        Ok(hits)
    }

    fn generate_shapes(&self, structure: &S) -> Result<Vec<ShapeModel>, ScreeningError> {
        let options = self.settings.shape_generation_options();
        let mut shapes = self
            .generator
            .generate(structure, &options)
            .map_err(ScreeningError::ShapeGeneration)?;
        if options.single_conformer {
            shapes.truncate(1);
        }
        Ok(shapes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ShapeElement;
    use nalgebra::Vector3;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Structures are lists of sphere centers; an empty list cannot be converted
    struct Spheres;

    impl ShapeGenerator<Vec<[f64; 3]>> for Spheres {
        fn generate(
            &self,
            structure: &Vec<[f64; 3]>,
            _options: &ShapeGenerationOptions,
        ) -> Result<Vec<ShapeModel>, BoxError> {
            if structure.is_empty() {
                return Err("structure has no atoms".into());
            }
            let shape = structure
                .iter()
                .map(|p| ShapeElement::new(Vector3::new(p[0], p[1], p[2]), 1.7, 2.7))
                .collect::<Result<ShapeModel, _>>()?;
            Ok(vec![shape])
        }
    }

    fn pair() -> Vec<[f64; 3]> {
        vec![[0.0, 0.0, 0.0], [1.5, 0.0, 0.0]]
    }

    #[test]
    fn test_mode_mapping() {
        assert_eq!(
            ScreeningMode::BestMatchPerQuery.selection_mode(),
            ResultSelectionMode::BestPerReferenceSet
        );
        assert_eq!(
            ScreeningMode::from_name("best_hit_ever"),
            ScreeningMode::BestOverallMatch
        );
        assert_eq!(
            ColorFeatureType::from_name("pharmacophore_implicit_charges"),
            ColorFeatureType::PharmacophoreImplicitCharges
        );
    }

    #[test]
    fn test_settings_defaults_from_partial_json() {
        let settings =
            ScreeningSettings::from_json_str(r#"{"score_cutoff": 0.5, "alignment_mode": 9}"#)
                .unwrap();
        assert_eq!(settings.score_cutoff, Some(0.5));
        assert!(settings.alignment_mode.contains(AlignmentMode::RANDOM));
        assert_eq!(settings.max_num_optimization_iterations, 20);
        assert_eq!(settings.scoring_function, ScoringFunction::TanimotoCombo);
    }

    #[test]
    fn test_process_without_queries_is_skipped() {
        let mut processor = ScreeningProcessor::new(ScreeningSettings::default(), Spheres);
        assert!(!processor.process(&pair()));
        assert_eq!(processor.stats().failed, 1);
    }

    #[test]
    fn test_query_without_shapes_is_never_reported() {
        let reported = Rc::new(RefCell::new(Vec::new()));
        let sink_reported = Rc::clone(&reported);

        let mut processor = ScreeningProcessor::new(ScreeningSettings::default(), Spheres);
        let shapeless = vec![[9.0, 9.0, 9.0]];
        assert_eq!(processor.add_query_shapes(shapeless, &[]), 0);
        assert!(matches!(
            processor.screen(&pair()),
            Err(ScreeningError::NoQueryShapes)
        ));

        assert_eq!(processor.add_query(pair()).unwrap(), 1);
        assert_eq!(processor.num_queries(), 2);
        assert_eq!(processor.engine().num_reference_sets(), 1);
        processor.set_hit_callback(Box::new(
            move |q: &Vec<[f64; 3]>, _c: &Vec<[f64; 3]>, _r: &AlignmentResult| {
                sink_reported.borrow_mut().push(q.clone())
            },
        ));

        assert!(processor.process(&pair()));
        assert_eq!(*reported.borrow(), vec![pair()]);
    }

    #[test]
    fn test_hits_and_cutoff() {
        let hits = Rc::new(RefCell::new(Vec::new()));
        let sink_hits = Rc::clone(&hits);

        let settings = ScreeningSettings {
            score_cutoff: Some(0.9),
            ..ScreeningSettings::default()
        };
        let mut processor = ScreeningProcessor::new(settings, Spheres);
        processor.add_query(pair()).unwrap();
        processor.set_hit_callback(Box::new(
            move |_q: &Vec<[f64; 3]>, _c: &Vec<[f64; 3]>, r: &AlignmentResult| {
                sink_hits.borrow_mut().push(r.score)
            },
        ));

        assert!(processor.process(&pair()));
        // A single sphere cannot reach the cutoff against the pair
        assert!(!processor.process(&vec![[5.0, 5.0, 5.0]]));
        assert!(!processor.process(&Vec::new()));

        assert_eq!(hits.borrow().len(), 1);
        assert_eq!(
            processor.stats(),
            ScreeningStats {
                processed: 3,
                hits: 1,
                failed: 1
            }
        );
    }
}
