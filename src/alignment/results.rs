//! Collection and selection of alignment results

use log::warn;
use serde::{Deserialize, Serialize};

use crate::alignment::AlignmentResult;

/// Which results an alignment run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResultSelectionMode {
    /// Every retained local optimum
    All,
    /// Best result per (reference set, reference shape, aligned shape)
    #[default]
    BestPerShapeCombination,
    /// Best result per (reference set, reference shape) over all aligned shapes
    BestPerReferenceShape,
    /// Best result per reference set
    BestPerReferenceSet,
    /// Single best result
    BestOverall,
}

impl ResultSelectionMode {
    pub fn name(&self) -> &'static str {
        match self {
            ResultSelectionMode::All => "all",
            ResultSelectionMode::BestPerShapeCombination => "best_per_shape_combination",
            ResultSelectionMode::BestPerReferenceShape => "best_per_reference_shape",
            ResultSelectionMode::BestPerReferenceSet => "best_per_reference_set",
            ResultSelectionMode::BestOverall => "best_overall",
        }
    }

    /// Parse a mode name; unknown names fall back to the default mode
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "all" => ResultSelectionMode::All,
            "best_per_shape_combination" => ResultSelectionMode::BestPerShapeCombination,
            "best_per_reference_shape" => ResultSelectionMode::BestPerReferenceShape,
            "best_per_reference_set" => ResultSelectionMode::BestPerReferenceSet,
            "best_overall" => ResultSelectionMode::BestOverall,
            _ => {
                let fallback = ResultSelectionMode::default();
                warn!(
                    "Unknown result selection mode: {}. Using {} instead.",
                    name,
                    fallback.name()
                );
                fallback
            }
        }
    }

    /// Grouping key of a result under this mode; `None` means no grouping
    fn group_key(&self, result: &AlignmentResult) -> Option<(usize, usize, usize)> {
        match self {
            ResultSelectionMode::All => None,
            ResultSelectionMode::BestPerShapeCombination => Some(result.key()),
            ResultSelectionMode::BestPerReferenceShape => Some((
                result.reference_shape_set_index,
                result.reference_shape_index,
                0,
            )),
            ResultSelectionMode::BestPerReferenceSet => {
                Some((result.reference_shape_set_index, 0, 0))
            }
            ResultSelectionMode::BestOverall => Some((0, 0, 0)),
        }
    }
}

impl From<String> for ResultSelectionMode {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<ResultSelectionMode> for String {
    fn from(mode: ResultSelectionMode) -> Self {
        mode.name().to_string()
    }
}

/// Decides which of two results is preferable
pub trait Comparator: Send + Sync {
    /// Whether `candidate` should replace `incumbent`
    fn is_better(&self, candidate: &AlignmentResult, incumbent: &AlignmentResult) -> bool;
}

impl<F> Comparator for F
where
    F: Fn(&AlignmentResult, &AlignmentResult) -> bool + Send + Sync,
{
    fn is_better(&self, candidate: &AlignmentResult, incumbent: &AlignmentResult) -> bool {
        self(candidate, incumbent)
    }
}

/// Default ordering: higher score wins
#[derive(Debug, Clone, Copy, Default)]
pub struct HigherScore;

impl Comparator for HigherScore {
    fn is_better(&self, candidate: &AlignmentResult, incumbent: &AlignmentResult) -> bool {
        candidate.score > incumbent.score
    }
}

/// Reduce `results` to one best entry per group of `mode`, keeping first-seen group order
pub fn select_results(
    results: &[AlignmentResult],
    mode: ResultSelectionMode,
    comparator: &dyn Comparator,
) -> Vec<AlignmentResult> {
    let mut selected: Vec<AlignmentResult> = Vec::new();
    let mut keys: Vec<(usize, usize, usize)> = Vec::new();

    for result in results {
        let Some(key) = mode.group_key(result) else {
            selected.push(result.clone());
            continue;
        };
        match keys.iter().position(|k| *k == key) {
            Some(idx) => {
                if comparator.is_better(result, &selected[idx]) {
                    selected[idx] = result.clone();
                }
            }
            None => {
                keys.push(key);
                selected.push(result.clone());
            }
        }
    }

    selected
}

/// Accumulates results of alignment runs
///
/// Unless every local optimum is kept, a result whose
/// (reference set, reference shape, aligned shape) key is already present only
/// replaces the stored one when the comparator prefers it.
pub struct ResultCollector {
    results: Vec<AlignmentResult>,
    keep_all: bool,
    comparator: Box<dyn Comparator>,
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new(false)
    }
}

impl std::fmt::Debug for ResultCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCollector")
            .field("results", &self.results)
            .field("keep_all", &self.keep_all)
            .finish_non_exhaustive()
    }
}

impl ResultCollector {
    /// Create a collector; `keep_all` retains every added result
    pub fn new(keep_all: bool) -> Self {
        Self {
            results: Vec::new(),
            keep_all,
            comparator: Box::new(HigherScore),
        }
    }

    /// Switch between keeping every result and keeping the best per key
    ///
    /// Turning `keep_all` on drops the stored results: optima discarded while
    /// deduplicating cannot be brought back, so a partial list is not reported
    /// as complete.
    pub fn set_keep_all(&mut self, keep_all: bool) {
        if keep_all && !self.keep_all {
            self.results.clear();
        }
        self.keep_all = keep_all;
    }

    pub fn set_comparator(&mut self, comparator: Box<dyn Comparator>) {
        self.comparator = comparator;
    }

    pub fn comparator(&self) -> &dyn Comparator {
        self.comparator.as_ref()
    }

    /// Add a result; returns whether it was stored
    pub fn add(&mut self, result: AlignmentResult) -> bool {
        if self.keep_all {
            self.results.push(result);
            return true;
        }

        let key = result.key();
        match self.results.iter().position(|r| r.key() == key) {
            Some(idx) => {
                if self.comparator.is_better(&result, &self.results[idx]) {
                    self.results[idx] = result;
                    true
                } else {
                    false
                }
            }
            None => {
                self.results.push(result);
                true
            }
        }
    }

    /// Results filtered by `mode`
    pub fn select(&self, mode: ResultSelectionMode) -> Vec<AlignmentResult> {
        select_results(&self.results, mode, self.comparator.as_ref())
    }

    /// Everything stored, unfiltered
    pub fn results(&self) -> &[AlignmentResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn clear(&mut self) {
        self.results.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(set: usize, reference: usize, aligned: usize, score: f64) -> AlignmentResult {
        AlignmentResult {
            score,
            reference_shape_set_index: set,
            reference_shape_index: reference,
            aligned_shape_index: aligned,
            ..AlignmentResult::default()
        }
    }

    fn sample() -> Vec<AlignmentResult> {
        vec![
            result(0, 0, 0, 0.5),
            result(0, 0, 1, 0.9),
            result(0, 1, 0, 0.7),
            result(1, 2, 0, 0.4),
            result(1, 2, 1, 0.6),
        ]
    }

    fn scores(results: &[AlignmentResult]) -> Vec<f64> {
        results.iter().map(|r| r.score).collect()
    }

    #[test]
    fn test_add_replaces_only_better() {
        let mut collector = ResultCollector::default();
        assert!(collector.add(result(0, 0, 0, 0.5)));
        assert!(!collector.add(result(0, 0, 0, 0.3)));
        assert!(collector.add(result(0, 0, 0, 0.8)));
        assert_eq!(scores(collector.results()), vec![0.8]);
    }

    #[test]
    fn test_keep_all_retains_duplicates() {
        let mut collector = ResultCollector::new(true);
        collector.add(result(0, 0, 0, 0.5));
        collector.add(result(0, 0, 0, 0.3));
        assert_eq!(collector.len(), 2);
    }

    #[test]
    fn test_enabling_keep_all_drops_deduplicated_results() {
        let mut collector = ResultCollector::default();
        collector.add(result(0, 0, 0, 0.5));
        collector.add(result(0, 0, 0, 0.3));
        collector.set_keep_all(false);
        assert_eq!(collector.len(), 1);

        collector.set_keep_all(true);
        assert!(collector.is_empty());

        collector.add(result(0, 0, 0, 0.5));
        collector.add(result(0, 0, 0, 0.3));
        collector.set_keep_all(false);
        assert_eq!(collector.len(), 2);
    }

    #[test]
    fn test_selection_modes() {
        let all = sample();
        let hs = HigherScore;
        assert_eq!(select_results(&all, ResultSelectionMode::All, &hs).len(), 5);
        assert_eq!(
            scores(&select_results(&all, ResultSelectionMode::BestPerReferenceShape, &hs)),
            vec![0.9, 0.7, 0.6]
        );
        assert_eq!(
            scores(&select_results(&all, ResultSelectionMode::BestPerReferenceSet, &hs)),
            vec![0.9, 0.6]
        );
        assert_eq!(
            scores(&select_results(&all, ResultSelectionMode::BestOverall, &hs)),
            vec![0.9]
        );
    }

    #[test]
    fn test_custom_comparator() {
        let lowest = |a: &AlignmentResult, b: &AlignmentResult| a.score < b.score;
        let best = select_results(&sample(), ResultSelectionMode::BestOverall, &lowest);
        assert_eq!(scores(&best), vec![0.4]);
    }

    #[test]
    fn test_unknown_mode_name_falls_back() {
        assert_eq!(
            ResultSelectionMode::from_name("best_of_everything"),
            ResultSelectionMode::BestPerShapeCombination
        );
        let parsed: ResultSelectionMode = serde_json::from_str("\"best_overall\"").unwrap();
        assert_eq!(parsed, ResultSelectionMode::BestOverall);
    }
}
