//! Candidate-parallel screening on the rayon thread pool

use log::{info, warn};
use rayon::prelude::*;
use std::sync::{Arc, Mutex};

use crate::alignment::AlignmentResult;
use crate::screening::{
    HitSink, ScreeningError, ScreeningProcessor, ScreeningSettings, ScreeningStats, ShapeGenerator,
};
use crate::shape::ShapeModel;

/// Hit sink shared by all workers; every hit is forwarded under the lock
pub struct SharedHitSink<H> {
    inner: Arc<Mutex<H>>,
}

impl<H> Clone for SharedHitSink<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H> SharedHitSink<H> {
    pub fn new(sink: H) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    /// Recover the wrapped sink once all workers are done
    pub fn into_inner(self) -> Option<H> {
        let mutex = Arc::try_unwrap(self.inner).ok()?;
        Some(mutex.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl<S, H: HitSink<S>> HitSink<S> for SharedHitSink<H> {
    fn on_hit(&mut self, query: &S, candidate: &S, result: &AlignmentResult) {
        let mut sink = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sink.on_hit(query, candidate, result);
    }
}

/// Screen `candidates` against `queries` on all rayon workers
///
/// Query shapes are generated once and shared; each worker owns its own
/// processor (engine, random stream and scratch). Hits go to `sink` in no
/// particular order. Candidates that fail are skipped and counted, as in
/// [`ScreeningProcessor::process`].
pub fn screen_parallel<S, G, H>(
    settings: &ScreeningSettings,
    generator: &G,
    queries: &[S],
    candidates: &[S],
    sink: SharedHitSink<H>,
) -> Result<ScreeningStats, ScreeningError>
where
    S: Clone + Send + Sync + 'static,
    G: ShapeGenerator<S> + Sync,
    H: HitSink<S> + Send + 'static,
{
    if queries.is_empty() {
        return Err(ScreeningError::NoQueryShapes);
    }

    let options = settings.shape_generation_options();
    let query_shapes = queries
        .iter()
        .map(|query| {
            generator
                .generate(query, &options)
                .map_err(ScreeningError::ShapeGeneration)
        })
        .collect::<Result<Vec<Vec<ShapeModel>>, _>>()?;

    let outcomes: Vec<Result<usize, ScreeningError>> = candidates
        .par_iter()
        .map_init(
            || {
                let mut processor = ScreeningProcessor::new(settings.clone(), generator);
                for (query, shapes) in queries.iter().zip(&query_shapes) {
                    let shapes = if settings.single_conformer_search {
                        &shapes[..shapes.len().min(1)]
                    } else {
                        &shapes[..]
                    };
                    processor.add_query_shapes(query.clone(), shapes);
                }
                processor.set_hit_callback(Box::new(sink.clone()));
                processor
            },
            |processor, candidate| processor.screen(candidate),
        )
        .collect();

    let mut stats = ScreeningStats::default();
    for (index, outcome) in outcomes.iter().enumerate() {
        if let Err(e) = outcome {
            warn!("Skipping candidate {}: {}", index, e);
        }
        stats.record(outcome);
    }

    info!(
        "Screened {} candidates in parallel: {} hits, {} skipped",
        stats.processed, stats.hits, stats.failed
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Collects hit scores
    struct Scores(Vec<f64>);

    impl HitSink<u32> for Scores {
        fn on_hit(&mut self, _query: &u32, _candidate: &u32, result: &AlignmentResult) {
            self.0.push(result.score);
        }
    }

    #[test]
    fn test_shared_sink_forwards_hits() {
        let mut shared = SharedHitSink::new(Scores(Vec::new()));
        let result = AlignmentResult {
            score: 0.7,
            ..AlignmentResult::default()
        };
        shared.on_hit(&1u32, &2u32, &result);
        shared.clone().on_hit(&1u32, &3u32, &result);

        let collected = shared.into_inner().unwrap();
        assert_eq!(collected.0, vec![0.7, 0.7]);
    }
}
