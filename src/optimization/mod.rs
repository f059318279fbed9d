//! Pose search: starting pose enumeration and local overlap maximization

pub mod local;
pub mod starts;

use serde::{Deserialize, Serialize};

pub use local::{LocalOptimizer, LocalOptimizerParams, LocalOptimum};
pub use starts::{AlignmentMode, StartPoseGenerator, StartPoseParams};

/// Lifecycle of a local optimization run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizerState {
    /// Set up with a starting point, no step taken yet
    Ready,
    /// Taking quasi-Newton steps
    Iterating,
    /// Gradient norm fell below the stop threshold
    Converged,
    /// Stopped before the gradient rule was met, either at the iteration cap or
    /// because no descent step could be found; the last point is still usable
    MaxIterationsReached,
}

impl OptimizerState {
    /// Whether the run has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OptimizerState::Converged | OptimizerState::MaxIterationsReached
        )
    }
}
