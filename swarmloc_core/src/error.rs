// swarmloc_core/src/error.rs

use thiserror::Error;

/// Why a solve step could not run yet. All of these are recoverable: the
/// caller should keep feeding frames and measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// `self_id` was never configured.
    NoSelfId,
    /// The sliding window holds fewer than `min_frame_number` keyframes.
    TooFewKeyframes { have: usize, need: usize },
    /// Neither self-motion nor loop connectivity pins down the swarm yet.
    NotObservable,
}

impl std::fmt::Display for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pending::NoSelfId => write!(f, "self id is not set"),
            Pending::TooFewKeyframes { have, need } => {
                write!(f, "sliding window has {} of {} keyframes", have, need)
            }
            Pending::NotObservable => {
                write!(f, "bounding box too small and loop graph disconnected")
            }
        }
    }
}

/// Structural failures of the least-squares solver. These indicate a malformed
/// problem, not bad data.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("residual block {block} produced a non-finite value at the initial point")]
    NonFiniteResidual { block: usize },

    #[error("residual block {block} references parameter index {index}, but the problem has {count} blocks")]
    DimensionMismatch {
        block: usize,
        index: usize,
        count: usize,
    },

    #[error("no parameter block for drone {id} at keyframe {ts}")]
    MissingParameterBlock { ts: i64, id: u32 },

    #[error("the damped normal equations could not be solved (dimension {dim})")]
    LinearSolveFailed { dim: usize },

    #[error("failed to build solver thread pool: {0}")]
    ThreadPool(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("min_frame_number ({min}) must not exceed max_frame_number ({max})")]
    FrameBounds { min: usize, max: usize },

    #[error("max_frame_number must be at least 2, got {0}")]
    WindowTooSmall(usize),

    #[error("`{name}` must be strictly positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
}

/// The top-level error type of the localization engine.
#[derive(Debug, Error)]
pub enum LocalizationError {
    #[error("insufficient evidence to solve: {0}")]
    InsufficientEvidence(Pending),

    #[error("solver failure: {0}")]
    Solver(#[from] SolverError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to write pose graph diagnostics: {0}")]
    Io(#[from] std::io::Error),
}
