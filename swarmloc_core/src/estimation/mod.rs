// swarmloc_core/src/estimation/mod.rs

use crate::frames::SwarmFrame;
use crate::messages::{LocalizerInput, SwarmFrameState};
use std::any::Any;

/// The contract for any algorithm that estimates the poses of a whole swarm
/// in one shared frame.
pub trait SwarmEstimator: Send + Sync {
    /// The single, unified method for feeding frames and two-robot measurements.
    fn process(&mut self, input: &LocalizerInput);

    /// Runs one optimization step. Returns the normalized cost, or a negative
    /// value when there is not yet enough evidence to solve.
    ///
    /// # Panics
    ///
    /// Implementations may panic on a structural solver failure (a malformed
    /// problem, not a poor fit). Use the implementation's fallible entry point,
    /// such as [`SwarmLocalizer::try_solve`], to handle that case instead.
    ///
    /// [`SwarmLocalizer::try_solve`]: crate::estimation::localizer::SwarmLocalizer::try_solve
    fn solve(&mut self) -> f64;

    /// True once the estimate has passed the acceptance threshold.
    fn is_ready(&self) -> bool;

    /// Shared-frame poses for the robots of `frame`, from the last accepted solve.
    fn predict_swarm(&self, frame: &SwarmFrame) -> SwarmFrameState;

    /// Allows for dynamic downcasting to access algorithm-specific methods if needed.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub mod curator;
pub mod keyframe;
pub mod localizer;
pub mod observability;
pub mod sync;
pub mod window;
