// swarmloc_sim/src/prelude.rs

// Re-export the entire swarmloc_core prelude so you can easily access
// pure types like `SwarmFrame`, `Pose`, `SwarmLocalizer`, etc.
pub use swarmloc_core::prelude::*;

// Re-export common simulation-specific types for easy access.
pub use crate::cli::Cli;
pub use crate::config::{DroneConfig, MotionConfig, NoiseConfig, PoseConfig, ScenarioConfig, Simulation};
pub use crate::error::SimError;
pub use crate::report::{DroneReport, RunReport};
pub use crate::scenario::ScenarioRunner;
