// swarmloc_core/src/prelude.rs

// --- Core Abstractions (The main contracts of the library) ---
pub use crate::estimation::SwarmEstimator;
pub use crate::messages::{DroneDetection, LocalizerInput, LoopConnection};
pub use crate::types::{DroneId, Timestamp};

// --- Core Data Structures (The "nouns" of the library) ---
pub use crate::config::SolverConfig;
pub use crate::error::{LocalizationError, Pending, SolverError};
pub use crate::frames::aggregator::FrameAggregator;
pub use crate::frames::{NodeFrame, SwarmFrame};
pub use crate::messages::{PredictedPose, SwarmFrameState};
pub use crate::pose::Pose;

// --- Estimation Algorithms ---
pub use crate::estimation::localizer::{SharedLocalizer, SolveStats, SwarmLocalizer};
