// swarmloc_sim/src/config.rs

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::path::Path;
use swarmloc_core::config::SolverConfig;
use swarmloc_core::pose::Pose;
use swarmloc_core::types::DroneId;

use crate::error::SimError;
use crate::serde_helpers;

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

/// # ScenarioConfig
/// The root of the data parsed from a `scenario.toml` file.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)] // Fail if the TOML has fields not in our struct
pub struct ScenarioConfig {
    #[serde(default)] // Use default if the [simulation] section is missing
    pub simulation: Simulation,

    #[serde(default)]
    pub solver: SolverConfig,

    #[serde(default)]
    pub noise: NoiseConfig,

    // The TOML has `[[drones]]`, which becomes a Vec of DroneConfig structs.
    #[serde(default)]
    pub drones: Vec<DroneConfig>,
}

impl ScenarioConfig {
    /// Loads a scenario file. `SWARMLOC_`-prefixed environment variables
    /// override file values, with `__` separating nested keys
    /// (e.g. `SWARMLOC_SIMULATION__SEED=3`).
    pub fn load(path: &Path) -> Result<Self, SimError> {
        tracing::info!("Loading scenario from: {}", path.display());
        let config: ScenarioConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SWARMLOC_").split("__"))
            .extract()?;
        config.check()?;
        Ok(config)
    }

    /// Parses a scenario from TOML text, without environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, SimError> {
        let config: ScenarioConfig = Figment::new().merge(Toml::string(text)).extract()?;
        config.check()?;
        Ok(config)
    }

    /// Cross-section consistency checks that serde cannot express.
    pub fn check(&self) -> Result<(), SimError> {
        let Some(self_id) = self.solver.self_id else {
            return Err(SimError::Scenario("solver.self_id is not set".into()));
        };
        if !self.drones.iter().any(|d| d.id == self_id) {
            return Err(SimError::Scenario(format!("self drone {} is not in [[drones]]", self_id)));
        }
        for (i, d) in self.drones.iter().enumerate() {
            if self.drones[..i].iter().any(|o| o.id == d.id) {
                return Err(SimError::Scenario(format!("drone id {} is declared twice", d.id)));
            }
        }
        if !(self.simulation.frame_rate > 0.0) {
            return Err(SimError::Scenario("simulation.frame_rate must be positive".into()));
        }
        if self.simulation.solve_every == 0 {
            return Err(SimError::Scenario("simulation.solve_every must be at least 1".into()));
        }
        self.solver.validate().map_err(swarmloc_core::error::LocalizationError::from)?;
        Ok(())
    }

    /// Applies a CLI seed to both the scenario generator and the restart search.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.simulation.seed = Some(seed);
        self.solver.seed = Some(seed);
        self
    }
}

// =========================================================================
// == Configuration Sub-Structs ==
// =========================================================================

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Simulation {
    /// Optional seed for the pseudo-random number generator for determinism.
    pub seed: Option<u64>,
    pub duration_seconds: f64,
    /// Swarm frames per second.
    pub frame_rate: f64,
    /// Call `solve` every this many frames.
    pub solve_every: usize,
    /// Expected loop closures per second for each pair of drones in range.
    pub loop_rate: f64,
    /// Expected detections per second for each ordered pair of drones in range.
    pub detection_rate: f64,
    /// Loops and detections only happen between drones closer than this (m).
    pub loop_max_distance: f64,
    /// Ranges are only measured between drones closer than this (m).
    pub range_max_distance: f64,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            seed: None,
            duration_seconds: 30.0,
            frame_rate: 10.0,
            solve_every: 5,
            loop_rate: 0.2,
            detection_rate: 0.0,
            loop_max_distance: 6.0,
            range_max_distance: 30.0,
        }
    }
}

/// Standard deviations of the synthetic sensors.
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct NoiseConfig {
    /// Odometry position random walk per meter travelled.
    pub odom_drift_per_meter: f64,
    /// Odometry yaw random walk (rad) per meter travelled.
    pub odom_yaw_drift_per_meter: f64,
    pub range: f64,
    pub loop_position: f64,
    pub loop_yaw: f64,
    /// Bearing noise, added per axis before normalization.
    pub bearing: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            odom_drift_per_meter: 0.01,
            odom_yaw_drift_per_meter: 0.002,
            range: 0.05,
            loop_position: 0.05,
            loop_yaw: 0.01,
            bearing: 0.01,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DroneConfig {
    pub id: DroneId,
    /// World pose at t = 0.
    pub start: PoseConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    /// Where the drone's odometry frame sits in the world.
    #[serde(default)]
    pub odom_origin: PoseConfig,
}

impl DroneConfig {
    pub fn is_static(&self) -> bool {
        matches!(self.motion, MotionConfig::Static)
    }

    /// Ground-truth world pose at time `t` (s).
    pub fn ground_truth(&self, t: f64) -> Pose {
        let start = self.start.to_pose();
        match self.motion {
            MotionConfig::Static => start,
            MotionConfig::Circle {
                radius,
                angular_rate,
                vertical_amplitude,
            } => {
                let a = angular_rate * t;
                // The circle passes through the start pose, tangent to its heading.
                let local = Vector3::new(radius * a.sin(), radius * (1.0 - a.cos()), vertical_amplitude * (2.0 * a).sin());
                let along = Pose::from_xyz_yaw(local, a);
                start * along
            }
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default)]
#[serde(deny_unknown_fields)]
pub struct PoseConfig {
    #[serde(with = "serde_helpers::vec3_f64_from_array", default = "Vector3::zeros")]
    pub position: Vector3<f64>,
    #[serde(with = "serde_helpers::yaw_rad_from_deg", default, rename = "yaw_deg")]
    pub yaw: f64,
}

impl PoseConfig {
    pub fn to_pose(&self) -> Pose {
        Pose::from_xyz_yaw(self.position, self.yaw)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(tag = "type")] // This tells serde to use the "type" field to decide which enum variant to parse
#[serde(rename_all = "PascalCase")]
pub enum MotionConfig {
    #[default]
    Static,
    Circle {
        radius: f64,
        /// rad/s; negative turns clockwise.
        angular_rate: f64,
        #[serde(default)]
        vertical_amplitude: f64,
    },
}
