// swarmloc_core/src/config.rs

//! The immutable tuning surface of the localization engine. One `SolverConfig`
//! is built at startup (usually deserialized from a scenario or launch file)
//! and threaded by reference through every component.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::types::DroneId;

// =========================================================================
// == Top-Level Configuration ==
// =========================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)] // Fail if the TOML has fields not in our struct
pub struct SolverConfig {
    /// The id of the robot running this engine. Its first window pose anchors the graph.
    pub self_id: Option<DroneId>,

    // --- Sliding window ---
    pub max_frame_number: usize,
    pub min_frame_number: usize,
    /// Evict a random non-terminal keyframe instead of the oldest one.
    pub random_eviction: bool,

    // --- Keyframe selection ---
    pub min_drones_num: usize,
    /// Self movement (m) needed to accept a new keyframe.
    pub kf_movement: f64,
    pub enable_keyframe_replacement: bool,
    /// Minimum age (s) of the last keyframe before a replacement is allowed.
    pub replace_min_duration: f64,

    // --- Observability ---
    pub init_xy_movement: f64,
    /// Required z extent of the self bounding box. Zero disables the check.
    pub init_z_movement: f64,
    pub thres_yaw_obser_xy: f64,
    pub single_drone_sfs_thres: usize,

    // --- Initialization ---
    pub init_trial: usize,
    pub rand_init_xy: f64,
    pub rand_init_z: f64,
    pub not_moving_thres: f64,
    pub not_moving_yaw: f64,
    /// Seed of the random-restart generator. `None` seeds from entropy.
    pub seed: Option<u64>,

    // --- Solver ---
    pub acpt_cost: f64,
    pub thread_num: usize,
    /// Wall-clock cap (s) of a post-initialization solve.
    pub max_solver_time: f64,
    pub max_iterations: usize,
    pub huber_delta: f64,
    pub error_normalized: f64,

    // --- Measurement curation ---
    pub enable_loop: bool,
    pub enable_detection: bool,
    pub enable_distance: bool,
    pub loop_outlier_threshold_pos: f64,
    pub loop_outlier_threshold_yaw: f64,
    pub detection_outlier_threshold_angle: f64,

    // --- Frame aggregation ---
    /// Odometry older than this (s) is considered unavailable.
    pub max_odometry_age: f64,
    /// Distance readings older than this (s) are dropped from a frame.
    pub max_distance_age: f64,

    // --- Noise model (standard deviations) ---
    pub vo_drift_meter: f64,
    pub vo_drift_meter_z: f64,
    pub vo_error_angle: f64,
    pub distance_measure_error: f64,
    pub loop_cov_xy: f64,
    pub loop_cov_z: f64,
    pub loop_yaw_cov: f64,
    pub detection_sphere_cov: f64,
    pub detection_inv_dep_cov: f64,

    // --- Diagnostics ---
    pub enable_cgraph_generation: bool,
    pub cgraph_path: PathBuf,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            self_id: None,
            max_frame_number: 20,
            min_frame_number: 10,
            random_eviction: true,
            min_drones_num: 1,
            kf_movement: 0.2,
            enable_keyframe_replacement: false,
            replace_min_duration: 0.1,
            init_xy_movement: 2.0,
            init_z_movement: 0.0,
            thres_yaw_obser_xy: 1.0,
            single_drone_sfs_thres: 3,
            init_trial: 5,
            rand_init_xy: 5.0,
            rand_init_z: 1.0,
            not_moving_thres: 0.02,
            not_moving_yaw: 0.05,
            seed: None,
            acpt_cost: 0.4,
            thread_num: 4,
            max_solver_time: 0.5,
            max_iterations: 1000,
            huber_delta: 0.1,
            error_normalized: 1.0,
            enable_loop: true,
            enable_detection: true,
            enable_distance: true,
            loop_outlier_threshold_pos: 1.0,
            loop_outlier_threshold_yaw: 0.5,
            detection_outlier_threshold_angle: 0.35,
            max_odometry_age: 0.5,
            max_distance_age: 0.1,
            vo_drift_meter: 0.1,
            vo_drift_meter_z: 0.05,
            vo_error_angle: 0.05,
            distance_measure_error: 0.1,
            loop_cov_xy: 0.1,
            loop_cov_z: 0.05,
            loop_yaw_cov: 0.05,
            detection_sphere_cov: 0.05,
            detection_inv_dep_cov: 0.2,
            enable_cgraph_generation: false,
            cgraph_path: "/tmp/swarmloc_graph.dot".into(),
        }
    }
}

impl SolverConfig {
    /// A default configuration for the given local robot.
    pub fn for_drone(self_id: DroneId) -> Self {
        Self {
            self_id: Some(self_id),
            ..Default::default()
        }
    }

    /// Checks the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_number < 2 {
            return Err(ConfigError::WindowTooSmall(self.max_frame_number));
        }
        if self.min_frame_number > self.max_frame_number {
            return Err(ConfigError::FrameBounds {
                min: self.min_frame_number,
                max: self.max_frame_number,
            });
        }

        let sigmas = [
            ("vo_drift_meter", self.vo_drift_meter),
            ("vo_drift_meter_z", self.vo_drift_meter_z),
            ("vo_error_angle", self.vo_error_angle),
            ("distance_measure_error", self.distance_measure_error),
            ("loop_cov_xy", self.loop_cov_xy),
            ("loop_cov_z", self.loop_cov_z),
            ("loop_yaw_cov", self.loop_yaw_cov),
            ("detection_sphere_cov", self.detection_sphere_cov),
            ("detection_inv_dep_cov", self.detection_inv_dep_cov),
            ("huber_delta", self.huber_delta),
            ("error_normalized", self.error_normalized),
        ];
        for (name, value) in sigmas {
            if !(value > 0.0) {
                return Err(ConfigError::NonPositive { name, value });
            }
        }
        Ok(())
    }

    /// Per-axis odometry drift variance accumulated over one keyframe edge.
    pub fn vo_drift_xyz(&self) -> nalgebra::Vector3<f64> {
        nalgebra::Vector3::new(
            self.vo_drift_meter.powi(2),
            self.vo_drift_meter.powi(2),
            self.vo_drift_meter_z.powi(2),
        )
    }

    /// Yaw drift variance accumulated over one keyframe edge.
    pub fn vo_yaw_var(&self) -> f64 {
        self.vo_error_angle.powi(2)
    }
}
