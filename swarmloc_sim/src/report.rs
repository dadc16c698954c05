// swarmloc_sim/src/report.rs

use serde::Serialize;
use std::fs;
use std::path::Path;
use swarmloc_core::types::DroneId;

use crate::error::SimError;

/// Summary of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub frames: usize,
    /// Keyframes in the sliding window at the end of the run.
    pub window_size: usize,
    pub loops_sent: usize,
    pub detections_sent: usize,
    pub ready: bool,
    /// Simulated time (s) of the first accepted solve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_ready_s: Option<f64>,
    pub final_cost: f64,
    pub solve_count: usize,
    pub trial_count: usize,
    pub total_solve_time_s: f64,
    pub drones: Vec<DroneReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DroneReport {
    pub id: DroneId,
    /// Number of frames with a prediction to compare against ground truth.
    pub samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_rmse: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaw_rmse_deg: Option<f64>,
}

impl RunReport {
    pub fn to_toml(&self) -> Result<String, SimError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), SimError> {
        fs::write(path, self.to_toml()?)?;
        tracing::info!("Wrote run report to {}", path.display());
        Ok(())
    }
}
