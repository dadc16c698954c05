// swarmloc_core/src/optimization/residuals.rs

//! The residual blocks of the swarm pose graph. Each block is a smooth
//! function of an ordered list of `[x, y, z, yaw]` parameter blocks; the
//! solver differentiates them numerically.

use nalgebra::Vector3;
use std::fmt::Debug;

use crate::estimation::curator::{Measurement2Drones, MeasurementKind};
use crate::optimization::params::PoseParams;
use crate::pose::{wrap_angle, Pose};

/// Which part of the graph a residual block belongs to. Only used for
/// statistics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidualKind {
    SwarmFrame,
    Horizon,
    Loop,
}

/// A cost function over an ordered list of parameter blocks.
pub trait ResidualBlock: Debug + Send + Sync {
    fn kind(&self) -> ResidualKind;

    /// Number of parameter blocks `evaluate` expects.
    fn num_parameter_blocks(&self) -> usize;

    fn num_residuals(&self) -> usize;

    /// Writes `num_residuals()` values into `residuals`.
    fn evaluate(&self, params: &[PoseParams], residuals: &mut [f64]);
}

/// The Huber loss in the squared-norm form used by robust least squares:
/// `rho(s) = s` for `s <= a²`, else `2a√s - a²`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HuberLoss {
    a: f64,
    b: f64,
}

impl HuberLoss {
    pub fn new(delta: f64) -> Self {
        Self {
            a: delta,
            b: delta * delta,
        }
    }

    /// Returns `(rho(s), rho'(s))`.
    pub fn evaluate(&self, s: f64) -> (f64, f64) {
        if s > self.b {
            let r = s.sqrt();
            (2.0 * self.a * r - self.b, (self.a / r).max(f64::MIN_POSITIVE))
        } else {
            (s, 1.0)
        }
    }
}

// =========================================================================
// == Swarm Frame Residual ==
// =========================================================================

/// Inter-robot range consistency within one keyframe. Parameter blocks are
/// the frame's robots; each enabled range adds one residual
/// `(|p_i - p_j| - d) / sigma`.
#[derive(Debug, Clone)]
pub struct SwarmFrameResidual {
    num_params: usize,
    ranges: Vec<(usize, usize, f64)>,
    inv_sigma: f64,
}

impl SwarmFrameResidual {
    /// `ranges` holds `(param index i, param index j, measured distance)`.
    pub fn new(num_params: usize, ranges: Vec<(usize, usize, f64)>, sigma: f64) -> Self {
        Self {
            num_params,
            ranges,
            inv_sigma: 1.0 / sigma,
        }
    }
}

impl ResidualBlock for SwarmFrameResidual {
    fn kind(&self) -> ResidualKind {
        ResidualKind::SwarmFrame
    }

    fn num_parameter_blocks(&self) -> usize {
        self.num_params
    }

    fn num_residuals(&self) -> usize {
        self.ranges.len()
    }

    fn evaluate(&self, params: &[PoseParams], residuals: &mut [f64]) {
        for (k, &(i, j, d)) in self.ranges.iter().enumerate() {
            let pi = Vector3::new(params[i][0], params[i][1], params[i][2]);
            let pj = Vector3::new(params[j][0], params[j][1], params[j][2]);
            residuals[k] = ((pi - pj).norm() - d) * self.inv_sigma;
        }
    }
}

// =========================================================================
// == Horizon Residual ==
// =========================================================================

/// One consecutive pair of a robot's window history.
#[derive(Debug, Clone)]
pub struct HorizonEdge {
    /// Odometry delta between the two keyframes (yaw-only).
    pub vo_delta: Pose,
    /// Accumulated drift variance of the edge (x, y, z).
    pub position_var: Vector3<f64>,
    pub yaw_var: f64,
}

/// Same-robot odometry consistency over the whole window. Parameter block `k`
/// is the robot's `k`-th distinct estimate; edge `k` links blocks `k` and `k+1`.
#[derive(Debug, Clone)]
pub struct HorizonResidual {
    edges: Vec<HorizonEdge>,
    yaw_observable: bool,
}

impl HorizonResidual {
    pub fn new(edges: Vec<HorizonEdge>, yaw_observable: bool) -> Self {
        Self {
            edges,
            yaw_observable,
        }
    }

    fn per_edge(&self) -> usize {
        if self.yaw_observable {
            4
        } else {
            3
        }
    }
}

impl ResidualBlock for HorizonResidual {
    fn kind(&self) -> ResidualKind {
        ResidualKind::Horizon
    }

    fn num_parameter_blocks(&self) -> usize {
        self.edges.len() + 1
    }

    fn num_residuals(&self) -> usize {
        self.edges.len() * self.per_edge()
    }

    fn evaluate(&self, params: &[PoseParams], residuals: &mut [f64]) {
        let stride = self.per_edge();
        for (k, edge) in self.edges.iter().enumerate() {
            let est_i = Pose::from_xyzyaw(&params[k]);
            let est_j = Pose::from_xyzyaw(&params[k + 1]);
            let est_delta = Pose::delta_pose(&est_i, &est_j, true);

            let dp = est_delta.position() - edge.vo_delta.position();
            let out = &mut residuals[k * stride..(k + 1) * stride];
            for axis in 0..3 {
                out[axis] = dp[axis] / edge.position_var[axis].sqrt();
            }
            if self.yaw_observable {
                out[3] = wrap_angle(est_delta.yaw() - edge.vo_delta.yaw()) / edge.yaw_var.sqrt();
            }
        }
    }
}

// =========================================================================
// == Loop / Detection Residual ==
// =========================================================================

#[derive(Debug, Clone, Copy)]
pub struct LoopSigmas {
    pub xy: f64,
    pub z: f64,
    pub yaw: f64,
    pub sphere: f64,
    pub inv_dep: f64,
}

/// All curated inter-robot measurements in one block.
#[derive(Debug, Clone)]
pub struct LoopResidual {
    num_params: usize,
    /// `(param index a, param index b, measurement)`.
    entries: Vec<(usize, usize, Measurement2Drones)>,
    sigmas: LoopSigmas,
    num_residuals: usize,
}

impl LoopResidual {
    pub fn new(
        num_params: usize,
        entries: Vec<(usize, usize, Measurement2Drones)>,
        sigmas: LoopSigmas,
    ) -> Self {
        let num_residuals = entries.iter().map(|(_, _, m)| m.residual_count()).sum();
        Self {
            num_params,
            entries,
            sigmas,
            num_residuals,
        }
    }
}

impl ResidualBlock for LoopResidual {
    fn kind(&self) -> ResidualKind {
        ResidualKind::Loop
    }

    fn num_parameter_blocks(&self) -> usize {
        self.num_params
    }

    fn num_residuals(&self) -> usize {
        self.num_residuals
    }

    fn evaluate(&self, params: &[PoseParams], residuals: &mut [f64]) {
        let s = &self.sigmas;
        let mut k = 0;
        for (ia, ib, m) in &self.entries {
            let est_a = Pose::from_xyzyaw(&params[*ia]);
            let est_b = Pose::from_xyzyaw(&params[*ib]);
            match &m.kind {
                MeasurementKind::Loop { relative_pose } => {
                    let est_rel = Pose::delta_pose(&est_a, &est_b, true);
                    let dp = est_rel.position() - relative_pose.position();
                    residuals[k] = dp.x / s.xy;
                    residuals[k + 1] = dp.y / s.xy;
                    residuals[k + 2] = dp.z / s.z;
                    residuals[k + 3] = wrap_angle(est_rel.yaw() - relative_pose.yaw()) / s.yaw;
                    k += 4;
                }
                MeasurementKind::Detection {
                    bearing,
                    inv_dep,
                    anchor_a,
                    anchor_b,
                } => {
                    let pa = est_a * *anchor_a;
                    let pb = est_b * *anchor_b;
                    let rel = Pose::delta_pose(&pa, &pb, true);
                    let dist = rel.position().norm().max(1e-6);
                    let unit = rel.position() / dist;
                    for axis in 0..3 {
                        residuals[k + axis] = (unit[axis] - bearing[axis]) / s.sphere;
                    }
                    k += 3;
                    if let Some(inv_dep) = inv_dep {
                        residuals[k] = (1.0 / dist - inv_dep) / s.inv_dep;
                        k += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_huber_is_quadratic_then_linear() {
        let loss = HuberLoss::new(0.1);
        assert_eq!(loss.evaluate(0.005), (0.005, 1.0));
        let (rho, d_rho) = loss.evaluate(1.0);
        assert_abs_diff_eq!(rho, 2.0 * 0.1 * 1.0 - 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(d_rho, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_swarm_frame_residual_zero_at_truth() {
        let block = SwarmFrameResidual::new(2, vec![(0, 1, 5.0)], 0.1);
        let mut r = [0.0];
        block.evaluate(&[[0.0, 0.0, 0.0, 0.0], [3.0, 4.0, 0.0, 1.0]], &mut r);
        assert_abs_diff_eq!(r[0], 0.0, epsilon = 1e-12);

        block.evaluate(&[[0.0, 0.0, 0.0, 0.0], [6.0, 8.0, 0.0, 1.0]], &mut r);
        assert_abs_diff_eq!(r[0], 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_horizon_residual_matches_odometry() {
        let edge = HorizonEdge {
            vo_delta: Pose::from_xyz_yaw(Vector3::new(1.0, 0.0, 0.0), FRAC_PI_2),
            position_var: Vector3::new(0.01, 0.01, 0.0025),
            yaw_var: 0.0025,
        };
        let block = HorizonResidual::new(vec![edge], true);
        assert_eq!(block.num_residuals(), 4);

        // The same motion seen from a rotated global frame.
        let a = [2.0, 2.0, 1.0, FRAC_PI_2];
        let b = [2.0, 3.0, 1.0, std::f64::consts::PI];
        let mut r = [0.0; 4];
        block.evaluate(&[a, b], &mut r);
        for v in r {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_horizon_without_yaw_has_three_residuals_per_edge() {
        let edge = HorizonEdge {
            vo_delta: Pose::identity(),
            position_var: Vector3::new(1.0, 1.0, 1.0),
            yaw_var: 1.0,
        };
        let block = HorizonResidual::new(vec![edge.clone(), edge], false);
        assert_eq!(block.num_parameter_blocks(), 3);
        assert_eq!(block.num_residuals(), 6);
    }
}
