// swarmloc_core/src/messages.rs

use nalgebra::{Matrix4, Vector3};
use std::collections::BTreeMap;

use crate::frames::SwarmFrame;
use crate::pose::Pose;
use crate::types::{DroneId, Timestamp};

// =========================================================================
// == Inbound Measurements ==
// =========================================================================

/// A relative-pose loop closure proposed by the place-recognition pipeline.
///
/// `relative_pose` is the pose of robot `b` at `ts_b` expressed in the
/// gravity-aligned (yaw-only) body frame of robot `a` at `ts_a`. The odometry
/// poses at both stamps let the engine re-anchor the loop onto keyframes.
#[derive(Debug, Clone)]
pub struct LoopConnection {
    pub id_a: DroneId,
    pub ts_a: Timestamp,
    pub self_pose_a: Pose,
    pub id_b: DroneId,
    pub ts_b: Timestamp,
    pub self_pose_b: Pose,
    pub relative_pose: Pose,
}

/// Robot `a` saw robot `b`.
///
/// `bearing` is the unit direction to `b` in `a`'s gravity-aligned body frame.
/// `inv_dep` is the inverse distance when the detector could estimate it.
#[derive(Debug, Clone)]
pub struct DroneDetection {
    pub id_a: DroneId,
    pub ts_a: Timestamp,
    pub self_pose_a: Pose,
    pub id_b: DroneId,
    pub ts_b: Timestamp,
    pub self_pose_b: Pose,
    pub bearing: Vector3<f64>,
    pub inv_dep: Option<f64>,
}

/// The universal input packet of a `SwarmEstimator`.
#[derive(Debug, Clone, Copy)]
pub enum LocalizerInput<'a> {
    SwarmFrame(&'a SwarmFrame),
    Loop(&'a LoopConnection),
    Detection(&'a DroneDetection),
}

// =========================================================================
// == Public API Messages ==
// =========================================================================

/// The shared-frame state of one robot, extrapolated from the last accepted solve.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictedPose {
    pub id: DroneId,
    pub pose: Pose,
    /// Shared-frame velocity (m/s) from the two newest committed snapshots.
    pub velocity: Vector3<f64>,
    /// `[x, y, z, yaw]` covariance. Not recovered from the solver, always zero.
    pub covariance: Matrix4<f64>,
}

/// The answer to a `predict_swarm` query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwarmFrameState {
    pub ts: Timestamp,
    pub node_poses: BTreeMap<DroneId, PredictedPose>,
    /// Transform from each robot's odometry frame into the shared frame.
    pub coordinate_offsets: BTreeMap<DroneId, Pose>,
}
