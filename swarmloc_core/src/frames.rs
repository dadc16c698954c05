// swarmloc_core/src/frames.rs

//! The observation side of the pose graph: what one robot reported at one
//! instant (`NodeFrame`) and what the whole swarm reported together
//! (`SwarmFrame`).

pub mod aggregator;

use nalgebra::Vector3;
use std::collections::BTreeMap;

use crate::config::SolverConfig;
use crate::pose::Pose;
use crate::types::{DroneId, Timestamp};

// =========================================================================
// == Node Frame ==
// =========================================================================

/// One robot's observation at one timestamp.
#[derive(Debug, Clone)]
pub struct NodeFrame {
    pub id: DroneId,
    /// The robot's own stamp. It may differ slightly from the swarm frame stamp.
    pub ts: Timestamp,
    /// Pose in the robot's own odometry frame.
    pub self_pose: Pose,
    pub vo_available: bool,
    /// Infrastructure node that never moves.
    pub is_static: bool,
    /// Measured ranges to other robots.
    pub dists: BTreeMap<DroneId, f64>,
    /// Which of `dists` take part in the current solve.
    pub enabled_dists: BTreeMap<DroneId, bool>,
    /// Odometry drift variance (x, y, z) accumulated since the previous keyframe.
    pub position_cov_to_last: Vector3<f64>,
    /// Odometry yaw drift variance accumulated since the previous keyframe.
    pub yaw_cov_to_last: f64,
}

impl NodeFrame {
    pub fn new(id: DroneId, ts: Timestamp, self_pose: Pose) -> Self {
        Self {
            id,
            ts,
            self_pose,
            vo_available: true,
            is_static: false,
            dists: BTreeMap::new(),
            enabled_dists: BTreeMap::new(),
            position_cov_to_last: Vector3::zeros(),
            yaw_cov_to_last: 0.0,
        }
    }

    pub fn with_distance(mut self, to: DroneId, distance: f64) -> Self {
        self.dists.insert(to, distance);
        self.enabled_dists.insert(to, true);
        self
    }

    pub fn with_static(mut self, is_static: bool) -> Self {
        self.is_static = is_static;
        self
    }

    pub fn with_vo_available(mut self, vo_available: bool) -> Self {
        self.vo_available = vo_available;
        self
    }

    pub fn position(&self) -> &Vector3<f64> {
        self.self_pose.position()
    }

    pub fn has_distance_to(&self, other: DroneId) -> bool {
        self.dists.contains_key(&other)
    }

    pub fn distance_to(&self, other: DroneId) -> Option<f64> {
        self.dists.get(&other).copied()
    }

    pub fn distance_enabled(&self, other: DroneId) -> bool {
        self.enabled_dists.get(&other).copied().unwrap_or(false)
    }

    /// Resets the edge drift to a single keyframe interval.
    pub fn reset_drift(&mut self, config: &SolverConfig) {
        self.position_cov_to_last = config.vo_drift_xyz();
        self.yaw_cov_to_last = config.vo_yaw_var();
    }

    /// Adds one keyframe interval of drift to the edge covariance.
    pub fn inflate_drift(&mut self, config: &SolverConfig) {
        self.position_cov_to_last += config.vo_drift_xyz();
        self.yaw_cov_to_last += config.vo_yaw_var();
    }
}

// =========================================================================
// == Swarm Frame ==
// =========================================================================

/// The joint observation of every visible robot at one timestamp.
#[derive(Debug, Clone)]
pub struct SwarmFrame {
    pub ts: Timestamp,
    pub nodes: BTreeMap<DroneId, NodeFrame>,
}

impl SwarmFrame {
    pub fn new(ts: Timestamp) -> Self {
        Self {
            ts,
            nodes: BTreeMap::new(),
        }
    }

    /// Builds a frame from its nodes, keyed by their ids.
    pub fn from_nodes(ts: Timestamp, nodes: impl IntoIterator<Item = NodeFrame>) -> Self {
        Self {
            ts,
            nodes: nodes.into_iter().map(|nf| (nf.id, nf)).collect(),
        }
    }

    pub fn insert(&mut self, node: NodeFrame) {
        self.nodes.insert(node.id, node);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn has_node(&self, id: DroneId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// True when the robot is present and its odometry is usable.
    pub fn has_odometry(&self, id: DroneId) -> bool {
        self.nodes.get(&id).is_some_and(|nf| nf.vo_available)
    }

    pub fn node(&self, id: DroneId) -> Option<&NodeFrame> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: DroneId) -> Option<&mut NodeFrame> {
        self.nodes.get_mut(&id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = DroneId> + '_ {
        self.nodes.keys().copied()
    }

    /// The stamp robot `id` reported in this frame.
    pub fn node_ts(&self, id: DroneId) -> Option<Timestamp> {
        self.nodes.get(&id).map(|nf| nf.ts)
    }

    pub fn distance(&self, from: DroneId, to: DroneId) -> Option<f64> {
        self.nodes.get(&from).and_then(|nf| nf.distance_to(to))
    }

    pub fn distance_enabled(&self, from: DroneId, to: DroneId) -> bool {
        self.nodes
            .get(&from)
            .is_some_and(|nf| nf.distance_enabled(to))
    }

    /// Number of ranges currently taking part in the solve.
    pub fn enabled_distance_count(&self) -> usize {
        self.nodes
            .values()
            .map(|nf| nf.enabled_dists.values().filter(|e| **e).count())
            .sum()
    }
}
