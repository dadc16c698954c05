// swarmloc_core/src/estimation/sync.rs

//! The committed ("saved") estimate: the only state that prediction queries
//! ever read. It is written once per accepted solve.

use nalgebra::{Matrix4, Vector3};
use std::collections::BTreeMap;

use crate::estimation::window::SlidingWindow;
use crate::frames::{NodeFrame, SwarmFrame};
use crate::messages::{PredictedPose, SwarmFrameState};
use crate::optimization::params::PoseArena;
use crate::pose::Pose;
use crate::types::{ts_to_sec, DroneId, Timestamp};

/// One robot at one committed keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommittedPose {
    /// Shared-frame estimate (yaw-only).
    pub estimate: Pose,
    /// Odometry pose at the same keyframe.
    pub odometry: Pose,
}

#[derive(Debug, Clone, Default)]
pub struct CommittedState {
    finished_init: bool,
    by_ts: BTreeMap<Timestamp, BTreeMap<DroneId, CommittedPose>>,
    by_id: BTreeMap<DroneId, BTreeMap<Timestamp, CommittedPose>>,
    /// Newest committed keyframe of every accepted solve, in commit order.
    committed_kf_ts: Vec<Timestamp>,
}

impl CommittedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.finished_init
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.finished_init = ready;
    }

    pub fn commit_count(&self) -> usize {
        self.committed_kf_ts.len()
    }

    pub fn last_committed_ts(&self) -> Option<Timestamp> {
        self.committed_kf_ts.last().copied()
    }

    pub fn committed(&self, ts: Timestamp, id: DroneId) -> Option<&CommittedPose> {
        self.by_ts.get(&ts).and_then(|m| m.get(&id))
    }

    /// Copies every window estimate into the committed store.
    pub fn commit(&mut self, window: &SlidingWindow, arena: &PoseArena) {
        let mut last_ts = None;
        for sf in window.frames() {
            for (id, nf) in &sf.nodes {
                let Some(estimate) = arena.pose(sf.ts, *id) else {
                    continue;
                };
                let entry = CommittedPose {
                    estimate,
                    odometry: nf.self_pose,
                };
                self.by_ts.entry(sf.ts).or_default().insert(*id, entry);
                self.by_id.entry(*id).or_default().insert(sf.ts, entry);
                last_ts = Some(sf.ts);
            }
        }
        if let Some(ts) = last_ts {
            self.committed_kf_ts.push(ts);
        }
    }

    /// Newest committed keyframe holding robot `id`.
    fn latest_for(&self, id: DroneId) -> Option<(Timestamp, &CommittedPose)> {
        self.committed_kf_ts
            .iter()
            .rev()
            .find_map(|ts| self.committed(*ts, id).map(|c| (*ts, c)))
    }

    /// Extrapolates the last committed estimate of `nf.id` to the odometry pose in `nf`.
    pub fn predict_node(&self, nf: &NodeFrame) -> Option<PredictedPose> {
        if !self.finished_init {
            return None;
        }
        let (_, c) = self.latest_for(nf.id)?;
        let pose = c.estimate * Pose::delta_pose(&c.odometry, &nf.self_pose, true);
        Some(PredictedPose {
            id: nf.id,
            pose,
            velocity: self.velocity(nf.id),
            covariance: Matrix4::zeros(),
        })
    }

    /// Shared-frame velocity from the two newest committed keyframes of a robot.
    pub fn velocity(&self, id: DroneId) -> Vector3<f64> {
        let Some(per_id) = self.by_id.get(&id) else {
            return Vector3::zeros();
        };
        let mut newest = per_id.iter().rev();
        match (newest.next(), newest.next()) {
            (Some((t1, p1)), Some((t0, p0))) if t1 > t0 => {
                (p1.estimate.position() - p0.estimate.position()) / ts_to_sec(t1 - t0)
            }
            _ => Vector3::zeros(),
        }
    }

    /// Transform from robot `id`'s odometry frame into the shared frame.
    pub fn node_coordinate_offset(&self, id: DroneId) -> Option<Pose> {
        if !self.finished_init {
            return None;
        }
        let (_, c) = self.latest_for(id)?;
        Some(c.estimate.yaw_only() * c.odometry.yaw_only().inverse())
    }

    pub fn predict_swarm(&self, frame: &SwarmFrame) -> SwarmFrameState {
        let mut state = SwarmFrameState {
            ts: frame.ts,
            ..Default::default()
        };
        for nf in frame.nodes.values() {
            if let Some(p) = self.predict_node(nf) {
                state.node_poses.insert(nf.id, p);
            }
            if let Some(offset) = self.node_coordinate_offset(nf.id) {
                state.coordinate_offsets.insert(nf.id, offset);
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SolverConfig;
    use crate::types::NSEC_PER_SEC;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::FRAC_PI_2;

    fn odom(x: f64) -> Pose {
        Pose::from_xyz_yaw(Vector3::new(x, 0.0, 0.0), 0.0)
    }

    /// Drone 2's odometry frame is the shared frame turned by 90 degrees and shifted by (10, 0).
    fn committed() -> CommittedState {
        let config = SolverConfig::for_drone(1);
        let offset = Pose::from_xyz_yaw(Vector3::new(10.0, 0.0, 0.0), FRAC_PI_2);
        let mut window = SlidingWindow::new();
        let mut arena = PoseArena::new();
        for k in 0..3 {
            let ts = k * NSEC_PER_SEC;
            let vo = odom(k as f64);
            window.push(SwarmFrame::from_nodes(ts, [NodeFrame::new(2, ts, vo)]), &config);
            arena.insert(ts, 2, (offset * vo).to_xyzyaw());
        }
        let mut state = CommittedState::new();
        state.commit(&window, &arena);
        state.set_ready(true);
        state
    }

    #[test]
    fn test_not_ready_predicts_nothing() {
        let mut state = committed();
        state.set_ready(false);
        assert!(state.predict_node(&NodeFrame::new(2, 0, odom(0.0))).is_none());
        assert!(state.node_coordinate_offset(2).is_none());
    }

    #[test]
    fn test_prediction_extrapolates_with_odometry() {
        let state = committed();
        let now = NodeFrame::new(2, 5 * NSEC_PER_SEC, odom(4.0));
        let p = state.predict_node(&now).expect("prediction");
        assert_abs_diff_eq!(p.pose.position().x, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p.pose.position().y, 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(p.velocity.y, 1.0, epsilon = 1e-9);
        assert_eq!(p.covariance, Matrix4::zeros());

        // No new commit in between: identical answers.
        assert_eq!(state.predict_node(&now), Some(p));
        assert!(state.predict_node(&NodeFrame::new(7, 0, odom(0.0))).is_none());
    }

    #[test]
    fn test_coordinate_offset() {
        let state = committed();
        let offset = state.node_coordinate_offset(2).expect("offset");
        assert_abs_diff_eq!(offset.position().x, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(offset.yaw(), FRAC_PI_2, epsilon = 1e-9);
        assert_eq!(state.commit_count(), 1);
        assert_eq!(state.last_committed_ts(), Some(2 * NSEC_PER_SEC));
    }
}
