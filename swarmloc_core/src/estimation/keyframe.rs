// swarmloc_core/src/estimation/keyframe.rs

use std::collections::{BTreeMap, BTreeSet};

use crate::config::SolverConfig;
use crate::estimation::window::SlidingWindow;
use crate::frames::SwarmFrame;
use crate::types::{sec_to_ts, DroneId};

/// What to do with an incoming swarm frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeDecision {
    Reject,
    NewKeyframe,
    /// Replace the newest keyframe in place. Only produced when
    /// `enable_keyframe_replacement` is set.
    ReplaceLast,
}

/// Decides which swarm frames are informative enough to keep, and keeps the
/// bookkeeping of which robots have been seen.
#[derive(Debug, Clone, Default)]
pub struct KeyframeSelector {
    all_nodes: BTreeSet<DroneId>,
    node_kf_count: BTreeMap<DroneId, usize>,
    max_drone_num: usize,
}

impl KeyframeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn judge(&self, frame: &SwarmFrame, window: &SlidingWindow, config: &SolverConfig) -> KeyframeDecision {
        let Some(self_id) = config.self_id else {
            return KeyframeDecision::Reject;
        };

        if frame.len() < config.min_drones_num {
            return KeyframeDecision::Reject;
        }

        let Some(last) = window.last() else {
            return if frame.has_odometry(self_id) {
                KeyframeDecision::NewKeyframe
            } else {
                KeyframeDecision::Reject
            };
        };

        if !frame.has_odometry(self_id) {
            return KeyframeDecision::Reject;
        }

        // The previous keyframe may lack self odometry; treat that as a jump.
        let movement = match (frame.node(self_id), last.node(self_id)) {
            (Some(now), Some(prev)) => (now.position() - prev.position()).norm(),
            _ => f64::INFINITY,
        };
        if movement > config.kf_movement {
            tracing::debug!(ts = frame.ts, movement, "Swarm frame accepted as keyframe (self moved)");
            return KeyframeDecision::NewKeyframe;
        }

        if let Some(id) = frame.node_ids().find(|id| !self.all_nodes.contains(id)) {
            tracing::info!(ts = frame.ts, id, "Swarm frame accepted as keyframe (new drone)");
            return KeyframeDecision::NewKeyframe;
        }

        if config.enable_keyframe_replacement
            && window.len() > 1
            && frame.ts - last.ts >= sec_to_ts(config.replace_min_duration)
        {
            return KeyframeDecision::ReplaceLast;
        }

        KeyframeDecision::Reject
    }

    /// Registers the robots of an accepted keyframe.
    pub fn record_keyframe(&mut self, frame: &SwarmFrame) {
        for id in frame.node_ids() {
            self.all_nodes.insert(id);
            *self.node_kf_count.entry(id).or_insert(0) += 1;
        }
    }

    /// Tracks the largest swarm seen in a single frame, keyframe or not.
    pub fn record_frame(&mut self, frame: &SwarmFrame) {
        self.max_drone_num = self.max_drone_num.max(frame.len());
    }

    pub fn all_nodes(&self) -> &BTreeSet<DroneId> {
        &self.all_nodes
    }

    pub fn keyframe_count(&self, id: DroneId) -> usize {
        self.node_kf_count.get(&id).copied().unwrap_or(0)
    }

    pub fn max_drone_num(&self) -> usize {
        self.max_drone_num
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::NodeFrame;
    use crate::pose::Pose;
    use crate::types::NSEC_PER_SEC;
    use nalgebra::Vector3;

    fn frame(ts: i64, nodes: &[(DroneId, f64, bool)]) -> SwarmFrame {
        SwarmFrame::from_nodes(
            ts,
            nodes.iter().map(|&(id, x, vo)| {
                NodeFrame::new(id, ts, Pose::from_xyz_yaw(Vector3::new(x, 0.0, 0.0), 0.0)).with_vo_available(vo)
            }),
        )
    }

    fn accept(selector: &mut KeyframeSelector, window: &mut SlidingWindow, f: SwarmFrame, config: &SolverConfig) {
        selector.record_keyframe(&f);
        window.push(f, config);
    }

    #[test]
    fn test_first_frame_requires_self_odometry() {
        let config = SolverConfig::for_drone(1);
        let selector = KeyframeSelector::new();
        let window = SlidingWindow::new();

        assert_eq!(
            selector.judge(&frame(0, &[(2, 0.0, true)]), &window, &config),
            KeyframeDecision::Reject
        );
        assert_eq!(
            selector.judge(&frame(0, &[(1, 0.0, false)]), &window, &config),
            KeyframeDecision::Reject
        );
        assert_eq!(
            selector.judge(&frame(0, &[(1, 0.0, true)]), &window, &config),
            KeyframeDecision::NewKeyframe
        );
    }

    #[test]
    fn test_movement_and_new_drone_rules() {
        let config = SolverConfig::for_drone(1);
        let mut selector = KeyframeSelector::new();
        let mut window = SlidingWindow::new();
        accept(&mut selector, &mut window, frame(0, &[(1, 0.0, true)]), &config);

        // Redundant: self barely moved.
        let still = frame(NSEC_PER_SEC, &[(1, 0.1, true)]);
        assert_eq!(selector.judge(&still, &window, &config), KeyframeDecision::Reject);

        // Self moved enough.
        let moved = frame(NSEC_PER_SEC, &[(1, 0.5, true)]);
        assert_eq!(selector.judge(&moved, &window, &config), KeyframeDecision::NewKeyframe);

        // A never-seen drone joins.
        let joined = frame(NSEC_PER_SEC, &[(1, 0.1, true), (2, 3.0, true)]);
        assert_eq!(selector.judge(&joined, &window, &config), KeyframeDecision::NewKeyframe);

        // Self lost odometry.
        let lost = frame(NSEC_PER_SEC, &[(1, 5.0, false), (2, 3.0, true)]);
        assert_eq!(selector.judge(&lost, &window, &config), KeyframeDecision::Reject);
    }

    #[test]
    fn test_min_drones_and_replacement() {
        let config = SolverConfig {
            min_drones_num: 2,
            enable_keyframe_replacement: true,
            ..SolverConfig::for_drone(1)
        };
        let mut selector = KeyframeSelector::new();
        let mut window = SlidingWindow::new();
        assert_eq!(
            selector.judge(&frame(0, &[(1, 0.0, true)]), &window, &config),
            KeyframeDecision::Reject
        );

        accept(&mut selector, &mut window, frame(0, &[(1, 0.0, true), (2, 1.0, true)]), &config);
        accept(
            &mut selector,
            &mut window,
            frame(NSEC_PER_SEC, &[(1, 1.0, true), (2, 1.0, true)]),
            &config,
        );
        let still = frame(2 * NSEC_PER_SEC, &[(1, 1.05, true), (2, 1.0, true)]);
        assert_eq!(selector.judge(&still, &window, &config), KeyframeDecision::ReplaceLast);
        assert_eq!(selector.keyframe_count(1), 2);
    }
}
