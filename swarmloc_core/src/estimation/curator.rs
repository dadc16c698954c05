// swarmloc_core/src/estimation/curator.rs

//! Turns raw loop closures and detections into constraints between keyframes
//! of the current window.

use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::SolverConfig;
use crate::estimation::window::SlidingWindow;
use crate::messages::{DroneDetection, LoopConnection};
use crate::optimization::params::PoseArena;
use crate::pose::{wrap_angle, Pose};
use crate::types::{ts_short, DroneId, Timestamp};

/// Undirected adjacency of robots linked by an accepted measurement.
pub type LoopGraph = BTreeMap<DroneId, BTreeSet<DroneId>>;

#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementKind {
    /// Pose of `b`'s keyframe in the yaw-only frame of `a`'s keyframe.
    Loop { relative_pose: Pose },
    /// Bearing (and optional inverse depth) of `b` seen by `a` at the raw
    /// stamps. `anchor_a`/`anchor_b` move each keyframe estimate to the
    /// measurement stamp: `est_a * anchor_a`.
    Detection {
        bearing: Vector3<f64>,
        inv_dep: Option<f64>,
        anchor_a: Pose,
        anchor_b: Pose,
    },
}

/// A validated two-robot measurement attached to window keyframes.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement2Drones {
    pub id_a: DroneId,
    pub id_b: DroneId,
    /// Stamps of the matched keyframes. These key the parameter blocks.
    pub kf_ts_a: Timestamp,
    pub kf_ts_b: Timestamp,
    /// Stamps of the raw measurement.
    pub source_ts_a: Timestamp,
    pub source_ts_b: Timestamp,
    pub kind: MeasurementKind,
    /// How many raw measurements were averaged into this one.
    pub avg_count: usize,
}

/// Duplicate-detection key. Detections also key on their raw stamps because
/// their anchors depend on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct MeasurementKey {
    is_loop: bool,
    id_a: DroneId,
    id_b: DroneId,
    kf_ts_a: Timestamp,
    kf_ts_b: Timestamp,
    source: (Timestamp, Timestamp),
}

impl Measurement2Drones {
    pub fn is_loop(&self) -> bool {
        matches!(self.kind, MeasurementKind::Loop { .. })
    }

    pub fn residual_count(&self) -> usize {
        match &self.kind {
            MeasurementKind::Loop { .. } => 4,
            MeasurementKind::Detection { inv_dep, .. } => 3 + inv_dep.is_some() as usize,
        }
    }

    fn key(&self) -> MeasurementKey {
        MeasurementKey {
            is_loop: self.is_loop(),
            id_a: self.id_a,
            id_b: self.id_b,
            kf_ts_a: self.kf_ts_a,
            kf_ts_b: self.kf_ts_b,
            source: if self.is_loop() {
                (0, 0)
            } else {
                (self.source_ts_a, self.source_ts_b)
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CuratedMeasurements {
    pub measurements: Vec<Measurement2Drones>,
    pub loop_edges: LoopGraph,
    pub rejected: usize,
}

impl CuratedMeasurements {
    pub fn loop_count(&self) -> usize {
        self.measurements.iter().filter(|m| m.is_loop()).count()
    }

    pub fn detection_count(&self) -> usize {
        self.measurements.len() - self.loop_count()
    }
}

/// The keyframes nearest in time to the two endpoints, as
/// `(keyframe ts a, node pose a, keyframe ts b, node pose b)`.
fn match_endpoints(
    window: &SlidingWindow,
    id_a: DroneId,
    ts_a: Timestamp,
    id_b: DroneId,
    ts_b: Timestamp,
) -> Option<(Timestamp, Pose, Timestamp, Pose)> {
    let (ia, _) = window.nearest_frame(id_a, ts_a)?;
    let (ib, _) = window.nearest_frame(id_b, ts_b)?;
    let sfa = window.get(ia)?;
    let sfb = window.get(ib)?;
    Some((
        sfa.ts,
        sfa.node(id_a)?.self_pose,
        sfb.ts,
        sfb.node(id_b)?.self_pose,
    ))
}

/// Re-anchors a loop closure onto window keyframes.
pub fn loop_from_connection(
    loc: &LoopConnection,
    window: &SlidingWindow,
    estimates: Option<&PoseArena>,
    config: &SolverConfig,
) -> Option<Measurement2Drones> {
    let (kf_ts_a, nf_pose_a, kf_ts_b, nf_pose_b) = match_endpoints(window, loc.id_a, loc.ts_a, loc.id_b, loc.ts_b)?;

    let dpose_self_a = Pose::delta_pose(&nf_pose_a, &loc.self_pose_a, true);
    let dpose_self_b = Pose::delta_pose(&loc.self_pose_b, &nf_pose_b, true);
    let new_loop = dpose_self_a * loc.relative_pose * dpose_self_b;

    if let Some(arena) = estimates {
        if let (Some(est_a), Some(est_b)) = (arena.pose(kf_ts_a, loc.id_a), arena.pose(kf_ts_b, loc.id_b)) {
            let dpose_est = Pose::delta_pose(&est_a, &est_b, true);
            let err = Pose::delta_pose(&dpose_est, &new_loop, true);
            if err.position().norm() > config.loop_outlier_threshold_pos
                || err.yaw().abs() > config.loop_outlier_threshold_yaw
            {
                tracing::warn!(
                    "Loop {}({})->{}({}) disagrees with estimate: P {:.2} Y {:.1}deg. Give up this loop",
                    loc.id_a,
                    ts_short(kf_ts_a),
                    loc.id_b,
                    ts_short(kf_ts_b),
                    err.position().norm(),
                    err.yaw().to_degrees()
                );
                return None;
            }
        }
    }

    Some(Measurement2Drones {
        id_a: loc.id_a,
        id_b: loc.id_b,
        kf_ts_a,
        kf_ts_b,
        source_ts_a: loc.ts_a,
        source_ts_b: loc.ts_b,
        kind: MeasurementKind::Loop { relative_pose: new_loop },
        avg_count: 1,
    })
}

/// Predicted unit bearing and distance of `b` seen from `a` under the current estimates.
pub fn predicted_bearing(est_a: &Pose, est_b: &Pose, anchor_a: &Pose, anchor_b: &Pose) -> (Vector3<f64>, f64) {
    let pa = est_a * anchor_a;
    let pb = est_b * anchor_b;
    let rel = Pose::delta_pose(&pa, &pb, true);
    let dist = rel.position().norm().max(1e-6);
    (rel.position() / dist, dist)
}

/// Attaches a detection to window keyframes.
pub fn detection_from_source(
    det: &DroneDetection,
    window: &SlidingWindow,
    estimates: Option<&PoseArena>,
    config: &SolverConfig,
) -> Option<Measurement2Drones> {
    let norm = det.bearing.norm();
    if !(norm > 1e-9) {
        tracing::debug!(id_a = det.id_a, id_b = det.id_b, "Detection with degenerate bearing dropped");
        return None;
    }
    let bearing = det.bearing / norm;

    let (kf_ts_a, nf_pose_a, kf_ts_b, nf_pose_b) = match_endpoints(window, det.id_a, det.ts_a, det.id_b, det.ts_b)?;
    let anchor_a = Pose::delta_pose(&nf_pose_a, &det.self_pose_a, true);
    let anchor_b = Pose::delta_pose(&nf_pose_b, &det.self_pose_b, true);

    if let Some(arena) = estimates {
        if let (Some(est_a), Some(est_b)) = (arena.pose(kf_ts_a, det.id_a), arena.pose(kf_ts_b, det.id_b)) {
            let (predicted, _) = predicted_bearing(&est_a, &est_b, &anchor_a, &anchor_b);
            let angle = predicted.dot(&bearing).clamp(-1.0, 1.0).acos();
            if angle > config.detection_outlier_threshold_angle {
                tracing::warn!(
                    "Detection {}({})->{}({}) off by {:.1}deg. Give up this detection",
                    det.id_a,
                    ts_short(kf_ts_a),
                    det.id_b,
                    ts_short(kf_ts_b),
                    angle.to_degrees()
                );
                return None;
            }
        }
    }

    Some(Measurement2Drones {
        id_a: det.id_a,
        id_b: det.id_b,
        kf_ts_a,
        kf_ts_b,
        source_ts_a: det.ts_a,
        source_ts_b: det.ts_b,
        kind: MeasurementKind::Detection {
            bearing,
            inv_dep: det.inv_dep.filter(|d| d.is_finite() && *d > 0.0),
            anchor_a,
            anchor_b,
        },
        avg_count: 1,
    })
}

/// Merges measurements with the same key into their mean.
pub fn average_same_measurements(measurements: Vec<Measurement2Drones>) -> Vec<Measurement2Drones> {
    let mut groups: BTreeMap<MeasurementKey, Vec<Measurement2Drones>> = BTreeMap::new();
    for m in measurements {
        groups.entry(m.key()).or_default().push(m);
    }

    groups
        .into_values()
        .filter_map(|group| {
            let count = group.len();
            let mut merged = group.first()?.clone();
            merged.avg_count = count;
            match &mut merged.kind {
                MeasurementKind::Loop { relative_pose } => {
                    let yaw0 = relative_pose.yaw();
                    let mut pos_sum = Vector3::zeros();
                    let mut dyaw_sum = 0.0;
                    for m in &group {
                        if let MeasurementKind::Loop { relative_pose: p } = &m.kind {
                            pos_sum += p.position();
                            dyaw_sum += wrap_angle(p.yaw() - yaw0);
                        }
                    }
                    *relative_pose = Pose::from_xyz_yaw(pos_sum / count as f64, yaw0 + dyaw_sum / count as f64);
                }
                MeasurementKind::Detection { bearing, inv_dep, .. } => {
                    let mut bearing_sum = Vector3::zeros();
                    let mut inv_deps = Vec::new();
                    for m in &group {
                        if let MeasurementKind::Detection { bearing: b, inv_dep: d, .. } = &m.kind {
                            bearing_sum += b;
                            inv_deps.extend(d.iter().copied());
                        }
                    }
                    if bearing_sum.norm() > 1e-9 {
                        *bearing = bearing_sum.normalize();
                    }
                    if !inv_deps.is_empty() {
                        *inv_dep = Some(inv_deps.iter().sum::<f64>() / inv_deps.len() as f64);
                    }
                }
            }
            Some(merged)
        })
        .collect()
}

/// Validates every raw measurement against the window and builds the loop graph.
///
/// `estimates` is only passed once the engine has converged; outlier gating
/// is skipped before that because the estimates are not yet trustworthy.
pub fn curate(
    loops: &[LoopConnection],
    detections: &[DroneDetection],
    window: &SlidingWindow,
    estimates: Option<&PoseArena>,
    config: &SolverConfig,
) -> CuratedMeasurements {
    let mut out = CuratedMeasurements::default();
    if window.is_empty() {
        return out;
    }

    let mut good = Vec::new();
    if config.enable_loop {
        for loc in loops {
            match loop_from_connection(loc, window, estimates, config) {
                Some(m) => good.push(m),
                None => out.rejected += 1,
            }
        }
    }
    if config.enable_detection {
        for det in detections {
            match detection_from_source(det, window, estimates, config) {
                Some(m) => good.push(m),
                None => out.rejected += 1,
            }
        }
    }

    for m in &good {
        out.loop_edges.entry(m.id_a).or_default().insert(m.id_b);
        out.loop_edges.entry(m.id_b).or_default().insert(m.id_a);
    }
    out.measurements = average_same_measurements(good);

    tracing::debug!(
        loops = loops.len(),
        detections = detections.len(),
        accepted = out.measurements.len(),
        rejected = out.rejected,
        "Curated two-drone measurements"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{NodeFrame, SwarmFrame};
    use approx::assert_abs_diff_eq;
    use nalgebra::UnitQuaternion;

    fn pose(x: f64, y: f64, yaw: f64) -> Pose {
        Pose::from_xyz_yaw(Vector3::new(x, y, 0.0), yaw)
    }

    /// Drone 1 at x = t, drone 2 static at (0, 5) in its own odometry frame.
    fn window() -> SlidingWindow {
        let config = SolverConfig::for_drone(1);
        let mut w = SlidingWindow::new();
        for t in 0..5 {
            let ts = t * 100;
            w.push(
                SwarmFrame::from_nodes(
                    ts,
                    [
                        NodeFrame::new(1, ts, pose(t as f64, 0.0, 0.0)),
                        NodeFrame::new(2, ts + 3, pose(0.0, 5.0, 0.0)),
                    ],
                ),
                &config,
            );
        }
        w
    }

    fn truth_arena(w: &SlidingWindow) -> PoseArena {
        let mut arena = PoseArena::new();
        for sf in w.frames() {
            for nf in sf.nodes.values() {
                arena.insert(sf.ts, nf.id, nf.self_pose.to_xyzyaw());
            }
        }
        arena
    }

    fn loop_at(ts: Timestamp, dx: f64) -> LoopConnection {
        let t = ts as f64 / 100.0;
        LoopConnection {
            id_a: 1,
            ts_a: ts,
            self_pose_a: pose(t, 0.0, 0.0),
            id_b: 2,
            ts_b: ts,
            self_pose_b: pose(0.0, 5.0, 0.0),
            relative_pose: pose(-t + dx, 5.0, 0.0),
        }
    }

    #[test]
    fn test_loop_is_reanchored_to_nearest_keyframe() {
        let w = window();
        let config = SolverConfig::for_drone(1);
        // Stamp 240 with drone 1 at x = 2.4 lands on keyframe 200 (x = 2).
        let loc = LoopConnection {
            ts_a: 240,
            self_pose_a: pose(2.4, 0.0, 0.0),
            relative_pose: pose(-2.4, 5.0, 0.0),
            ..loop_at(240, 0.0)
        };
        let m = loop_from_connection(&loc, &w, None, &config).expect("loop");
        assert_eq!(m.kf_ts_a, 200);
        assert_eq!(m.kf_ts_b, 200);
        match m.kind {
            MeasurementKind::Loop { relative_pose } => {
                assert_abs_diff_eq!(relative_pose.position().x, -2.0, epsilon = 1e-9);
                assert_abs_diff_eq!(relative_pose.position().y, 5.0, epsilon = 1e-9);
            }
            _ => panic!("expected a loop"),
        }
    }

    #[test]
    fn test_loop_keeps_roll_and_pitch_of_relative_pose() {
        let w = window();
        let config = SolverConfig::for_drone(1);
        // Endpoint a sits on keyframe 100; drone 2's keyframe pose is 0.5 m
        // ahead of where it was when the loop was found.
        let relative_pose = Pose::new(
            Vector3::new(1.0, 2.0, 0.0),
            UnitQuaternion::from_euler_angles(0.2, 0.3, 0.0),
        );
        let loc = LoopConnection {
            id_a: 1,
            ts_a: 100,
            self_pose_a: pose(1.0, 0.0, 0.0),
            id_b: 2,
            ts_b: 103,
            self_pose_b: pose(-0.5, 5.0, 0.0),
            relative_pose,
        };
        let m = loop_from_connection(&loc, &w, None, &config).expect("loop");
        let MeasurementKind::Loop { relative_pose: reanchored } = m.kind else {
            panic!("expected a loop");
        };
        let expected = relative_pose.position() + relative_pose.attitude() * Vector3::new(0.5, 0.0, 0.0);
        assert_abs_diff_eq!(reanchored.position().x, expected.x, epsilon = 1e-9);
        assert_abs_diff_eq!(reanchored.position().y, expected.y, epsilon = 1e-9);
        assert_abs_diff_eq!(reanchored.position().z, expected.z, epsilon = 1e-9);
        assert!(expected.z.abs() > 0.1);
    }

    #[test]
    fn test_unknown_drone_is_discarded() {
        let w = window();
        let config = SolverConfig::for_drone(1);
        let loc = LoopConnection {
            id_b: 9,
            ..loop_at(100, 0.0)
        };
        let curated = curate(&[loc], &[], &w, None, &config);
        assert!(curated.measurements.is_empty());
        assert_eq!(curated.rejected, 1);
    }

    #[test]
    fn test_outlier_gate_only_with_estimates() {
        let w = window();
        let arena = truth_arena(&w);
        let config = SolverConfig::for_drone(1);
        let bad = loop_at(100, 3.0);

        assert!(loop_from_connection(&bad, &w, None, &config).is_some());
        assert!(loop_from_connection(&bad, &w, Some(&arena), &config).is_none());
        assert!(loop_from_connection(&loop_at(100, 0.1), &w, Some(&arena), &config).is_some());
    }

    #[test]
    fn test_duplicates_are_averaged_and_graph_built() {
        let w = window();
        let config = SolverConfig::for_drone(1);
        let loops = [loop_at(300, 0.2), loop_at(300, -0.2), loop_at(100, 0.0)];
        let curated = curate(&loops, &[], &w, None, &config);

        assert_eq!(curated.measurements.len(), 2);
        let merged = curated
            .measurements
            .iter()
            .find(|m| m.kf_ts_a == 300)
            .expect("merged loop");
        assert_eq!(merged.avg_count, 2);
        match &merged.kind {
            MeasurementKind::Loop { relative_pose } => {
                assert_abs_diff_eq!(relative_pose.position().x, -3.0, epsilon = 1e-9);
            }
            _ => panic!("expected a loop"),
        }
        assert!(curated.loop_edges[&1].contains(&2));
        assert!(curated.loop_edges[&2].contains(&1));
    }

    #[test]
    fn test_detection_gate_uses_bearing_angle() {
        let w = window();
        let arena = truth_arena(&w);
        let config = SolverConfig::for_drone(1);
        // At keyframe 0 drone 2 is straight ahead along +y.
        let det = DroneDetection {
            id_a: 1,
            ts_a: 0,
            self_pose_a: pose(0.0, 0.0, 0.0),
            id_b: 2,
            ts_b: 3,
            self_pose_b: pose(0.0, 5.0, 0.0),
            bearing: Vector3::new(0.0, 2.0, 0.0),
            inv_dep: Some(0.2),
        };
        let m = detection_from_source(&det, &w, Some(&arena), &config).expect("consistent detection");
        assert_eq!(m.residual_count(), 4);

        let wrong = DroneDetection {
            bearing: Vector3::new(1.0, 0.0, 0.0),
            ..det
        };
        assert!(detection_from_source(&wrong, &w, Some(&arena), &config).is_none());
    }
}
