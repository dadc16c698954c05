// swarmloc_core/src/diagnostics.rs

//! Graphviz export of the current pose graph, for offline inspection only.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::estimation::curator::{Measurement2Drones, MeasurementKind};
use crate::estimation::window::SlidingWindow;
use crate::optimization::params::PoseArena;
use crate::pose::Pose;
use crate::types::{ts_short, ts_to_sec, DroneId, Timestamp};

fn node_name(id: DroneId, ts: Timestamp) -> String {
    format!("Node{}_{}", id, ts_short(ts))
}

fn pose_label(p: &Pose) -> String {
    format!(
        "DP [{:.2},{:.2},{:.2}] DY {:.1}deg",
        p.position().x,
        p.position().y,
        p.position().z,
        p.yaw().to_degrees()
    )
}

/// Renders the window as a Graphviz digraph: one cluster per keyframe, one
/// node per (robot, keyframe), odometry edges between consecutive keyframes
/// of a robot and orange edges for loops and detections.
pub fn pose_graph_dot(window: &SlidingWindow, arena: &PoseArena, measurements: &[Measurement2Drones]) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(out, "digraph G {{");
    let _ = writeln!(out, "  label=\"Pose Graphs\";");
    let _ = writeln!(out, "  node [shape=box, style=filled];");

    for (k, sf) in window.frames().enumerate() {
        let _ = writeln!(out, "  subgraph cluster_{} {{", k);
        let _ = writeln!(out, "    label=\"SF {}\";", ts_short(sf.ts));
        let _ = writeln!(out, "    style=filled; color=lightgrey;");
        for nf in sf.nodes.values() {
            let est = arena
                .pose(sf.ts, nf.id)
                .map(|p| format!("{}", p))
                .unwrap_or_else(|| "unestimated".to_string());
            let color = if nf.is_static { "gold" } else { "white" };
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"Drone {}\\n{}\", fillcolor={}];",
                node_name(nf.id, sf.ts),
                nf.id,
                est,
                color
            );
        }
        let _ = writeln!(out, "  }}");
    }

    // --- Odometry edges ---
    for id in window.drone_ids() {
        let nodes: Vec<_> = window.node_frames(id).collect();
        for pair in nodes.windows(2) {
            let (ts0, nf0) = pair[0];
            let (ts1, nf1) = pair[1];
            let delta = match (arena.pose(ts0, id), arena.pose(ts1, id)) {
                (Some(a), Some(b)) => Pose::delta_pose(&a, &b, true),
                _ => Pose::delta_pose(&nf0.self_pose, &nf1.self_pose, true),
            };
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"VIO:{}\"];",
                node_name(id, ts0),
                node_name(id, ts1),
                pose_label(&delta)
            );
        }
    }

    // --- Inter-robot edges ---
    for m in measurements {
        let label = match &m.kind {
            MeasurementKind::Loop { relative_pose } => format!(
                "loop({}->{} {:.0}ms); {}",
                m.id_a,
                m.id_b,
                ts_to_sec(m.source_ts_b - m.source_ts_a) * 1000.0,
                pose_label(relative_pose)
            ),
            MeasurementKind::Detection { .. } => format!("Detection({}->{})", m.id_a, m.id_b),
        };
        let _ = writeln!(
            out,
            "  \"{}\" -> \"{}\" [color=orange, label=\"{}\"];",
            node_name(m.id_a, m.kf_ts_a),
            node_name(m.id_b, m.kf_ts_b),
            label
        );
    }

    let _ = writeln!(out, "}}");
    out
}

pub fn write_pose_graph_dot(
    path: &Path,
    window: &SlidingWindow,
    arena: &PoseArena,
    measurements: &[Measurement2Drones],
) -> std::io::Result<()> {
    fs::write(path, pose_graph_dot(window, arena, measurements))
}
