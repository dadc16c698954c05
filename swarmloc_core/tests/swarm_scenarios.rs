// swarmloc_core/tests/swarm_scenarios.rs

//! End-to-end runs of the localizer on small noise-free swarms.

use approx::assert_abs_diff_eq;
use nalgebra::Vector3;
use swarmloc_core::pose::wrap_angle;
use swarmloc_core::prelude::*;
use swarmloc_core::types::NSEC_PER_SEC;

/// Drone 2's odometry frame seen from the shared frame.
fn drone2_origin() -> Pose {
    Pose::from_xyz_yaw(Vector3::new(3.0, -2.0, 0.0), 0.6)
}

fn truth(id: DroneId, t: f64) -> Pose {
    let w = 0.25;
    match id {
        1 => Pose::from_xyz_yaw(
            Vector3::new(3.0 * (w * t).cos(), 3.0 * (w * t).sin(), 1.0 + 0.3 * (2.0 * w * t).sin()),
            wrap_angle(w * t + std::f64::consts::FRAC_PI_2),
        ),
        _ => Pose::from_xyz_yaw(
            Vector3::new(2.0 + 2.0 * (w * t).cos(), 1.0 - 2.0 * (w * t).sin(), 1.5),
            wrap_angle(-w * t),
        ),
    }
}

/// Odometry reading: drone 1 odometry is the shared frame, drone 2's is offset.
fn odometry(id: DroneId, t: f64) -> Pose {
    match id {
        1 => truth(1, t),
        _ => drone2_origin().inverse() * truth(2, t),
    }
}

fn stamp(k: i64) -> Timestamp {
    k * NSEC_PER_SEC / 2
}

fn seconds(k: i64) -> f64 {
    k as f64 * 0.5
}

fn frame(k: i64) -> SwarmFrame {
    let ts = stamp(k);
    let t = seconds(k);
    let d = (truth(1, t).position() - truth(2, t).position()).norm();
    SwarmFrame::from_nodes(
        ts,
        [
            NodeFrame::new(1, ts, odometry(1, t)).with_distance(2, d),
            NodeFrame::new(2, ts, odometry(2, t)).with_distance(1, d),
        ],
    )
}

fn loop_at(k: i64) -> LoopConnection {
    let t = seconds(k);
    LoopConnection {
        id_a: 1,
        ts_a: stamp(k),
        self_pose_a: odometry(1, t),
        id_b: 2,
        ts_b: stamp(k),
        self_pose_b: odometry(2, t),
        relative_pose: Pose::delta_pose(&truth(1, t), &truth(2, t), true),
    }
}

fn config() -> SolverConfig {
    SolverConfig {
        min_frame_number: 6,
        max_frame_number: 12,
        init_trial: 8,
        seed: Some(42),
        thread_num: 2,
        max_solver_time: 5.0,
        ..SolverConfig::for_drone(1)
    }
}

#[test]
fn two_drones_with_loops_converge_to_truth() {
    let mut engine = SwarmLocalizer::new(config()).expect("engine");
    let mut costs = Vec::new();
    for k in 0..30 {
        engine.add_new_swarm_frame(frame(k));
        if k % 3 == 0 {
            engine.add_new_loop_connection(loop_at(k));
        }
        costs.push(engine.solve());
        assert!(engine.window().len() <= engine.config().max_frame_number);
    }

    // Nothing is solved before the window holds enough keyframes.
    assert!(costs[..5].iter().all(|c| *c == -1.0));
    assert!(engine.is_ready(), "costs: {:?}", costs);
    let last = *costs.last().expect("cost");
    assert!(last >= 0.0 && last < engine.config().acpt_cost);

    // Predictions for the newest stamp match the ground truth.
    let probe = frame(29);
    let state = engine.predict_swarm(&probe);
    assert_eq!(state.ts, probe.ts);
    for id in [1, 2] {
        let p = &state.node_poses[&id];
        let gt = truth(id, seconds(29));
        assert!((p.pose.position() - gt.position()).norm() < 0.3, "drone {} at {}", id, p.pose);
        assert_abs_diff_eq!(wrap_angle(p.pose.yaw() - gt.yaw()), 0.0, epsilon = 0.1);
    }

    let offset = state.coordinate_offsets[&2];
    assert!((offset.position() - drone2_origin().position()).norm() < 0.3);
    assert_abs_diff_eq!(wrap_angle(offset.yaw() - drone2_origin().yaw()), 0.0, epsilon = 0.1);
    assert!(engine.stats().solve_count > 0);
    assert!(engine.curated().loop_count() > 0);
}

#[test]
fn resolving_without_new_data_returns_cached_cost() {
    let mut engine = SwarmLocalizer::new(config()).expect("engine");
    for k in 0..12 {
        engine.add_new_swarm_frame(frame(k));
        if k % 3 == 0 {
            engine.add_new_loop_connection(loop_at(k));
        }
    }
    let first = engine.solve();
    let runs = engine.stats().solve_count;
    assert_eq!(engine.solve(), first);
    assert_eq!(engine.stats().solve_count, runs);

    // A new measurement alone triggers another solve.
    engine.add_new_loop_connection(loop_at(11));
    engine.solve();
    assert_eq!(engine.stats().solve_count, runs + 1);
}

#[test]
fn hovering_swarm_without_loops_stays_pending() {
    let mut engine = SwarmLocalizer::new(config()).expect("engine");
    for k in 0..20 {
        // Self drifts slowly along x only: enough for keyframes, not for a bounding box.
        let ts = stamp(k);
        let self_pose = Pose::from_xyz_yaw(Vector3::new(0.3 * k as f64, 0.0, 1.0), 0.0);
        let other = Pose::from_xyz_yaw(Vector3::new(0.0, 4.0, 1.0), 0.0);
        let d = (self_pose.position() - Vector3::new(0.0, 4.0, 1.0)).norm();
        engine.add_new_swarm_frame(SwarmFrame::from_nodes(
            ts,
            [
                NodeFrame::new(1, ts, self_pose).with_distance(2, d),
                NodeFrame::new(2, ts, other),
            ],
        ));
        assert_eq!(engine.solve(), -1.0);
    }
    assert!(!engine.is_ready());
    assert!(engine.predict_node(&NodeFrame::new(2, 0, Pose::identity())).is_none());
    assert!(matches!(
        engine.try_solve(),
        Err(LocalizationError::InsufficientEvidence(Pending::NotObservable))
    ));
}

#[test]
fn shared_handle_serves_predictions_while_solving() {
    let shared = SharedLocalizer::new(SwarmLocalizer::new(config()).expect("engine"));
    let writer = shared.clone();
    let probe = frame(0);

    std::thread::scope(|s| {
        s.spawn(move || {
            for k in 0..20 {
                writer.add_new_swarm_frame(frame(k));
                if k % 3 == 0 {
                    writer.add_new_loop_connection(loop_at(k));
                }
                writer.solve();
            }
        });
        for _ in 0..200 {
            let state = shared.predict_swarm(&probe);
            // Either nothing yet, or a complete answer for both robots.
            assert!(state.node_poses.is_empty() || state.node_poses.len() == 2);
            std::thread::yield_now();
        }
    });

    assert!(shared.is_ready());
    assert!(shared.node_coordinate_offset(2).is_some());
    assert_eq!(shared.with_engine(|e| e.window().len()), 12);
}

#[test]
fn single_drone_initializes_from_its_own_motion() {
    let mut engine = SwarmLocalizer::new(SolverConfig {
        min_frame_number: 10,
        max_frame_number: 20,
        ..config()
    })
    .expect("engine");
    for k in 0..15 {
        let ts = stamp(k);
        engine.add_new_swarm_frame(SwarmFrame::from_nodes(ts, [NodeFrame::new(1, ts, truth(1, seconds(k)))]));
        engine.solve();
    }
    assert_eq!(engine.window().len(), 15);
    assert!(engine.is_ready());
    assert!(engine.cost_now() <= engine.config().acpt_cost);
}

#[test]
fn two_drones_initialize_from_motion_and_ranges_alone() {
    let mut engine = SwarmLocalizer::new(config()).expect("engine");
    for k in 0..30 {
        engine.add_new_swarm_frame(frame(k));
        engine.solve();
    }
    assert!(engine.curated().measurements.is_empty());
    assert!(engine.observability().is_pos_observable(2));
    assert!(engine.is_ready(), "cost {}", engine.cost_now());
}

/// Both drones circle tightly: their bounding boxes stay under the motion threshold.
fn small_truth(id: DroneId, k: i64) -> Pose {
    let a = 0.35 * k as f64;
    match id {
        1 => Pose::from_xyz_yaw(Vector3::new(0.8 * a.cos(), 0.8 * a.sin(), 1.0), wrap_angle(a)),
        _ => Pose::from_xyz_yaw(Vector3::new(4.0 + 0.8 * a.sin(), 0.8 * a.cos(), 1.2), wrap_angle(-a)),
    }
}

fn small_odometry(id: DroneId, k: i64) -> Pose {
    match id {
        1 => small_truth(1, k),
        _ => drone2_origin().inverse() * small_truth(2, k),
    }
}

#[test]
fn one_loop_makes_small_motion_swarm_observable() {
    let mut engine = SwarmLocalizer::new(config()).expect("engine");
    for k in 0..8 {
        let ts = stamp(k);
        let d = (small_truth(1, k).position() - small_truth(2, k).position()).norm();
        engine.add_new_swarm_frame(SwarmFrame::from_nodes(
            ts,
            [
                NodeFrame::new(1, ts, small_odometry(1, k)).with_distance(2, d),
                NodeFrame::new(2, ts, small_odometry(2, k)).with_distance(1, d),
            ],
        ));
    }
    assert!(engine.window().extent(1).x < engine.config().init_xy_movement);
    assert_eq!(engine.solve(), -1.0);

    engine.add_new_loop_connection(LoopConnection {
        id_a: 1,
        ts_a: stamp(4),
        self_pose_a: small_odometry(1, 4),
        id_b: 2,
        ts_b: stamp(4),
        self_pose_b: small_odometry(2, 4),
        relative_pose: Pose::delta_pose(&small_truth(1, 4), &small_truth(2, 4), true),
    });
    let cost = engine.solve();
    assert!(engine.observability().enable_to_init);
    assert!(engine.observability().loop_observable.contains(&2));
    assert!(cost >= 0.0);
    assert!(engine.is_ready(), "cost {}", cost);
}

#[test]
fn outlier_loop_is_rejected_after_convergence() {
    let mut engine = SwarmLocalizer::new(config()).expect("engine");
    for k in 0..20 {
        engine.add_new_swarm_frame(frame(k));
        if k % 3 == 0 {
            engine.add_new_loop_connection(loop_at(k));
        }
        engine.solve();
    }
    assert!(engine.is_ready());
    let rejected_before = engine.curated().rejected;

    // Same endpoints as a good loop, but drone 2 claimed 3 m further away.
    let good = loop_at(18);
    let shifted = good.relative_pose * Pose::from_xyz_yaw(Vector3::new(3.0, 0.0, 0.0), 0.0);
    engine.add_new_loop_connection(LoopConnection {
        relative_pose: shifted,
        ..good
    });
    let cost = engine.solve();

    assert_eq!(engine.curated().rejected, rejected_before + 1);
    assert!(engine.is_ready());
    assert!(cost < engine.config().acpt_cost);
}

/// `frame(k)` with both range readings replaced by `d`.
fn frame_with_range(k: i64, d: f64) -> SwarmFrame {
    let ts = stamp(k);
    let t = seconds(k);
    SwarmFrame::from_nodes(
        ts,
        [
            NodeFrame::new(1, ts, odometry(1, t)).with_distance(2, d),
            NodeFrame::new(2, ts, odometry(2, t)).with_distance(1, d),
        ],
    )
}

#[test]
fn divergence_demotes_and_reinitializes() {
    let mut engine = SwarmLocalizer::new(SolverConfig {
        random_eviction: false,
        ..config()
    })
    .expect("engine");
    for k in 0..20 {
        engine.add_new_swarm_frame(frame(k));
        if k % 3 == 0 {
            engine.add_new_loop_connection(loop_at(k));
        }
        engine.solve();
    }
    assert!(engine.is_ready());
    let before = engine.stats().trial_count;

    // Ranges no trajectory can explain push the fit past the acceptance cost.
    engine.add_new_swarm_frame(frame_with_range(20, 500.0));
    let cost = engine.solve();
    assert!(cost > engine.config().acpt_cost, "cost {}", cost);
    assert!(!engine.is_ready());
    let state = engine.predict_swarm(&frame(20));
    assert!(state.node_poses.is_empty());
    assert!(state.coordinate_offsets.is_empty());

    for k in 21..23 {
        engine.add_new_swarm_frame(frame_with_range(k, 500.0));
        engine.solve();
        assert!(!engine.is_ready());
    }
    // The restart search ran again.
    assert!(engine.stats().trial_count > before + 1);

    // Once the corrupt keyframes leave the window the swarm recovers.
    for k in 23..40 {
        engine.add_new_swarm_frame(frame(k));
        if k % 3 == 0 {
            engine.add_new_loop_connection(loop_at(k));
        }
        engine.solve();
    }
    assert!(engine.window().frames().all(|sf| sf.ts >= stamp(23)));
    assert!(engine.is_ready(), "cost {}", engine.cost_now());
    let probe = frame(39);
    let state = engine.predict_swarm(&probe);
    for id in [1, 2] {
        let p = &state.node_poses[&id];
        assert!((p.pose.position() - truth(id, seconds(39)).position()).norm() < 0.3);
    }
}
