// swarmloc_sim/src/scenario.rs

//! Drives a `SharedLocalizer` with synthetic data generated from a scenario:
//! ground-truth motion, drifting odometry, noisy ranges, loop closures and
//! detections.

use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::BTreeMap;
use std::path::Path;
use swarmloc_core::prelude::*;
use swarmloc_core::pose::wrap_angle;
use swarmloc_core::types::sec_to_ts;

use crate::config::{DroneConfig, ScenarioConfig};
use crate::error::SimError;
use crate::report::{DroneReport, RunReport};

/// Zero-mean Gaussian sources for every synthetic sensor.
#[derive(Debug, Clone)]
struct NoiseModel {
    odom_drift: Normal<f64>,
    odom_yaw_drift: Normal<f64>,
    range: Normal<f64>,
    loop_position: Normal<f64>,
    loop_yaw: Normal<f64>,
    bearing: Normal<f64>,
}

impl NoiseModel {
    fn new(config: &ScenarioConfig) -> Result<Self, SimError> {
        let n = &config.noise;
        Ok(Self {
            odom_drift: Normal::new(0.0, n.odom_drift_per_meter)?,
            odom_yaw_drift: Normal::new(0.0, n.odom_yaw_drift_per_meter)?,
            range: Normal::new(0.0, n.range)?,
            loop_position: Normal::new(0.0, n.loop_position)?,
            loop_yaw: Normal::new(0.0, n.loop_yaw)?,
            bearing: Normal::new(0.0, n.bearing)?,
        })
    }
}

fn sample_vec3<R: Rng>(dist: &Normal<f64>, rng: &mut R, scale: f64) -> Vector3<f64> {
    Vector3::new(dist.sample(rng), dist.sample(rng), dist.sample(rng)) * scale
}

/// Accumulated odometry error of one drone.
#[derive(Debug, Clone, Copy)]
struct DriftState {
    last_truth: Pose,
    position: Vector3<f64>,
    yaw: f64,
}

/// Running squared-error sums of one drone.
#[derive(Debug, Clone, Copy, Default)]
struct ErrorAccumulator {
    samples: usize,
    position_sq: f64,
    yaw_sq: f64,
}

pub struct ScenarioRunner {
    config: ScenarioConfig,
    localizer: SharedLocalizer,
    aggregator: FrameAggregator,
    rng: ChaCha8Rng,
    noise: NoiseModel,
    drift: BTreeMap<DroneId, DriftState>,
    errors: BTreeMap<DroneId, ErrorAccumulator>,
    loops_sent: usize,
    detections_sent: usize,
    first_ready_s: Option<f64>,
    last_cost: f64,
}

impl ScenarioRunner {
    pub fn new(config: ScenarioConfig) -> Result<Self, SimError> {
        config.check()?;
        let localizer = SharedLocalizer::new(SwarmLocalizer::new(config.solver.clone())?);
        let mut aggregator = FrameAggregator::from_config(&config.solver);
        for d in config.drones.iter().filter(|d| d.is_static()) {
            aggregator.mark_static(d.id);
        }
        let rng = match config.simulation.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let noise = NoiseModel::new(&config)?;
        let drift = config
            .drones
            .iter()
            .map(|d| {
                (
                    d.id,
                    DriftState {
                        last_truth: d.ground_truth(0.0),
                        position: Vector3::zeros(),
                        yaw: 0.0,
                    },
                )
            })
            .collect();

        Ok(Self {
            config,
            localizer,
            aggregator,
            rng,
            noise,
            drift,
            errors: BTreeMap::new(),
            loops_sent: 0,
            detections_sent: 0,
            first_ready_s: None,
            last_cost: -1.0,
        })
    }

    pub fn localizer(&self) -> &SharedLocalizer {
        &self.localizer
    }

    pub fn frame_count(&self) -> usize {
        (self.config.simulation.duration_seconds * self.config.simulation.frame_rate).floor() as usize
    }

    /// Odometry reading of a drone: the ground truth seen from its odometry
    /// origin, plus the drift accumulated along the travelled path.
    fn odometry(&mut self, drone: &DroneConfig, t: f64) -> Pose {
        let truth = drone.ground_truth(t);
        let clean = drone.odom_origin.to_pose().inverse() * truth;
        let Some(state) = self.drift.get_mut(&drone.id) else {
            return clean;
        };
        let travelled = (truth.position() - state.last_truth.position()).norm();
        if travelled > 0.0 {
            state.position += sample_vec3(&self.noise.odom_drift, &mut self.rng, travelled);
            state.yaw += self.noise.odom_yaw_drift.sample(&mut self.rng) * travelled;
        }
        state.last_truth = truth;
        Pose::from_xyz_yaw(clean.position() + state.position, wrap_angle(clean.yaw() + state.yaw))
    }

    fn chance(&mut self, rate_hz: f64) -> bool {
        let p = (rate_hz / self.config.simulation.frame_rate).clamp(0.0, 1.0);
        p > 0.0 && self.rng.gen_bool(p)
    }

    /// Advances the scenario by one frame.
    pub fn step(&mut self, k: usize) -> Result<(), SimError> {
        let t = k as f64 / self.config.simulation.frame_rate;
        let ts = sec_to_ts(t);
        let drones = self.config.drones.clone();

        let mut truth = BTreeMap::new();
        let mut odom = BTreeMap::new();
        for d in &drones {
            let vo = self.odometry(d, t);
            self.aggregator.push_odometry(d.id, ts, vo);
            truth.insert(d.id, d.ground_truth(t));
            odom.insert(d.id, vo);
        }

        // --- Ranges ---
        for a in &drones {
            for b in &drones {
                if a.id == b.id {
                    continue;
                }
                let d = (truth[&a.id].position() - truth[&b.id].position()).norm();
                if d <= self.config.simulation.range_max_distance {
                    let noisy = d + self.noise.range.sample(&mut self.rng);
                    self.aggregator.push_distance(a.id, b.id, ts, noisy.max(0.0));
                }
            }
        }

        if let Some(frame) = self.aggregator.build_frame(ts) {
            self.localizer.add_new_swarm_frame(frame);
        }

        // --- Loops and detections ---
        for a in &drones {
            for b in &drones {
                if a.id == b.id {
                    continue;
                }
                let (ta, tb) = (truth[&a.id], truth[&b.id]);
                if (ta.position() - tb.position()).norm() > self.config.simulation.loop_max_distance {
                    continue;
                }
                if a.id < b.id && self.chance(self.config.simulation.loop_rate) {
                    self.send_loop(a.id, b.id, ts, &ta, &tb, &odom);
                }
                if self.chance(self.config.simulation.detection_rate) {
                    self.send_detection(a.id, b.id, ts, &ta, &tb, &odom);
                }
            }
        }

        if k % self.config.simulation.solve_every == 0 {
            self.last_cost = self.localizer.solve();
            if self.first_ready_s.is_none() && self.localizer.is_ready() {
                self.first_ready_s = Some(t);
                tracing::info!(t, cost = self.last_cost, "Swarm localization ready");
            }
        }

        self.accumulate_errors(ts, &truth, &odom);
        Ok(())
    }

    fn send_loop(&mut self, a: DroneId, b: DroneId, ts: Timestamp, ta: &Pose, tb: &Pose, odom: &BTreeMap<DroneId, Pose>) {
        let rel = Pose::delta_pose(ta, tb, true);
        let noisy = Pose::from_xyz_yaw(
            rel.position() + sample_vec3(&self.noise.loop_position, &mut self.rng, 1.0),
            wrap_angle(rel.yaw() + self.noise.loop_yaw.sample(&mut self.rng)),
        );
        self.localizer.add_new_loop_connection(LoopConnection {
            id_a: a,
            ts_a: ts,
            self_pose_a: odom[&a],
            id_b: b,
            ts_b: ts,
            self_pose_b: odom[&b],
            relative_pose: noisy,
        });
        self.loops_sent += 1;
    }

    fn send_detection(&mut self, a: DroneId, b: DroneId, ts: Timestamp, ta: &Pose, tb: &Pose, odom: &BTreeMap<DroneId, Pose>) {
        let rel = Pose::delta_pose(ta, tb, true);
        let dist = rel.position().norm();
        if dist < 1e-3 {
            return;
        }
        let bearing = rel.position() / dist + sample_vec3(&self.noise.bearing, &mut self.rng, 1.0);
        self.localizer.add_new_detection(DroneDetection {
            id_a: a,
            ts_a: ts,
            self_pose_a: odom[&a],
            id_b: b,
            ts_b: ts,
            self_pose_b: odom[&b],
            bearing,
            inv_dep: Some(1.0 / dist),
        });
        self.detections_sent += 1;
    }

    fn accumulate_errors(&mut self, ts: Timestamp, truth: &BTreeMap<DroneId, Pose>, odom: &BTreeMap<DroneId, Pose>) {
        if !self.localizer.is_ready() {
            return;
        }
        let probe = SwarmFrame::from_nodes(ts, odom.iter().map(|(id, vo)| NodeFrame::new(*id, ts, *vo)));
        let state = self.localizer.predict_swarm(&probe);
        for (id, predicted) in &state.node_poses {
            let Some(gt) = truth.get(id) else {
                continue;
            };
            let acc = self.errors.entry(*id).or_default();
            acc.samples += 1;
            acc.position_sq += (predicted.pose.position() - gt.position()).norm_squared();
            acc.yaw_sq += wrap_angle(predicted.pose.yaw() - gt.yaw()).powi(2);
        }
    }

    /// Runs the whole scenario and summarizes it.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        let frames = self.frame_count();
        tracing::info!(frames, drones = self.config.drones.len(), "Starting scenario");
        for k in 0..frames {
            self.step(k)?;
        }
        // One last solve so the report reflects every frame.
        self.last_cost = self.localizer.solve();
        Ok(self.report(frames))
    }

    pub fn report(&self, frames: usize) -> RunReport {
        let (stats, window_size) = self
            .localizer
            .with_engine(|e| (e.stats().clone(), e.window().len()));
        let drones = self
            .config
            .drones
            .iter()
            .map(|d| {
                let acc = self.errors.get(&d.id).copied().unwrap_or_default();
                let rmse = |sum: f64| {
                    if acc.samples > 0 {
                        Some((sum / acc.samples as f64).sqrt())
                    } else {
                        None
                    }
                };
                DroneReport {
                    id: d.id,
                    samples: acc.samples,
                    position_rmse: rmse(acc.position_sq),
                    yaw_rmse_deg: rmse(acc.yaw_sq).map(f64::to_degrees),
                }
            })
            .collect();

        RunReport {
            frames,
            window_size,
            loops_sent: self.loops_sent,
            detections_sent: self.detections_sent,
            ready: self.localizer.is_ready(),
            first_ready_s: self.first_ready_s,
            final_cost: self.last_cost,
            solve_count: stats.solve_count,
            trial_count: stats.trial_count,
            total_solve_time_s: stats.total_solve_time.as_secs_f64(),
            drones,
        }
    }

    pub fn write_pose_graph_dot(&self, path: &Path) -> Result<(), SimError> {
        self.localizer.with_engine(|e| e.write_pose_graph_dot(path))?;
        Ok(())
    }
}
