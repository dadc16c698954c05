// swarmloc_core/src/optimization/graph.rs

//! Assembles the swarm pose graph from the window, the parameter arena, the
//! curated measurements and the observability flags.

use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::SolverConfig;
use crate::error::SolverError;
use crate::estimation::curator::Measurement2Drones;
use crate::estimation::observability::Observability;
use crate::estimation::window::SlidingWindow;
use crate::frames::{NodeFrame, SwarmFrame};
use crate::optimization::params::{ParameterSet, PoseArena, PoseHandle};
use crate::optimization::problem::Problem;
use crate::optimization::residuals::{
    HorizonEdge, HorizonResidual, HuberLoss, LoopResidual, LoopSigmas, SwarmFrameResidual,
};
use crate::pose::Pose;
use crate::types::{DroneId, Timestamp};

fn not_moving(previous: &Vector3<f64>, nf: &NodeFrame, config: &SolverConfig) -> bool {
    (nf.position() - previous).norm() <= config.not_moving_thres
}

/// Decides which ranges take part in the solve.
///
/// Every range of the first keyframe is used. In later keyframes a range is
/// only used if one of its two endpoints moved since the previous keyframe,
/// and only one direction of a reciprocal pair is kept.
pub fn cutting_edges(window: &mut SlidingWindow, config: &SolverConfig) -> usize {
    let mut enabled = 0;
    // Node positions of the previous keyframe; `None` before the first one.
    let mut previous: Option<BTreeMap<DroneId, Vector3<f64>>> = None;

    for sf in window.frames_mut() {
        let moved: BTreeSet<DroneId> = match &previous {
            None => sf.node_ids().collect(),
            Some(last) => sf
                .nodes
                .values()
                .filter(|nf| last.get(&nf.id).map_or(true, |prev| !not_moving(prev, nf, config)))
                .map(|nf| nf.id)
                .collect(),
        };
        let is_first = previous.is_none();
        for nf in sf.nodes.values_mut() {
            nf.enabled_dists.clear();
        }

        let ids: Vec<DroneId> = sf.node_ids().collect();
        for id in ids {
            let targets: Vec<DroneId> = sf.nodes[&id].dists.keys().copied().collect();
            for to in targets {
                let reciprocal_enabled = sf.distance_enabled(to, id);
                let use_it = config.enable_distance
                    && (is_first
                        || ((moved.contains(&id) || moved.contains(&to))
                            && sf.has_node(to)
                            && !reciprocal_enabled));
                if let Some(nf) = sf.node_mut(id) {
                    nf.enabled_dists.insert(to, use_it);
                }
                enabled += use_it as usize;
            }
        }
        previous = Some(sf.nodes.values().map(|nf| (nf.id, *nf.position())).collect());
    }
    enabled
}

/// Range used for an enabled edge: the mean of both directions when both exist.
fn merged_distance(sf: &SwarmFrame, from: DroneId, to: DroneId) -> Option<f64> {
    let d = sf.distance(from, to)?;
    Some(match sf.distance(to, from) {
        Some(back) => 0.5 * (d + back),
        None => d,
    })
}

pub struct PoseGraphBuilder<'a> {
    pub window: &'a SlidingWindow,
    pub arena: &'a PoseArena,
    pub values: &'a ParameterSet,
    pub observability: &'a Observability,
    pub measurements: &'a [Measurement2Drones],
    pub self_id: DroneId,
    pub config: &'a SolverConfig,
}

impl<'a> PoseGraphBuilder<'a> {
    fn handle(&self, ts: Timestamp, id: DroneId) -> Result<PoseHandle, SolverError> {
        self.arena
            .handle(ts, id)
            .ok_or(SolverError::MissingParameterBlock { ts, id })
    }

    fn value(&self, ts: Timestamp, id: DroneId, handle: PoseHandle) -> Result<[f64; 4], SolverError> {
        self.values
            .get(handle)
            .or_else(|| self.arena.get(handle))
            .copied()
            .ok_or(SolverError::MissingParameterBlock { ts, id })
    }

    fn huber(&self) -> Option<HuberLoss> {
        Some(HuberLoss::new(self.config.huber_delta))
    }

    pub fn build(&self) -> Result<Problem, SolverError> {
        let mut problem = Problem::new();
        for sf in self.window.frames() {
            self.add_swarm_frame(&mut problem, sf)?;
        }
        for id in self.window.drone_ids() {
            self.add_horizon(&mut problem, id)?;
        }
        self.add_loops(&mut problem)?;
        Ok(problem)
    }

    fn add_swarm_frame(&self, problem: &mut Problem, sf: &SwarmFrame) -> Result<(), SolverError> {
        let mut handles = Vec::with_capacity(sf.len());
        for id in sf.node_ids() {
            let h = self.handle(sf.ts, id)?;
            problem.add_parameter_block(h, self.value(sf.ts, id, h)?, self.observability.dof(id));
            handles.push((id, h));
        }

        let index_of = |id: DroneId| handles.iter().position(|(i, _)| *i == id);
        let mut ranges = Vec::new();
        for nf in sf.nodes.values() {
            for &to in nf.dists.keys() {
                if !nf.distance_enabled(to) {
                    continue;
                }
                if let (Some(i), Some(j), Some(d)) = (index_of(nf.id), index_of(to), merged_distance(sf, nf.id, to)) {
                    ranges.push((i, j, d));
                }
            }
        }

        if !ranges.is_empty() {
            let block = SwarmFrameResidual::new(handles.len(), ranges, self.config.distance_measure_error);
            let hs: Vec<PoseHandle> = handles.iter().map(|(_, h)| *h).collect();
            problem.add_residual_block(Box::new(block), self.huber(), &hs)?;
        }
        Ok(())
    }

    fn add_horizon(&self, problem: &mut Problem, id: DroneId) -> Result<(), SolverError> {
        let mut pose_win: Vec<PoseHandle> = Vec::new();
        let mut nf_win: Vec<&NodeFrame> = Vec::new();
        for (ts, nf) in self.window.node_frames(id) {
            if nf.is_static {
                return Ok(());
            }
            let h = self.handle(ts, id)?;
            if pose_win.last() != Some(&h) {
                pose_win.push(h);
                nf_win.push(nf);
            }
        }

        if id == self.self_id {
            if let Some(first) = pose_win.first() {
                problem.set_parameter_block_constant(*first);
            }
        }
        if pose_win.len() < 2 {
            return Ok(());
        }

        let edges = nf_win
            .windows(2)
            .map(|pair| HorizonEdge {
                vo_delta: Pose::delta_pose(&pair[0].self_pose, &pair[1].self_pose, true),
                position_var: pair[1].position_cov_to_last,
                yaw_var: pair[1].yaw_cov_to_last,
            })
            .collect();
        let block = HorizonResidual::new(edges, self.observability.is_yaw_observable(id));
        problem.add_residual_block(Box::new(block), None, &pose_win)
    }

    fn add_loops(&self, problem: &mut Problem) -> Result<(), SolverError> {
        if self.measurements.is_empty() {
            return Ok(());
        }
        let mut handles: Vec<PoseHandle> = Vec::new();
        let mut slot = |h: PoseHandle| match handles.iter().position(|x| *x == h) {
            Some(i) => i,
            None => {
                handles.push(h);
                handles.len() - 1
            }
        };

        let mut entries = Vec::with_capacity(self.measurements.len());
        for m in self.measurements {
            let ha = self.handle(m.kf_ts_a, m.id_a)?;
            let hb = self.handle(m.kf_ts_b, m.id_b)?;
            entries.push((slot(ha), slot(hb), m.clone()));
        }

        let sigmas = LoopSigmas {
            xy: self.config.loop_cov_xy,
            z: self.config.loop_cov_z,
            yaw: self.config.loop_yaw_cov,
            sphere: self.config.detection_sphere_cov,
            inv_dep: self.config.detection_inv_dep_cov,
        };
        let block = LoopResidual::new(handles.len(), entries, sigmas);
        problem.add_residual_block(Box::new(block), self.huber(), &handles)
    }
}
