// swarmloc_core/src/estimation/observability.rs

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::SolverConfig;
use crate::estimation::curator::LoopGraph;
use crate::estimation::window::SlidingWindow;
use crate::types::DroneId;

/// Which robot states the current window can determine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observability {
    pub pos_observable: BTreeMap<DroneId, bool>,
    pub yaw_observable: BTreeMap<DroneId, bool>,
    /// True when an initialization attempt is worthwhile.
    pub enable_to_init: bool,
    /// Robots reachable from the local robot through the loop graph.
    pub loop_observable: BTreeSet<DroneId>,
}

impl Observability {
    pub fn is_yaw_observable(&self, id: DroneId) -> bool {
        self.yaw_observable.get(&id).copied().unwrap_or(false)
    }

    pub fn is_pos_observable(&self, id: DroneId) -> bool {
        self.pos_observable.get(&id).copied().unwrap_or(false)
    }

    /// Parameter block size for a robot: yaw is held fixed when unobservable.
    pub fn dof(&self, id: DroneId) -> usize {
        if self.is_yaw_observable(id) {
            4
        } else {
            3
        }
    }
}

/// Breadth-first traversal of the loop graph starting at `self_id`.
pub fn loop_observable_set(loop_edges: &LoopGraph, self_id: DroneId) -> BTreeSet<DroneId> {
    let mut reached = BTreeSet::from([self_id]);
    let mut queue = VecDeque::from([self_id]);
    while let Some(id) = queue.pop_front() {
        for &next in loop_edges.get(&id).into_iter().flatten() {
            if reached.insert(next) {
                queue.push_back(next);
            }
        }
    }
    reached
}

pub fn estimate_observability(
    window: &SlidingWindow,
    loop_edges: &LoopGraph,
    self_id: DroneId,
    config: &SolverConfig,
) -> Observability {
    let nodes = window.drone_ids();
    let mut obs = Observability {
        pos_observable: nodes.iter().map(|id| (*id, false)).collect(),
        yaw_observable: nodes.iter().map(|id| (*id, false)).collect(),
        ..Default::default()
    };

    // --- Self motion ---
    let extent = window.extent(self_id);
    if extent.x > config.init_xy_movement
        && extent.y > config.init_xy_movement
        && extent.z >= config.init_z_movement
    {
        obs.enable_to_init = true;
        for v in obs.pos_observable.values_mut() {
            *v = true;
        }
        tracing::debug!(?extent, "Self motion is large enough to initialize");
    }

    // --- Loop connectivity ---
    obs.loop_observable = loop_observable_set(loop_edges, self_id);

    if window.len() > config.single_drone_sfs_thres && nodes.len() == 1 {
        obs.enable_to_init = true;
        tracing::debug!("Single drone in window, initializing from self motion");
    }

    if !obs.enable_to_init && nodes.len() >= 2 && nodes.is_subset(&obs.loop_observable) {
        obs.enable_to_init = true;
        tracing::debug!("Every drone is reachable through loops");
    }

    for id in &obs.loop_observable {
        if nodes.contains(id) {
            obs.pos_observable.insert(*id, true);
            obs.yaw_observable.insert(*id, true);
        }
    }

    // --- Per-drone yaw from own motion ---
    for id in &nodes {
        let e = window.extent(*id);
        if e.x > config.thres_yaw_obser_xy || e.y > config.thres_yaw_obser_xy {
            obs.yaw_observable.insert(*id, true);
        }
    }

    tracing::debug!(
        enable_to_init = obs.enable_to_init,
        yaw = ?obs.yaw_observable,
        loop_set = ?obs.loop_observable,
        "Estimated observability"
    );
    obs
}
