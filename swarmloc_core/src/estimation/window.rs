// swarmloc_core/src/estimation/window.rs

use nalgebra::Vector3;
use rand::Rng;
use std::collections::{BTreeSet, VecDeque};

use crate::config::SolverConfig;
use crate::frames::{NodeFrame, SwarmFrame};
use crate::types::{DroneId, Timestamp};

/// The bounded, time-ordered sequence of keyframes under optimization.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    frames: VecDeque<SwarmFrame>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> impl DoubleEndedIterator<Item = &SwarmFrame> + ExactSizeIterator {
        self.frames.iter()
    }

    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut SwarmFrame> {
        self.frames.iter_mut()
    }

    pub fn get(&self, i: usize) -> Option<&SwarmFrame> {
        self.frames.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut SwarmFrame> {
        self.frames.get_mut(i)
    }

    pub fn first(&self) -> Option<&SwarmFrame> {
        self.frames.front()
    }

    pub fn last(&self) -> Option<&SwarmFrame> {
        self.frames.back()
    }

    pub fn frame_by_ts(&self, ts: Timestamp) -> Option<&SwarmFrame> {
        self.frames.iter().find(|sf| sf.ts == ts)
    }

    /// Appends a keyframe. Each node starts with one keyframe interval of drift.
    pub fn push(&mut self, mut frame: SwarmFrame, config: &SolverConfig) {
        for nf in frame.nodes.values_mut() {
            nf.reset_drift(config);
        }
        self.frames.push_back(frame);
    }

    /// Removes keyframe `i`. Robots that had odometry in both the removed frame
    /// and the one after it lose that intermediate constraint, so their edge
    /// drift in the following frame grows by one interval.
    pub fn delete_frame(&mut self, i: usize, config: &SolverConfig) -> Option<SwarmFrame> {
        let removed = self.frames.remove(i)?;
        if let Some(next) = self.frames.get_mut(i) {
            for (id, nf) in next.nodes.iter_mut() {
                if nf.vo_available && removed.has_odometry(*id) {
                    nf.inflate_drift(config);
                }
            }
        }
        Some(removed)
    }

    /// Evicts keyframes until the window fits `max_frame_number`. Returns the
    /// removed frames in eviction order.
    pub fn evict_overflow<R: Rng>(&mut self, config: &SolverConfig, rng: &mut R) -> Vec<SwarmFrame> {
        let mut evicted = Vec::new();
        while self.frames.len() > config.max_frame_number {
            // Random eviction never touches the newest keyframes.
            let index = if config.random_eviction {
                rng.gen_range(0..config.max_frame_number - 1)
            } else {
                0
            };
            if let Some(sf) = self.delete_frame(index, config) {
                tracing::debug!(index, ts = sf.ts, size = self.frames.len(), "Evicted keyframe from sliding window");
                evicted.push(sf);
            }
        }
        evicted
    }

    /// Replaces the newest keyframe. The replacement's edge drift covers the
    /// span of the dropped frame as well.
    pub fn replace_last(&mut self, frame: SwarmFrame, config: &SolverConfig) -> Option<SwarmFrame> {
        let removed = self.frames.pop_back()?;
        self.push(frame, config);
        if let Some(new_last) = self.frames.back_mut() {
            for (id, nf) in new_last.nodes.iter_mut() {
                if nf.vo_available && removed.has_odometry(*id) {
                    nf.inflate_drift(config);
                }
            }
        }
        Some(removed)
    }

    /// Every robot with a node in some keyframe.
    pub fn drone_ids(&self) -> BTreeSet<DroneId> {
        self.frames.iter().flat_map(|sf| sf.node_ids()).collect()
    }

    /// The node frames of one robot, oldest first, together with the keyframe stamp.
    pub fn node_frames(&self, id: DroneId) -> impl Iterator<Item = (Timestamp, &NodeFrame)> + '_ {
        self.frames
            .iter()
            .filter_map(move |sf| sf.node(id).map(|nf| (sf.ts, nf)))
    }

    /// Axis-aligned bounding box of a robot's odometry positions.
    pub fn bounding_box(&self, id: DroneId) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let mut positions = self
            .node_frames(id)
            .filter(|(_, nf)| nf.vo_available)
            .map(|(_, nf)| *nf.position());
        let first = positions.next()?;
        Some(positions.fold((first, first), |(lo, hi), p| (lo.inf(&p), hi.sup(&p))))
    }

    /// Extent of the bounding box, zero if the robot never had odometry.
    pub fn extent(&self, id: DroneId) -> Vector3<f64> {
        self.bounding_box(id)
            .map(|(lo, hi)| hi - lo)
            .unwrap_or_else(Vector3::zeros)
    }

    /// Index of the keyframe whose node of `id` is closest in time to `ts`,
    /// with the absolute time difference.
    pub fn nearest_frame(&self, id: DroneId, ts: Timestamp) -> Option<(usize, Timestamp)> {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(i, sf)| sf.node(id).map(|nf| (i, (nf.ts - ts).abs())))
            .min_by_key(|(_, dt)| *dt)
    }
}
